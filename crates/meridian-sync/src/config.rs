//! Sync configuration loaded from environment variables.
//!
//! Every setting has a default so sync works with zero configuration.

use std::str::FromStr;
use std::time::Duration;

use meridian_shared::constants::{
    DEFAULT_CONNECT_ATTEMPTS, DEFAULT_CONNECT_INTERVAL_MS, DEFAULT_DEBOUNCE_MS, DEFAULT_SYNC_BATCH_SIZE,
    DEFAULT_THROTTLE_MS,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Minimum gap between two table events for the same table.
    /// Env: `MERIDIAN_SYNC_THROTTLE_MS`
    pub throttle: Duration,

    /// Quiet period after the last change before `Syncing` becomes `Synced`.
    /// Env: `MERIDIAN_SYNC_DEBOUNCE_MS`
    pub debounce: Duration,

    /// Rows per document transaction during the bulk load.
    /// Env: `MERIDIAN_SYNC_BATCH_SIZE`
    pub batch_size: usize,

    /// Connectivity polls after joining a room before giving up.
    /// Env: `MERIDIAN_CONNECT_ATTEMPTS`
    pub connect_attempts: u32,

    /// Env: `MERIDIAN_CONNECT_INTERVAL_MS`
    pub connect_interval: Duration,

    /// Used when the session parameters carry no signaling URL.
    /// Env: `MERIDIAN_SIGNALING_URL`
    pub signaling_url: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(DEFAULT_THROTTLE_MS),
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            batch_size: DEFAULT_SYNC_BATCH_SIZE,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_interval: Duration::from_millis(DEFAULT_CONNECT_INTERVAL_MS),
            signaling_url: None,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, "MERIDIAN_SYNC_THROTTLE_MS") {
            config.throttle = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "MERIDIAN_SYNC_DEBOUNCE_MS") {
            config.debounce = Duration::from_millis(ms);
        }
        if let Some(size) = parse_var::<usize>(&lookup, "MERIDIAN_SYNC_BATCH_SIZE") {
            if size == 0 {
                tracing::warn!("MERIDIAN_SYNC_BATCH_SIZE must be positive, using default");
            } else {
                config.batch_size = size;
            }
        }
        if let Some(n) = parse_var::<u32>(&lookup, "MERIDIAN_CONNECT_ATTEMPTS") {
            config.connect_attempts = n.max(1);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "MERIDIAN_CONNECT_INTERVAL_MS") {
            config.connect_interval = Duration::from_millis(ms);
        }
        if let Some(url) = lookup("MERIDIAN_SIGNALING_URL") {
            if !url.trim().is_empty() {
                config.signaling_url = Some(url);
            }
        }

        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = key, value = %raw, "Invalid value, using default");
            None
        }
    }
}
