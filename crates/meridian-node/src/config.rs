//! Node configuration loaded from environment variables.
//!
//! Everything but the room name has a default, so a node can be started
//! with `MERIDIAN_ROOM=<name>` alone.

use std::path::PathBuf;

use meridian_shared::constants::DEFAULT_QUIC_PORT;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Env: `MERIDIAN_DB_PATH`
    /// Default: the platform data directory.
    pub db_path: Option<PathBuf>,

    /// Env: `MERIDIAN_ROOM`
    pub room_name: Option<String>,

    /// Env: `MERIDIAN_PASSWORD`
    pub password: Option<String>,

    /// Comma separated multiaddrs of rendezvous peers.
    /// Env: `MERIDIAN_SIGNALING_URL`
    pub signaling_url: Option<String>,

    /// QUIC port; `0` picks an ephemeral one.
    /// Env: `MERIDIAN_LISTEN_PORT`
    /// Default: `4101`
    pub listen_port: u16,

    /// Env: `MERIDIAN_DISPLAY_NAME`
    /// Default: `"Meridian Node"`
    pub display_name: String,

    /// File with one bootstrap multiaddr per line.
    /// Env: `MERIDIAN_BOOTSTRAP_FILE`
    pub bootstrap_file: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            room_name: None,
            password: None,
            signaling_url: None,
            listen_port: DEFAULT_QUIC_PORT,
            display_name: "Meridian Node".to_string(),
            bootstrap_file: None,
        }
    }
}

impl NodeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        config.db_path = non_empty("MERIDIAN_DB_PATH").map(PathBuf::from);
        config.room_name = non_empty("MERIDIAN_ROOM");
        config.password = non_empty("MERIDIAN_PASSWORD");
        config.signaling_url = non_empty("MERIDIAN_SIGNALING_URL");
        config.bootstrap_file = non_empty("MERIDIAN_BOOTSTRAP_FILE").map(PathBuf::from);

        if let Some(name) = non_empty("MERIDIAN_DISPLAY_NAME") {
            config.display_name = name;
        }

        if let Some(port) = non_empty("MERIDIAN_LISTEN_PORT") {
            match port.parse::<u16>() {
                Ok(parsed) => config.listen_port = parsed,
                Err(_) => tracing::warn!(value = %port, "Invalid MERIDIAN_LISTEN_PORT, using default"),
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn reads_values_and_keeps_defaults_for_bad_ones() {
        let env: HashMap<&str, &str> = [
            ("MERIDIAN_ROOM", "kitchen"),
            ("MERIDIAN_LISTEN_PORT", "not-a-port"),
            ("MERIDIAN_PASSWORD", "  "),
            ("MERIDIAN_DB_PATH", "/tmp/meridian.db"),
        ]
        .into_iter()
        .collect();

        let config = NodeConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.room_name.as_deref(), Some("kitchen"));
        assert_eq!(config.listen_port, DEFAULT_QUIC_PORT);
        assert!(config.password.is_none());
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/meridian.db")));
        assert_eq!(config.display_name, "Meridian Node");
    }
}
