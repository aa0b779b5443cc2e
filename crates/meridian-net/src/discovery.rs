//! Signaling and bootstrap peer loading.
//!
//! A room's signaling endpoint is one or more multiaddrs of well-known nodes.
//! They are dialed on startup and seed the Kademlia table through which room
//! members find each other.

use std::fs;
use std::path::Path;

use libp2p::Multiaddr;
use tracing::{debug, info, warn};

/// Load bootstrap peer multiaddrs from a configuration file.
///
/// One multiaddr per line. Empty lines and lines starting with `#` are
/// ignored; malformed lines are logged and skipped.
///
/// ```text
/// # Meridian signaling nodes
/// /ip4/198.51.100.10/udp/4101/quic-v1/p2p/12D3KooW...
/// ```
pub fn load_bootstrap_peers(path: &Path) -> Vec<Multiaddr> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read bootstrap peers file");
            return Vec::new();
        }
    };

    let lines: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();
    let addrs = parse_multiaddrs(&lines);

    info!(count = addrs.len(), path = %path.display(), "Loaded bootstrap peers");
    addrs
}

/// Parse multiaddr strings, skipping the ones that do not parse.
pub fn parse_multiaddrs(raw: &[String]) -> Vec<Multiaddr> {
    raw.iter()
        .filter_map(|s| match s.parse::<Multiaddr>() {
            Ok(addr) => {
                debug!(addr = %addr, "Loaded bootstrap peer");
                Some(addr)
            }
            Err(e) => {
                warn!(addr = %s, error = %e, "Could not parse multiaddr");
                None
            }
        })
        .collect()
}

/// Split a signaling setting (comma or whitespace separated) into multiaddrs.
pub fn parse_signaling(signaling: &[String]) -> Vec<Multiaddr> {
    let entries: Vec<String> = signaling
        .iter()
        .flat_map(|s| s.split(|c: char| c == ',' || c.is_whitespace()))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    parse_multiaddrs(&entries)
}
