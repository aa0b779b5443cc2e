//! Peer connection tracking.
//!
//! Keeps the connected peers of one swarm and which gossip topics each of
//! them is subscribed to.

use std::collections::{HashMap, HashSet};

use libp2p::{Multiaddr, PeerId};
use tracing::debug;

/// Information about a connected peer.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer_id: PeerId,
    /// The multiaddr through which we are connected.
    pub address: Multiaddr,
    /// Unix epoch millis.
    pub connected_at: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PeerTracker {
    peers: HashMap<PeerId, ConnectionInfo>,
    topics: HashMap<String, HashSet<PeerId>>,
}

impl PeerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(&mut self, peer_id: PeerId, address: Multiaddr) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        debug!(peer = %peer_id, addr = %address, "Tracking new peer connection");

        self.peers.insert(
            peer_id,
            ConnectionInfo {
                peer_id,
                address,
                connected_at: now,
            },
        );
    }

    /// Remove a peer that has fully disconnected, along with its subscriptions.
    pub fn on_disconnected(&mut self, peer_id: &PeerId) {
        if self.peers.remove(peer_id).is_some() {
            debug!(peer = %peer_id, "Removed peer from tracker");
        }
        for members in self.topics.values_mut() {
            members.remove(peer_id);
        }
        self.topics.retain(|_, members| !members.is_empty());
    }

    pub fn on_subscribed(&mut self, peer_id: PeerId, topic: &str) {
        self.topics.entry(topic.to_string()).or_default().insert(peer_id);
    }

    pub fn on_unsubscribed(&mut self, peer_id: &PeerId, topic: &str) {
        if let Some(members) = self.topics.get_mut(topic) {
            members.remove(peer_id);
            if members.is_empty() {
                self.topics.remove(topic);
            }
        }
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&ConnectionInfo> {
        self.peers.get(peer_id)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn topic_peers(&self, topic: &str) -> Vec<PeerId> {
        self.topics
            .get(topic)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }
}
