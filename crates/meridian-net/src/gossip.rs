//! Rooms over a libp2p swarm.
//!
//! Every join spawns a fresh swarm with a fresh identity, so a reconnect never
//! shares state with the previous connection. Peers rendezvous by providing
//! the room topic in Kademlia and exchange frames over GossipSub.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use libp2p::identity::Keypair;
use libp2p::PeerId;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::discovery::parse_signaling;
use crate::room::{RoomEndpoint, RoomEvent, RoomLink, RoomSpec, RoomTransport};
use crate::swarm::{spawn_swarm, SwarmCommand, SwarmConfig, SwarmNotification};

const REDISCOVER_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct GossipTransport {
    /// `0` picks an ephemeral port per join.
    pub listen_port: u16,
}

impl GossipTransport {
    pub fn new(listen_port: u16) -> Self {
        Self { listen_port }
    }
}

#[async_trait]
impl RoomTransport for GossipTransport {
    async fn join(&self, room: &RoomSpec) -> anyhow::Result<RoomLink> {
        let config = SwarmConfig {
            bootstrap_peers: parse_signaling(&room.signaling),
            listen_port: self.listen_port,
            extra_dials: Vec::new(),
        };
        let (cmd_tx, notif_rx, local_peer_id) =
            spawn_swarm(Keypair::generate_ed25519(), config).await?;

        for cmd in [
            SwarmCommand::SubscribeTopic(room.topic.clone()),
            SwarmCommand::Provide(room.topic.clone()),
            SwarmCommand::FindProviders(room.topic.clone()),
        ] {
            cmd_tx
                .send(cmd)
                .await
                .map_err(|_| anyhow::anyhow!("Swarm command channel closed"))?;
        }

        info!(peer_id = %local_peer_id, "Joined gossip room");

        let (link, endpoint) = RoomLink::channel(local_peer_id.to_string());
        tokio::spawn(pump(room.topic.clone(), cmd_tx, notif_rx, endpoint));
        Ok(link)
    }
}

/// Translate swarm notifications into room events until the link is dropped.
async fn pump(
    topic: String,
    cmd_tx: mpsc::Sender<SwarmCommand>,
    mut notif_rx: mpsc::Receiver<SwarmNotification>,
    mut endpoint: RoomEndpoint,
) {
    let mut connected: HashSet<PeerId> = HashSet::new();
    let mut members: HashSet<PeerId> = HashSet::new();
    let mut rediscover = tokio::time::interval(REDISCOVER_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut endpoint.leave => break,

            frame = endpoint.frames.recv() => {
                let Some(data) = frame else { break };
                let _ = cmd_tx
                    .send(SwarmCommand::PublishMessage { topic: topic.clone(), data })
                    .await;
            }

            notification = notif_rx.recv() => {
                let Some(notification) = notification else {
                    endpoint.connected.send_replace(false);
                    return;
                };
                match notification {
                    SwarmNotification::PeerConnected { peer_id, .. } => {
                        connected.insert(peer_id);
                        endpoint.connected.send_replace(true);
                    }
                    SwarmNotification::PeerDisconnected { peer_id } => {
                        connected.remove(&peer_id);
                        if members.remove(&peer_id) {
                            let _ = endpoint.events.send(RoomEvent::PeerLeft(peer_id.to_string()));
                        }
                        if connected.is_empty() {
                            endpoint.connected.send_replace(false);
                        }
                    }
                    SwarmNotification::PeerSubscribed { peer_id, topic: t } if t == topic => {
                        if members.insert(peer_id) {
                            let _ = endpoint.events.send(RoomEvent::PeerJoined(peer_id.to_string()));
                        }
                    }
                    SwarmNotification::PeerUnsubscribed { peer_id, topic: t } if t == topic => {
                        if members.remove(&peer_id) {
                            let _ = endpoint.events.send(RoomEvent::PeerLeft(peer_id.to_string()));
                        }
                    }
                    SwarmNotification::MessageReceived { source, topic: t, data } if t == topic => {
                        let from = source.map(|p| p.to_string()).unwrap_or_default();
                        let _ = endpoint.events.send(RoomEvent::Frame { from, data });
                    }
                    other => debug!(notification = ?other, "Ignoring swarm notification"),
                }
            }

            _ = rediscover.tick() => {
                let _ = cmd_tx.send(SwarmCommand::FindProviders(topic.clone())).await;
            }
        }
    }

    let _ = cmd_tx.send(SwarmCommand::UnsubscribeTopic(topic)).await;
    let _ = cmd_tx.send(SwarmCommand::Shutdown).await;
    endpoint.connected.send_replace(false);
    debug!("Left gossip room");
}
