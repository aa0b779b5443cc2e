//! Swarm orchestration with the tokio mpsc command/notification pattern.
//!
//! The swarm event loop runs in a dedicated tokio task. Callers talk to it
//! through typed command and notification channels only.

use std::collections::HashSet;

use futures::StreamExt;
use libp2p::{
    gossipsub, identify,
    kad::{self, RecordKey},
    multiaddr::Protocol,
    swarm::SwarmEvent,
    Multiaddr, PeerId,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::behaviour::MeridianEvent;
use crate::peers::PeerTracker;
use crate::transport::build_swarm;

/// Commands sent *into* the swarm task.
#[derive(Debug)]
pub enum SwarmCommand {
    Dial(Multiaddr),
    PublishMessage { topic: String, data: Vec<u8> },
    SubscribeTopic(String),
    UnsubscribeTopic(String),
    /// Announce this node as a provider of `key` in the DHT.
    Provide(String),
    /// Look up providers of `key` and dial every one found.
    FindProviders(String),
    GetPeers(oneshot::Sender<Vec<PeerId>>),
    /// Peers known to be subscribed to a topic.
    GetTopicPeers(String, oneshot::Sender<Vec<PeerId>>),
    Shutdown,
}

/// Notifications sent *from* the swarm task to the application.
#[derive(Debug, Clone)]
pub enum SwarmNotification {
    PeerConnected { peer_id: PeerId, address: Multiaddr },
    PeerDisconnected { peer_id: PeerId },
    MessageReceived {
        source: Option<PeerId>,
        topic: String,
        data: Vec<u8>,
    },
    PeerSubscribed { peer_id: PeerId, topic: String },
    PeerUnsubscribed { peer_id: PeerId, topic: String },
    ProvidersFound { key: String, providers: Vec<PeerId> },
}

/// Configuration for spawning the swarm.
#[derive(Debug, Clone, Default)]
pub struct SwarmConfig {
    /// Signaling / bootstrap nodes dialed on startup and seeded into Kademlia.
    pub bootstrap_peers: Vec<Multiaddr>,
    /// Port to listen on; `0` picks an ephemeral one.
    pub listen_port: u16,
    /// Additional multiaddrs to dial on startup.
    pub extra_dials: Vec<Multiaddr>,
}

/// Spawn the libp2p swarm in a background tokio task.
///
/// Returns `(command_tx, notification_rx, local_peer_id)`.
pub async fn spawn_swarm(
    keypair: libp2p::identity::Keypair,
    config: SwarmConfig,
) -> anyhow::Result<(
    mpsc::Sender<SwarmCommand>,
    mpsc::Receiver<SwarmNotification>,
    PeerId,
)> {
    let mut swarm = build_swarm(keypair)?;
    let local_peer_id = *swarm.local_peer_id();

    let listen_addr_v4: Multiaddr =
        format!("/ip4/0.0.0.0/udp/{}/quic-v1", config.listen_port).parse()?;
    swarm.listen_on(listen_addr_v4)?;

    info!(peer_id = %local_peer_id, port = config.listen_port, "Swarm listening");

    for addr in &config.bootstrap_peers {
        if let Err(e) = swarm.dial(addr.clone()) {
            warn!(addr = %addr, error = %e, "Failed to dial bootstrap peer");
            continue;
        }
        if let Some(peer_id) = extract_peer_id(addr) {
            swarm
                .behaviour_mut()
                .kademlia
                .add_address(&peer_id, addr.clone());
        }
        debug!(addr = %addr, "Dialing bootstrap peer");
    }

    if !config.bootstrap_peers.is_empty() {
        if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
            warn!(error = %e, "Kademlia bootstrap failed to start");
        }
    }

    for addr in &config.extra_dials {
        if let Err(e) = swarm.dial(addr.clone()) {
            warn!(addr = %addr, error = %e, "Failed to dial extra address");
        }
    }

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SwarmCommand>(256);
    let (notif_tx, notif_rx) = mpsc::channel::<SwarmNotification>(256);

    tokio::spawn(async move {
        let mut peer_tracker = PeerTracker::new();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SwarmCommand::Dial(addr)) => {
                            if let Err(e) = swarm.dial(addr.clone()) {
                                error!(addr = %addr, error = %e, "Dial failed");
                            }
                        }
                        Some(SwarmCommand::PublishMessage { topic, data }) => {
                            let gossipsub_topic = gossipsub::IdentTopic::new(&topic);
                            if let Err(e) = swarm.behaviour_mut().gossipsub.publish(gossipsub_topic, data) {
                                // Expected while alone in a room.
                                debug!(topic = %topic, error = %e, "Publish failed");
                            }
                        }
                        Some(SwarmCommand::SubscribeTopic(topic)) => {
                            let gossipsub_topic = gossipsub::IdentTopic::new(&topic);
                            if let Err(e) = swarm.behaviour_mut().gossipsub.subscribe(&gossipsub_topic) {
                                error!(topic = %topic, error = %e, "Subscribe failed");
                            }
                        }
                        Some(SwarmCommand::UnsubscribeTopic(topic)) => {
                            let gossipsub_topic = gossipsub::IdentTopic::new(&topic);
                            if let Err(e) = swarm.behaviour_mut().gossipsub.unsubscribe(&gossipsub_topic) {
                                warn!(topic = %topic, error = %e, "Unsubscribe failed");
                            }
                        }
                        Some(SwarmCommand::Provide(key)) => {
                            let record_key = RecordKey::new(&key);
                            if let Err(e) = swarm.behaviour_mut().kademlia.start_providing(record_key) {
                                warn!(key = %key, error = ?e, "Failed to announce provider record");
                            }
                        }
                        Some(SwarmCommand::FindProviders(key)) => {
                            swarm.behaviour_mut().kademlia.get_providers(RecordKey::new(&key));
                        }
                        Some(SwarmCommand::GetPeers(reply)) => {
                            let _ = reply.send(peer_tracker.connected_peers());
                        }
                        Some(SwarmCommand::GetTopicPeers(topic, reply)) => {
                            let _ = reply.send(peer_tracker.topic_peers(&topic));
                        }
                        Some(SwarmCommand::Shutdown) => {
                            info!("Swarm shutdown requested");
                            break;
                        }
                        None => {
                            info!("Command channel closed, shutting down swarm");
                            break;
                        }
                    }
                }

                event = swarm.select_next_some() => {
                    match event {
                        SwarmEvent::Behaviour(MeridianEvent::Gossipsub(
                            gossipsub::Event::Message { message, .. },
                        )) => {
                            let topic = message.topic.to_string();
                            debug!(
                                topic = %topic,
                                source = ?message.source,
                                len = message.data.len(),
                                "GossipSub message received"
                            );
                            let _ = notif_tx
                                .send(SwarmNotification::MessageReceived {
                                    source: message.source,
                                    topic,
                                    data: message.data,
                                })
                                .await;
                        }

                        SwarmEvent::Behaviour(MeridianEvent::Gossipsub(
                            gossipsub::Event::Subscribed { peer_id, topic },
                        )) => {
                            let topic = topic.to_string();
                            peer_tracker.on_subscribed(peer_id, &topic);
                            let _ = notif_tx
                                .send(SwarmNotification::PeerSubscribed { peer_id, topic })
                                .await;
                        }

                        SwarmEvent::Behaviour(MeridianEvent::Gossipsub(
                            gossipsub::Event::Unsubscribed { peer_id, topic },
                        )) => {
                            let topic = topic.to_string();
                            peer_tracker.on_unsubscribed(&peer_id, &topic);
                            let _ = notif_tx
                                .send(SwarmNotification::PeerUnsubscribed { peer_id, topic })
                                .await;
                        }

                        SwarmEvent::Behaviour(MeridianEvent::Kademlia(
                            kad::Event::OutboundQueryProgressed {
                                result: kad::QueryResult::GetProviders(Ok(
                                    kad::GetProvidersOk::FoundProviders { key, providers },
                                )),
                                ..
                            },
                        )) => {
                            let key = String::from_utf8_lossy(&key.to_vec()).into_owned();
                            let providers: Vec<PeerId> = providers
                                .into_iter()
                                .filter(|p| *p != local_peer_id)
                                .collect::<HashSet<_>>()
                                .into_iter()
                                .collect();
                            for provider in &providers {
                                if !peer_tracker.is_connected(provider) {
                                    if let Err(e) = swarm.dial(*provider) {
                                        debug!(peer = %provider, error = %e, "Could not dial provider");
                                    }
                                }
                            }
                            info!(key = %key, count = providers.len(), "Found room providers");
                            let _ = notif_tx
                                .send(SwarmNotification::ProvidersFound { key, providers })
                                .await;
                        }

                        SwarmEvent::Behaviour(MeridianEvent::Kademlia(
                            kad::Event::OutboundQueryProgressed { result, .. },
                        )) => {
                            debug!(result = ?result, "Kademlia query progressed");
                        }

                        SwarmEvent::Behaviour(MeridianEvent::Identify(
                            identify::Event::Received { peer_id, info, .. },
                        )) => {
                            debug!(
                                peer = %peer_id,
                                protocol = ?info.protocol_version,
                                "Identify: received info from peer"
                            );
                            for addr in &info.listen_addrs {
                                swarm
                                    .behaviour_mut()
                                    .kademlia
                                    .add_address(&peer_id, addr.clone());
                            }
                        }

                        SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                            let addr = endpoint.get_remote_address().clone();
                            peer_tracker.on_connected(peer_id, addr.clone());

                            info!(peer = %peer_id, addr = %addr, "Peer connected");
                            let _ = notif_tx
                                .send(SwarmNotification::PeerConnected { peer_id, address: addr })
                                .await;
                        }

                        SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                            if num_established == 0 {
                                peer_tracker.on_disconnected(&peer_id);
                                info!(peer = %peer_id, "Peer disconnected");
                                let _ = notif_tx
                                    .send(SwarmNotification::PeerDisconnected { peer_id })
                                    .await;
                            }
                        }

                        SwarmEvent::NewListenAddr { address, .. } => {
                            info!(addr = %address, "Listening on new address");
                        }

                        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                            warn!(peer = ?peer_id, error = %error, "Outgoing connection error");
                        }

                        SwarmEvent::IncomingConnectionError { error, .. } => {
                            warn!(error = %error, "Incoming connection error");
                        }

                        _ => {}
                    }
                }
            }
        }

        info!("Swarm event loop terminated");
    });

    Ok((cmd_tx, notif_rx, local_peer_id))
}

/// Extract a `PeerId` from a multiaddr, if one is present.
pub(crate) fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}
