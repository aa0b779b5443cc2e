//! In-process room hub.
//!
//! Stands in for a signaling server plus peer links: every connection that
//! joins the same topic on the same hub sees the others, and frames fan out
//! to every other member. The hub can be taken offline to exercise
//! connectivity loss.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::room::{RoomEndpoint, RoomEvent, RoomLink, RoomSpec, RoomTransport};

#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubState>>,
}

#[derive(Default)]
struct HubState {
    rooms: HashMap<String, HashMap<String, Member>>,
    offline: bool,
    next_id: u64,
}

struct Member {
    events: mpsc::UnboundedSender<RoomEvent>,
    connected: watch::Sender<bool>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offline hubs refuse joins, drop frames and report every link as
    /// disconnected until brought back.
    pub fn set_online(&self, online: bool) {
        let mut state = self.state();
        state.offline = !online;
        for member in state.rooms.values().flat_map(HashMap::values) {
            member.connected.send_replace(online);
        }
    }

    /// Live connections in a room.
    pub fn connections(&self, topic: &str) -> usize {
        self.state().rooms.get(topic).map(HashMap::len).unwrap_or(0)
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn broadcast(&self, topic: &str, from: &str, data: &[u8]) {
        let state = self.state();
        if state.offline {
            return;
        }
        let Some(room) = state.rooms.get(topic) else {
            return;
        };
        for (id, member) in room {
            if id != from {
                let _ = member.events.send(RoomEvent::Frame {
                    from: from.to_string(),
                    data: data.to_vec(),
                });
            }
        }
    }

    fn remove(&self, topic: &str, id: &str) {
        let mut state = self.state();
        let Some(room) = state.rooms.get_mut(topic) else {
            return;
        };
        if room.remove(id).is_none() {
            return;
        }
        for member in room.values() {
            let _ = member.events.send(RoomEvent::PeerLeft(id.to_string()));
        }
        if room.is_empty() {
            state.rooms.remove(topic);
        }
        debug!(connection_id = %id, "Left memory room");
    }
}

#[async_trait]
impl RoomTransport for MemoryHub {
    async fn join(&self, room: &RoomSpec) -> anyhow::Result<RoomLink> {
        let (link, (id, mut frames, mut leave)) = {
            let mut state = self.state();
            if state.offline {
                anyhow::bail!("Signaling hub unreachable");
            }

            state.next_id += 1;
            let id = format!("mem-{}", state.next_id);
            let (link, endpoint) = RoomLink::channel(id.clone());
            let RoomEndpoint {
                frames,
                events,
                connected,
                leave,
            } = endpoint;

            let members = state.rooms.entry(room.topic.clone()).or_default();
            for (other_id, other) in members.iter() {
                let _ = other.events.send(RoomEvent::PeerJoined(id.clone()));
                let _ = events.send(RoomEvent::PeerJoined(other_id.clone()));
            }
            connected.send_replace(true);
            members.insert(id.clone(), Member { events, connected });

            debug!(connection_id = %id, "Joined memory room");
            (link, (id, frames, leave))
        };

        let hub = self.clone();
        let topic = room.topic.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut leave => break,
                    frame = frames.recv() => match frame {
                        Some(data) => hub.broadcast(&topic, &id, &data),
                        None => break,
                    },
                }
            }
            hub.remove(&topic, &id);
        });

        Ok(link)
    }
}
