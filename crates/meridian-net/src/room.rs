//! Transport-agnostic room membership.
//!
//! A room is a broadcast channel between every connection that joined the
//! same topic. Joining returns a [`RoomLink`]; dropping it leaves the room.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};

/// What a joined connection observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    PeerJoined(String),
    PeerLeft(String),
    Frame { from: String, data: Vec<u8> },
}

/// Where to rendezvous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSpec {
    /// Opaque topic; derived from the hashed room name.
    pub topic: String,
    /// Signaling endpoints, transport specific.
    pub signaling: Vec<String>,
}

impl RoomSpec {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            signaling: Vec::new(),
        }
    }

    pub fn with_signaling(mut self, signaling: Vec<String>) -> Self {
        self.signaling = signaling;
        self
    }
}

/// Cloneable handle that broadcasts frames to the rest of the room.
#[derive(Debug, Clone)]
pub struct RoomSender {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl RoomSender {
    pub fn send(&self, frame: Vec<u8>) -> anyhow::Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| anyhow::anyhow!("Room link closed"))
    }
}

/// A live membership in one room.
pub struct RoomLink {
    connection_id: String,
    sender: RoomSender,
    events: mpsc::UnboundedReceiver<RoomEvent>,
    connected: watch::Receiver<bool>,
    _leave: oneshot::Sender<()>,
}

/// The transport's half of a [`RoomLink`].
pub struct RoomEndpoint {
    pub frames: mpsc::UnboundedReceiver<Vec<u8>>,
    pub events: mpsc::UnboundedSender<RoomEvent>,
    pub connected: watch::Sender<bool>,
    /// Resolves (with an error) once the link is dropped.
    pub leave: oneshot::Receiver<()>,
}

impl RoomLink {
    /// A connected link/endpoint pair for transport implementations.
    pub fn channel(connection_id: impl Into<String>) -> (RoomLink, RoomEndpoint) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(false);
        let (leave_tx, leave_rx) = oneshot::channel();

        let link = RoomLink {
            connection_id: connection_id.into(),
            sender: RoomSender { tx: frames_tx },
            events: events_rx,
            connected: connected_rx,
            _leave: leave_tx,
        };
        let endpoint = RoomEndpoint {
            frames: frames_rx,
            events: events_tx,
            connected: connected_tx,
            leave: leave_rx,
        };
        (link, endpoint)
    }

    /// Stable for the lifetime of the link; a new join gets a new id.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn sender(&self) -> RoomSender {
        self.sender.clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// `None` once the transport has gone away.
    pub async fn next_event(&mut self) -> Option<RoomEvent> {
        self.events.recv().await
    }
}

#[async_trait]
pub trait RoomTransport: Send + Sync {
    async fn join(&self, room: &RoomSpec) -> anyhow::Result<RoomLink>;
}
