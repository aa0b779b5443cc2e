//! Peer CRDT backend.
//!
//! One connection task owns the room link and the document. It applies
//! remote frames, turns queued local writes into document ops and, the first
//! time a peer shows up, bulk loads the local tables into the document.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use meridian_net::{RoomEvent, RoomLink, RoomSender, RoomSpec, RoomTransport};
use meridian_shared::crypto::{derive_room_key, room_topic, SymmetricKey};
use meridian_shared::protocol::SyncMessage;
use meridian_shared::{ChangeEvent, ChangeKind, Origin, PeerPresence, SyncStatus, TableName, UserIdentity};
use meridian_store::SharedDatabase;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{ConnectionParams, PeerParams, RemoteChanges, SyncBackend, SyncCore};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::status::StatusReporter;

use super::doc::SyncDoc;

/// Work queued for the connection task.
enum Outbound {
    Change(ChangeEvent),
    Presence,
}

struct ActiveConnection {
    doc: Arc<Mutex<SyncDoc>>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct PeerSyncBackend {
    core: SyncCore,
    transport: Arc<dyn RoomTransport>,
    params: Mutex<Option<PeerParams>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    active: tokio::sync::Mutex<Option<ActiveConnection>>,
}

impl PeerSyncBackend {
    pub fn new(db: SharedDatabase, transport: Arc<dyn RoomTransport>, config: SyncConfig) -> Self {
        Self {
            core: SyncCore::new(db, config),
            transport,
            params: Mutex::new(None),
            outbound: Mutex::new(None),
            active: tokio::sync::Mutex::new(None),
        }
    }

    pub fn reporter(&self) -> &StatusReporter {
        &self.core.reporter
    }

    async fn connect(&self, active: &mut Option<ActiveConnection>) -> Result<()> {
        let params = guard(&self.params).clone().ok_or(SyncError::NotStarted)?;
        self.core.reporter.set_status(SyncStatus::Connecting);

        let signaling = params
            .signaling_url
            .clone()
            .or_else(|| self.core.config.signaling_url.clone());
        let spec = RoomSpec::new(room_topic(&params.room_name)).with_signaling(signaling.into_iter().collect());

        let link = match self.transport.join(&spec).await {
            Ok(link) => link,
            Err(e) => {
                warn!(error = %e, "Failed to join sync room");
                self.core.mark_disconnected();
                return Ok(());
            }
        };

        let connection_id = link.connection_id().to_string();
        self.core
            .awareness
            .set_local_connection(Some(connection_id.clone()));

        let doc = Arc::new(Mutex::new(SyncDoc::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        *guard(&self.outbound) = Some(tx);

        let check = tokio::spawn(check_connectivity(
            link.connected(),
            self.core.reporter.clone(),
            self.core.config.connect_attempts,
            self.core.config.connect_interval,
        ));

        let worker = PeerConnection {
            core: self.core.clone(),
            key: derive_room_key(&params.room_name, params.password.as_deref()),
            connection_id: connection_id.clone(),
            doc: doc.clone(),
            sender: link.sender(),
            loaded: false,
        };
        let task = tokio::spawn(worker.run(link, rx));

        *active = Some(ActiveConnection {
            doc,
            tasks: vec![check, task],
        });

        info!(connection_id = %connection_id, "Peer sync connection started");
        Ok(())
    }

    /// Stop the connection task and wait for it, so its room link is gone
    /// before anything new is created.
    async fn teardown(&self, active: &mut Option<ActiveConnection>) {
        *guard(&self.outbound) = None;
        if let Some(connection) = active.take() {
            for task in &connection.tasks {
                task.abort();
            }
            for task in connection.tasks {
                let _ = task.await;
            }
            debug!("Peer sync connection torn down");
        }
        self.core.mark_disconnected();
    }

    fn queue(&self, item: Outbound) {
        match guard(&self.outbound).as_ref() {
            Some(tx) => {
                if tx.send(item).is_err() {
                    debug!("Connection task gone, dropping outbound item");
                }
            }
            None => debug!("Not connected, dropping outbound item"),
        }
    }
}

impl Drop for PeerSyncBackend {
    fn drop(&mut self) {
        if let Some(connection) = self.active.get_mut().take() {
            for task in connection.tasks {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl SyncBackend for PeerSyncBackend {
    async fn start_sync(&self, identity: UserIdentity, params: ConnectionParams) -> Result<()> {
        let ConnectionParams::Peer(params) = params else {
            return Err(SyncError::UnsupportedParams { expected: "peer" });
        };

        self.core.awareness.set_local_identity(identity);
        *guard(&self.params) = Some(params);

        let mut active = self.active.lock().await;
        self.teardown(&mut active).await;
        self.connect(&mut active).await
    }

    async fn reconnect(&self) -> Result<()> {
        if guard(&self.params).is_none() {
            return Err(SyncError::NotStarted);
        }
        let mut active = self.active.lock().await;
        self.teardown(&mut active).await;
        self.connect(&mut active).await
    }

    async fn disconnect(&self) {
        let mut active = self.active.lock().await;
        self.teardown(&mut active).await;
    }

    async fn shared_map(&self, table: TableName) -> Option<BTreeMap<String, Value>> {
        let active = self.active.lock().await;
        active.as_ref().map(|connection| guard(&connection.doc).map(table))
    }

    fn observe_remote_changes(&self, table: TableName) -> RemoteChanges {
        self.core.observe(table)
    }

    fn push_local_change(&self, change: ChangeEvent) {
        if change.table.is_synced() {
            self.queue(Outbound::Change(change));
        }
    }

    fn status(&self) -> watch::Receiver<SyncStatus> {
        self.core.reporter.subscribe_status()
    }

    fn table_events(&self) -> broadcast::Receiver<TableName> {
        self.core.reporter.subscribe_tables()
    }

    fn awareness(&self) -> watch::Receiver<Vec<PeerPresence>> {
        self.core.awareness.subscribe()
    }

    fn set_local_identity(&self, identity: UserIdentity) {
        self.core.awareness.set_local_identity(identity);
        self.queue(Outbound::Presence);
    }
}

/// Poll the link a bounded number of times before declaring the room
/// unreachable.
async fn check_connectivity(
    connected: watch::Receiver<bool>,
    reporter: StatusReporter,
    attempts: u32,
    interval: Duration,
) {
    for attempt in 1..=attempts {
        if *connected.borrow() {
            if reporter.status() == SyncStatus::Connecting {
                reporter.set_status(SyncStatus::Ready);
            }
            return;
        }
        debug!(attempt, "Waiting for room connectivity");
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    warn!(attempts, "Room did not become reachable");
    reporter.set_status(SyncStatus::Unconnected);
}

struct PeerConnection {
    core: SyncCore,
    key: SymmetricKey,
    connection_id: String,
    doc: Arc<Mutex<SyncDoc>>,
    sender: RoomSender,
    /// Whether the local tables were bulk loaded on this connection.
    loaded: bool,
}

impl PeerConnection {
    async fn run(mut self, mut link: RoomLink, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
        let mut connected = link.connected();
        let mut watching = true;

        loop {
            tokio::select! {
                event = link.next_event() => match event {
                    Some(RoomEvent::PeerJoined(peer)) => self.on_peer_joined(&peer),
                    Some(RoomEvent::PeerLeft(peer)) => {
                        debug!(peer = %peer, "Peer left room");
                        self.core.awareness.remove_peer(&peer);
                    }
                    Some(RoomEvent::Frame { from, data }) => self.on_frame(&from, &data),
                    None => {
                        warn!("Room transport closed");
                        self.core.reporter.set_status(SyncStatus::Unconnected);
                        break;
                    }
                },

                item = outbound.recv() => match item {
                    Some(Outbound::Change(change)) => self.on_local_change(change),
                    Some(Outbound::Presence) => self.announce(),
                    None => break,
                },

                changed = connected.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    let up = *connected.borrow_and_update();
                    let status = self.core.reporter.status();
                    if !up {
                        warn!("Lost room connectivity");
                        self.core.reporter.set_status(SyncStatus::Unconnected);
                    } else if status == SyncStatus::Unconnected {
                        info!("Room connectivity restored");
                        self.core.reporter.set_status(SyncStatus::Ready);
                    }
                }
            }
        }
    }

    fn on_peer_joined(&mut self, peer: &str) {
        debug!(peer = %peer, "Peer joined room");

        if !self.loaded {
            match self.bulk_load() {
                Ok(()) => self.loaded = true,
                Err(e) => error!(error = %e, "Bulk load into document failed"),
            }
        }
        self.send_snapshot();
        self.announce();
        self.core.reporter.begin_syncing();
    }

    /// Write every local row of the synced tables into the document, one
    /// update per batch.
    fn bulk_load(&self) -> Result<()> {
        let batch = self.core.config.batch_size.max(1);
        for table in TableName::synced() {
            let rows: Vec<(String, Value)> = self.core.local_rows(table)?.into_iter().collect();
            for chunk in rows.chunks(batch) {
                let ops = guard(&self.doc).put_many(table, chunk);
                if !ops.is_empty() {
                    self.send(&SyncMessage::Update { ops });
                }
            }
            info!(table = %table, rows = rows.len(), "Bulk loaded table into document");
        }
        Ok(())
    }

    fn send_snapshot(&self) {
        let ops = guard(&self.doc).snapshot();
        for chunk in ops.chunks(self.core.config.batch_size.max(1)) {
            self.send(&SyncMessage::Snapshot { ops: chunk.to_vec() });
        }
    }

    fn announce(&self) {
        if let Some(identity) = self.core.awareness.local_identity() {
            self.send(&SyncMessage::Awareness {
                connection_id: self.connection_id.clone(),
                identity: Some(identity),
            });
        }
    }

    fn on_frame(&self, from: &str, data: &[u8]) {
        let message = match SyncMessage::open(&self.key, data) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %from, error = %e, "Dropping frame that failed to open");
                return;
            }
        };

        match message {
            SyncMessage::Update { ops } | SyncMessage::Snapshot { ops } => {
                let changes = guard(&self.doc).apply(&ops);
                if let Err(e) = self.core.apply_remote(changes) {
                    error!(peer = %from, error = %e, "Failed to apply remote changes");
                }
            }
            SyncMessage::Awareness {
                connection_id,
                identity,
            } => self.core.awareness.apply_remote(&connection_id, identity),
        }
    }

    fn on_local_change(&self, change: ChangeEvent) {
        let op = match (change.origin, &change.kind) {
            (Origin::Remote, _) => return,
            (Origin::Local, ChangeKind::Upsert(record)) => guard(&self.doc).put(change.table, &change.id, record),
            (Origin::Local, ChangeKind::Delete) => guard(&self.doc).remove(change.table, &change.id),
        };
        self.send(&SyncMessage::Update { ops: vec![op] });
        self.core.reporter.table_changed(change.table);
    }

    fn send(&self, message: &SyncMessage) {
        match message.seal(&self.key) {
            Ok(frame) => {
                if let Err(e) = self.sender.send(frame) {
                    debug!(error = %e, "Room link closed, frame dropped");
                }
            }
            Err(e) => warn!(error = %e, "Failed to seal frame"),
        }
    }
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use meridian_net::MemoryHub;
    use meridian_store::{Database, OpenOptions};

    use super::*;

    fn backend(hub: &MemoryHub) -> PeerSyncBackend {
        let db = Database::open_in_memory(&OpenOptions::default())
            .unwrap()
            .into_shared();
        PeerSyncBackend::new(db, Arc::new(hub.clone()), SyncConfig::default())
    }

    fn params(room: &str) -> ConnectionParams {
        ConnectionParams::Peer(PeerParams {
            room_name: room.into(),
            password: Some("pw".into()),
            signaling_url: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_room_ends_unconnected() {
        let hub = MemoryHub::new();
        hub.set_online(false);
        let sync = backend(&hub);

        sync.start_sync(UserIdentity::new("u1", "Ada"), params("r")).await.unwrap();
        assert_eq!(*sync.status().borrow(), SyncStatus::Unconnected);
        assert!(sync.shared_map(TableName::Topics).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn joined_room_becomes_ready() {
        let hub = MemoryHub::new();
        let sync = backend(&hub);

        sync.start_sync(UserIdentity::new("u1", "Ada"), params("r")).await.unwrap();
        let mut status = sync.status();
        status.wait_for(|s| *s == SyncStatus::Ready).await.unwrap();

        let peers = sync.awareness().borrow().clone();
        assert_eq!(peers.len(), 1);
        assert!(peers[0].is_current_user);
    }

    #[tokio::test]
    async fn wrong_params_and_early_reconnect_are_rejected() {
        let sync = backend(&MemoryHub::new());
        assert!(matches!(sync.reconnect().await, Err(SyncError::NotStarted)));

        let hosted = ConnectionParams::Hosted(crate::backend::HostedParams {
            room_name: "r".into(),
            password: None,
            public_api_key: Some("pk".into()),
            access_code_for_auth_endpoint: None,
            auth_endpoint: None,
        });
        assert!(matches!(
            sync.start_sync(UserIdentity::new("u", "U"), hosted).await,
            Err(SyncError::UnsupportedParams { .. })
        ));
    }
}
