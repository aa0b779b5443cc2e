//! Hosted backend: mirrors each synced table into a shared map of a hosted
//! room.
//!
//! The first merge only fills gaps on both sides. Afterwards remote changes
//! are picked up by diffing the map against the local table, and local
//! writes overwrite the map entry.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use meridian_shared::crypto::hash_room_id;
use meridian_shared::{ChangeEvent, ChangeKind, Origin, PeerPresence, SyncStatus, TableName, UserIdentity};
use meridian_store::SharedDatabase;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::auth::resolve_credentials;
use super::client::{ConnectionState, HostedClient, HostedEvent, HostedRoom, RoomState, StorageState};
use crate::backend::{ConnectionParams, HostedParams, RemoteChanges, SyncBackend, SyncCore};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};

enum Outbound {
    Change(ChangeEvent),
    Presence,
}

struct ActiveRoom {
    room: Arc<dyn HostedRoom>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct HostedSyncBackend {
    core: SyncCore,
    client: Arc<dyn HostedClient>,
    http: reqwest::Client,
    params: Mutex<Option<HostedParams>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    active: tokio::sync::Mutex<Option<ActiveRoom>>,
}

/// Map a room lifecycle event onto the session status.
pub fn status_for(event: &HostedEvent) -> Option<SyncStatus> {
    let status = match event {
        HostedEvent::Connection(ConnectionState::Lost) => SyncStatus::Connecting,
        HostedEvent::Connection(ConnectionState::Restored) => SyncStatus::Ready,
        HostedEvent::Connection(ConnectionState::Failed) => SyncStatus::Unconnected,
        HostedEvent::Room(RoomState::Connecting) => SyncStatus::Connecting,
        HostedEvent::Room(RoomState::Connected) => SyncStatus::Ready,
        HostedEvent::Room(RoomState::Disconnected) => SyncStatus::Unconnected,
        HostedEvent::Storage(StorageState::NotLoaded | StorageState::Loading) => SyncStatus::Connecting,
        HostedEvent::Storage(StorageState::Synchronizing) => SyncStatus::Syncing,
        HostedEvent::Storage(StorageState::Synchronized) => SyncStatus::Synced,
        HostedEvent::MapChanged { .. } | HostedEvent::OthersChanged => return None,
    };
    Some(status)
}

impl HostedSyncBackend {
    pub fn new(db: SharedDatabase, client: Arc<dyn HostedClient>, config: SyncConfig) -> Self {
        Self {
            core: SyncCore::new(db, config),
            client,
            http: reqwest::Client::new(),
            params: Mutex::new(None),
            outbound: Mutex::new(None),
            active: tokio::sync::Mutex::new(None),
        }
    }

    async fn connect(&self, active: &mut Option<ActiveRoom>) -> Result<()> {
        let params = guard(&self.params).clone().ok_or(SyncError::NotStarted)?;
        self.core.reporter.set_status(SyncStatus::Connecting);

        let room_id = hash_room_id(&params.room_name, params.password.as_deref());
        let credentials = match resolve_credentials(&self.http, &params, &room_id).await {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(error = %e, "Failed to authenticate with hosted service");
                self.core.mark_disconnected();
                return Ok(());
            }
        };

        let room = match self
            .client
            .enter_room(&room_id, credentials, self.core.awareness.local_identity())
            .await
        {
            Ok(room) => Arc::<dyn HostedRoom>::from(room),
            Err(e) => {
                warn!(error = %e, "Failed to enter hosted room");
                self.core.mark_disconnected();
                return Ok(());
            }
        };

        // Subscribe before storage loads so no lifecycle event is missed.
        let events = room.events();
        let merged = match room.storage_loaded().await {
            Ok(()) => initial_merge(&self.core, room.as_ref()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = merged {
            room.leave().await;
            self.core.mark_disconnected();
            if matches!(e, SyncError::Store(_)) {
                return Err(e);
            }
            warn!(error = %e, "Hosted room storage unavailable");
            return Ok(());
        }

        self.core
            .awareness
            .set_local_connection(Some(room.connection_id()));
        self.core.awareness.replace_remote(room.others());

        let (tx, rx) = mpsc::unbounded_channel();
        *guard(&self.outbound) = Some(tx);

        let listener = tokio::spawn(listen(self.core.clone(), room.clone(), events));
        let writer = tokio::spawn(write_local(self.core.clone(), room.clone(), rx));
        info!(connection_id = %room.connection_id(), "Hosted sync connected");

        *active = Some(ActiveRoom {
            room,
            tasks: vec![listener, writer],
        });
        Ok(())
    }

    async fn teardown(&self, active: &mut Option<ActiveRoom>) {
        *guard(&self.outbound) = None;
        if let Some(connection) = active.take() {
            for task in &connection.tasks {
                task.abort();
            }
            for task in connection.tasks {
                let _ = task.await;
            }
            connection.room.leave().await;
            debug!("Hosted room left");
        }
        self.core.mark_disconnected();
    }

    fn queue(&self, item: Outbound) {
        match guard(&self.outbound).as_ref() {
            Some(tx) => {
                if tx.send(item).is_err() {
                    debug!("Hosted writer gone, dropping outbound item");
                }
            }
            None => debug!("Not connected, dropping outbound item"),
        }
    }
}

impl Drop for HostedSyncBackend {
    fn drop(&mut self) {
        if let Some(connection) = self.active.get_mut().take() {
            for task in connection.tasks {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl SyncBackend for HostedSyncBackend {
    async fn start_sync(&self, identity: UserIdentity, params: ConnectionParams) -> Result<()> {
        let ConnectionParams::Hosted(params) = params else {
            return Err(SyncError::UnsupportedParams { expected: "hosted" });
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
        let connection = active.as_ref()?;
        match connection.room.map_snapshot(table).await {
            Ok(map) => Some(map),
            Err(e) => {
                warn!(table = %table, error = %e, "Failed to read hosted map");
                None
            }
        }
    }

    fn observe_remote_changes(&self, table: TableName) -> RemoteChanges {
        self.core.observe(table)
    }

    fn push_local_change(&self, change: ChangeEvent) {
        if change.table.is_synced() && change.origin == Origin::Local {
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

/// Fill the gaps on both sides without touching entries present on both.
async fn initial_merge(core: &SyncCore, room: &dyn HostedRoom) -> Result<()> {
    for table in TableName::synced() {
        let remote = room.map_snapshot(table).await?;
        let local = core.local_rows(table)?;

        let pull: Vec<ChangeEvent> = remote
            .iter()
            .filter(|(id, _)| !local.contains_key(*id))
            .map(|(id, value)| ChangeEvent::upsert(Origin::Remote, table, id.clone(), value.clone()))
            .collect();
        let push: Vec<(String, Value)> = local
            .into_iter()
            .filter(|(id, _)| !remote.contains_key(id))
            .collect();

        let pushed = push.len();
        let pulled = core.apply_remote(pull)?;
        room.set_entries(table, push).await?;
        info!(table = %table, pulled, pushed, "Merged hosted map");
    }
    Ok(())
}

/// Upsert the entries of the remote map that are new or differ locally.
/// Entries gone from the map are left alone.
async fn pull_table(core: &SyncCore, room: &dyn HostedRoom, table: TableName) -> Result<usize> {
    let remote = room.map_snapshot(table).await?;
    let local = core.local_rows(table)?;
    let changes: Vec<ChangeEvent> = remote
        .into_iter()
        .filter(|(id, value)| local.get(id) != Some(value))
        .map(|(id, value)| ChangeEvent::upsert(Origin::Remote, table, id, value))
        .collect();
    core.apply_remote(changes)
}

async fn listen(core: SyncCore, room: Arc<dyn HostedRoom>, mut events: broadcast::Receiver<HostedEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Hosted event stream lagged, pulling every table");
                for table in TableName::synced() {
                    if let Err(e) = pull_table(&core, room.as_ref(), table).await {
                        error!(table = %table, error = %e, "Failed to pull hosted map");
                    }
                }
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            HostedEvent::MapChanged { table } if table.is_synced() => {
                match pull_table(&core, room.as_ref(), table).await {
                    Ok(applied) => debug!(table = %table, applied, "Pulled hosted map"),
                    Err(e) => error!(table = %table, error = %e, "Failed to pull hosted map"),
                }
            }
            HostedEvent::MapChanged { .. } => {}
            HostedEvent::OthersChanged => core.awareness.replace_remote(room.others()),
            lifecycle => {
                if let Some(status) = status_for(&lifecycle) {
                    core.reporter.set_status(status);
                }
            }
        }
    }
}

async fn write_local(core: SyncCore, room: Arc<dyn HostedRoom>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Change(change) => {
                let written = match change.kind {
                    ChangeKind::Upsert(record) => {
                        room.set_entries(change.table, vec![(change.id.clone(), record)])
                            .await
                    }
                    ChangeKind::Delete => room.delete_entry(change.table, &change.id).await,
                };
                match written {
                    Ok(()) => core.reporter.table_changed(change.table),
                    Err(e) => warn!(table = %change.table, id = %change.id, error = %e, "Failed to write hosted map"),
                }
            }
            Outbound::Presence => {
                if let Some(identity) = core.awareness.local_identity() {
                    room.update_presence(identity);
                }
            }
        }
    }
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use meridian_shared::crypto::hash_room_name;
    use meridian_store::{lock, Database, OpenOptions};
    use serde_json::json;

    use super::*;
    use crate::hosted::memory::MemoryHostedService;

    fn backend(service: &MemoryHostedService) -> HostedSyncBackend {
        let db = Database::open_in_memory(&OpenOptions::default())
            .unwrap()
            .into_shared();
        HostedSyncBackend::new(db, Arc::new(service.clone()), SyncConfig::default())
    }

    fn params() -> ConnectionParams {
        ConnectionParams::Hosted(HostedParams {
            room_name: "team".into(),
            password: None,
            public_api_key: Some("pk".into()),
            access_code_for_auth_endpoint: None,
            auth_endpoint: None,
        })
    }

    fn params_with_password(password: &str) -> ConnectionParams {
        match params() {
            ConnectionParams::Hosted(p) => ConnectionParams::Hosted(HostedParams {
                password: Some(password.into()),
                ..p
            }),
            other => other,
        }
    }

    fn topic(id: &str, title: &str) -> Value {
        json!({ "id": id, "title": title, "createdAt": 1, "updatedAt": 1 })
    }

    #[test]
    fn lifecycle_events_map_onto_status() {
        let cases = [
            (HostedEvent::Connection(ConnectionState::Lost), Some(SyncStatus::Connecting)),
            (HostedEvent::Connection(ConnectionState::Failed), Some(SyncStatus::Unconnected)),
            (HostedEvent::Room(RoomState::Connected), Some(SyncStatus::Ready)),
            (HostedEvent::Storage(StorageState::Loading), Some(SyncStatus::Connecting)),
            (HostedEvent::Storage(StorageState::Synchronizing), Some(SyncStatus::Syncing)),
            (HostedEvent::Storage(StorageState::Synchronized), Some(SyncStatus::Synced)),
            (HostedEvent::OthersChanged, None),
        ];
        for (event, expected) in cases {
            assert_eq!(status_for(&event), expected, "{event:?}");
        }
    }

    #[tokio::test]
    async fn unavailable_service_leaves_session_unconnected() {
        let service = MemoryHostedService::new();
        service.set_unavailable(true);
        let sync = backend(&service);

        sync.start_sync(UserIdentity::new("u", "U"), params()).await.unwrap();
        assert_eq!(*sync.status().borrow(), SyncStatus::Unconnected);
        assert!(sync.shared_map(TableName::Topics).await.is_none());
    }

    #[tokio::test]
    async fn first_merge_never_overwrites_existing_entries() {
        let service = MemoryHostedService::new();
        let room = hash_room_name("team");
        service.seed(&room, TableName::Topics, "shared", topic("shared", "remote copy"));
        service.seed(&room, TableName::Topics, "b", topic("b", "remote only"));

        let sync = backend(&service);
        {
            let db = lock(&sync.core.db).unwrap();
            db.upsert_records(TableName::Topics, &[topic("shared", "local copy"), topic("a", "local only")])
                .unwrap();
        }

        sync.start_sync(UserIdentity::new("u", "U"), params()).await.unwrap();

        let local = sync.core.local_rows(TableName::Topics).unwrap();
        assert_eq!(local.len(), 3);
        assert_eq!(local["shared"]["title"], "local copy");

        let remote = service.map(&room, TableName::Topics);
        assert_eq!(remote.len(), 3);
        assert_eq!(remote["shared"]["title"], "remote copy");
        assert_eq!(remote["a"]["title"], "local only");
    }

    #[tokio::test]
    async fn remote_writes_are_pulled_and_removals_ignored() {
        let service = MemoryHostedService::new();
        let room = hash_room_name("team");
        let sync = backend(&service);
        sync.start_sync(UserIdentity::new("u", "U"), params()).await.unwrap();
        let mut topics = sync.observe_remote_changes(TableName::Topics);

        service.seed(&room, TableName::Topics, "t1", topic("t1", "from elsewhere"));
        let change = topics.recv().await.unwrap();
        assert_eq!(change.id, "t1");
        assert!(change.is_remote());

        let other = service
            .enter_room(&room, crate::hosted::RoomCredentials::PublicKey("pk".into()), None)
            .await
            .unwrap();
        other.delete_entry(TableName::Topics, "t1").await.unwrap();
        other.set_entries(TableName::Topics, vec![("t2".into(), topic("t2", "next"))])
            .await
            .unwrap();

        assert_eq!(topics.recv().await.unwrap().id, "t2");
        assert!(sync.core.local_rows(TableName::Topics).unwrap().contains_key("t1"));
    }

    #[tokio::test]
    async fn local_writes_reach_the_shared_map() {
        let service = MemoryHostedService::new();
        let sync = backend(&service);
        sync.start_sync(UserIdentity::new("u", "U"), params()).await.unwrap();

        sync.push_local_change(ChangeEvent::upsert(
            Origin::Local,
            TableName::Topics,
            "t9",
            topic("t9", "mine"),
        ));
        sync.push_local_change(ChangeEvent::upsert(
            Origin::Local,
            TableName::Files,
            "f1",
            json!({ "id": "f1" }),
        ));

        let mut map = BTreeMap::new();
        for _ in 0..50 {
            map = sync.shared_map(TableName::Topics).await.unwrap();
            if !map.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(map["t9"]["title"], "mine");
        assert!(sync.shared_map(TableName::Files).await.unwrap().is_empty());

        sync.disconnect().await;
        assert_eq!(service.members(&hash_room_name("team")), 0);
    }

    #[tokio::test]
    async fn rooms_with_different_passwords_stay_apart() {
        let service = MemoryHostedService::new();
        let room_one = hash_room_id("team", Some("one"));
        service.seed(&room_one, TableName::Topics, "t1", topic("t1", "first team"));

        let one = backend(&service);
        let two = backend(&service);
        one.start_sync(UserIdentity::new("a", "A"), params_with_password("one"))
            .await
            .unwrap();
        two.start_sync(UserIdentity::new("b", "B"), params_with_password("two"))
            .await
            .unwrap();

        assert!(one.core.local_rows(TableName::Topics).unwrap().contains_key("t1"));
        assert!(two.core.local_rows(TableName::Topics).unwrap().is_empty());
        assert!(two.shared_map(TableName::Topics).await.unwrap().is_empty());

        assert_eq!(service.members(&room_one), 1);
        assert_eq!(service.members(&hash_room_id("team", Some("two"))), 1);
        assert_eq!(service.members(&hash_room_name("team")), 0);
        assert!(one.awareness().borrow().iter().all(|p| p.identity.id != "b"));
    }
}
