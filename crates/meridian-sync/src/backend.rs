//! The backend-independent sync surface.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use meridian_shared::{ChangeEvent, ChangeKind, Origin, PeerPresence, SyncStatus, TableName, UserIdentity};
use meridian_store::{lock, SharedDatabase};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::awareness::AwarenessTracker;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::status::StatusReporter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerParams {
    pub room_name: String,
    pub password: Option<String>,
    pub signaling_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostedParams {
    pub room_name: String,
    /// Folded into the room id, so clients with different passwords land in
    /// different hosted rooms.
    pub password: Option<String>,
    pub public_api_key: Option<String>,
    pub access_code_for_auth_endpoint: Option<String>,
    /// Where to trade the access code for a room token.
    pub auth_endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ConnectionParams {
    Peer(PeerParams),
    Hosted(HostedParams),
}

/// One replication strategy for the synced tables.
///
/// Transport failures never surface as errors: they are logged and reported
/// through [`SyncBackend::status`]. Only misuse (wrong parameters, reconnect
/// before start) and store failures are returned.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    async fn start_sync(&self, identity: UserIdentity, params: ConnectionParams) -> Result<()>;

    /// Tear down every transport resource, then connect again from scratch.
    async fn reconnect(&self) -> Result<()>;

    async fn disconnect(&self);

    /// Current content of the shared map mirroring `table`, if connected.
    async fn shared_map(&self, table: TableName) -> Option<BTreeMap<String, Value>>;

    /// Remote-origin changes of `table`, after they were written locally.
    fn observe_remote_changes(&self, table: TableName) -> RemoteChanges;

    /// Queue a committed local write for propagation. Never blocks.
    fn push_local_change(&self, change: ChangeEvent);

    fn status(&self) -> watch::Receiver<SyncStatus>;

    /// Throttled per-table change notifications.
    fn table_events(&self) -> broadcast::Receiver<TableName>;

    fn awareness(&self) -> watch::Receiver<Vec<PeerPresence>>;

    fn set_local_identity(&self, identity: UserIdentity);
}

/// Stream of remote changes for one table.
pub struct RemoteChanges {
    table: TableName,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl RemoteChanges {
    pub fn table(&self) -> TableName {
        self.table
    }

    /// `None` once the backend is gone.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(change) if change.table == self.table => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(table = %self.table, skipped, "remote change observer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(change) if change.table == self.table => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// State both backends share: the store, status reporting, presence and the
/// remote change fan-out.
#[derive(Clone)]
pub(crate) struct SyncCore {
    pub db: SharedDatabase,
    pub config: SyncConfig,
    pub reporter: StatusReporter,
    pub awareness: Arc<AwarenessTracker>,
    remote: broadcast::Sender<ChangeEvent>,
}

impl SyncCore {
    pub fn new(db: SharedDatabase, config: SyncConfig) -> Self {
        let (remote, _) = broadcast::channel(1024);
        Self {
            db,
            reporter: StatusReporter::from_config(&config),
            config,
            awareness: Arc::new(AwarenessTracker::new()),
            remote,
        }
    }

    pub fn observe(&self, table: TableName) -> RemoteChanges {
        RemoteChanges {
            table,
            rx: self.remote.subscribe(),
        }
    }

    /// Every row of `table` keyed by id.
    pub fn local_rows(&self, table: TableName) -> Result<BTreeMap<String, Value>> {
        let rows = lock(&self.db)?.table(table).all()?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.get("id")?.as_str()?.to_string();
                Some((id, row))
            })
            .collect())
    }

    /// Write remote changes into the store in arrival order, then notify
    /// observers. Local echoes are dropped.
    pub fn apply_remote(&self, changes: Vec<ChangeEvent>) -> Result<usize> {
        let changes: Vec<ChangeEvent> = changes
            .into_iter()
            .filter(|change| match change.origin {
                Origin::Remote => change.table.is_synced(),
                Origin::Local => false,
            })
            .collect();
        if changes.is_empty() {
            return Ok(0);
        }

        {
            let db = lock(&self.db)?;
            for change in &changes {
                match &change.kind {
                    ChangeKind::Upsert(record) => {
                        db.upsert_records(change.table, std::slice::from_ref(record))?;
                    }
                    ChangeKind::Delete => {
                        db.delete_records(change.table, std::slice::from_ref(&change.id))?;
                    }
                }
            }
        }

        let mut touched = Vec::new();
        for change in &changes {
            if !touched.contains(&change.table) {
                touched.push(change.table);
            }
        }
        let applied = changes.len();
        for change in changes {
            let _ = self.remote.send(change);
        }
        for table in touched {
            self.reporter.table_changed(table);
        }

        debug!(applied, "applied remote changes");
        Ok(applied)
    }

    pub fn mark_disconnected(&self) {
        self.reporter.reset();
        self.reporter.set_status(SyncStatus::Unconnected);
        self.awareness.clear_remote();
        self.awareness.set_local_connection(None);
    }
}
