//! Sync sessions and the registry that keeps at most one per id.

use std::collections::HashMap;
use std::sync::Arc;

use meridian_shared::{ChangeEvent, UserIdentity};
use meridian_store::ChangeSink;
use tokio::sync::Mutex;
use tracing::info;

use crate::backend::{ConnectionParams, SyncBackend};
use crate::error::Result;

/// A started backend plus the sink record models write through.
pub struct SyncSession {
    id: String,
    backend: Arc<dyn SyncBackend>,
}

struct BackendSink(Arc<dyn SyncBackend>);

impl ChangeSink for BackendSink {
    fn push(&self, change: ChangeEvent) {
        self.0.push_local_change(change);
    }
}

impl SyncSession {
    pub async fn create(
        id: impl Into<String>,
        backend: Arc<dyn SyncBackend>,
        identity: UserIdentity,
        params: ConnectionParams,
    ) -> Result<Self> {
        let id = id.into();
        backend.start_sync(identity, params).await?;
        info!(session = %id, "Sync session started");
        Ok(Self { id, backend })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend(&self) -> &Arc<dyn SyncBackend> {
        &self.backend
    }

    /// Hand to [`meridian_store::RecordModel::with_sink`].
    pub fn sink(&self) -> Arc<dyn ChangeSink> {
        Arc::new(BackendSink(self.backend.clone()))
    }

    pub async fn destroy(&self) {
        self.backend.disconnect().await;
        info!(session = %self.id, "Sync session destroyed");
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<SyncSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session under `id`. A session already cached under the same id
    /// is destroyed first, so two transports never write the same tables.
    pub async fn open(
        &self,
        id: &str,
        backend: Arc<dyn SyncBackend>,
        identity: UserIdentity,
        params: ConnectionParams,
    ) -> Result<Arc<SyncSession>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(previous) = sessions.remove(id) {
            previous.destroy().await;
        }
        let session = Arc::new(SyncSession::create(id, backend, identity, params).await?);
        sessions.insert(id.to_string(), session.clone());
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<SyncSession>> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Returns whether a session was open.
    pub async fn close(&self, id: &str) -> bool {
        let previous = self.sessions.lock().await.remove(id);
        match previous {
            Some(session) => {
                session.destroy().await;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use meridian_net::MemoryHub;
    use meridian_shared::crypto::room_topic;
    use meridian_store::{Database, OpenOptions};

    use super::*;
    use crate::backend::PeerParams;
    use crate::config::SyncConfig;
    use crate::peer::PeerSyncBackend;

    fn peer(hub: &MemoryHub) -> Arc<dyn SyncBackend> {
        let db = Database::open_in_memory(&OpenOptions::default())
            .unwrap()
            .into_shared();
        Arc::new(PeerSyncBackend::new(db, Arc::new(hub.clone()), SyncConfig::default()))
    }

    fn params() -> ConnectionParams {
        ConnectionParams::Peer(PeerParams {
            room_name: "room".into(),
            password: None,
            signaling_url: None,
        })
    }

    #[tokio::test]
    async fn reopening_an_id_destroys_the_cached_session() {
        let hub = MemoryHub::new();
        let registry = SessionRegistry::new();
        let identity = UserIdentity::new("u", "U");

        let first = registry
            .open("main", peer(&hub), identity.clone(), params())
            .await
            .unwrap();
        registry
            .open("main", peer(&hub), identity, params())
            .await
            .unwrap();
        for _ in 0..10 {
            if hub.connections(&room_topic("room")) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(hub.connections(&room_topic("room")), 1);
        assert!(first.backend().shared_map(meridian_shared::TableName::Topics).await.is_none());

        assert!(registry.close("main").await);
        assert!(!registry.close("main").await);
        assert!(registry.get("main").await.is_none());
    }
}
