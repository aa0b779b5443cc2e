//! # meridian-node
//!
//! Headless Meridian peer. Opens the local store, joins a peer sync room over
//! libp2p and keeps replicating until interrupted.

mod config;

use std::sync::Arc;

use meridian_net::{load_bootstrap_peers, GossipTransport};
use meridian_shared::{TableName, UserIdentity};
use meridian_store::{lock, Database, RecordModel, SharedDatabase};
use meridian_sync::{ConnectionParams, PeerParams, PeerSyncBackend, SyncBackend, SyncConfig, SyncSession};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::NodeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,meridian_sync=debug,meridian_net=debug")),
        )
        .init();

    info!("Starting Meridian node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::from_env();
    info!(?config, "Loaded configuration");
    let Some(room_name) = config.room_name.clone() else {
        anyhow::bail!("MERIDIAN_ROOM must be set");
    };

    let db = match &config.db_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    info!(path = ?db.path(), version = db.version(), "Opened local store");
    let db = db.into_shared();

    let identity = local_identity(&db, &config.display_name)?;
    info!(id = %identity.id, name = %identity.name, "Local identity");

    let mut signaling: Vec<String> = config.signaling_url.iter().cloned().collect();
    if let Some(path) = &config.bootstrap_file {
        signaling.extend(load_bootstrap_peers(path).iter().map(ToString::to_string));
    }

    let backend = Arc::new(PeerSyncBackend::new(
        db.clone(),
        Arc::new(GossipTransport::new(config.listen_port)),
        SyncConfig::from_env(),
    ));
    let params = ConnectionParams::Peer(PeerParams {
        room_name,
        password: config.password.clone(),
        signaling_url: (!signaling.is_empty()).then(|| signaling.join(",")),
    });
    let session = SyncSession::create("node", backend.clone(), identity, params).await?;

    spawn_event_logs(backend.as_ref());

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");
    session.destroy().await;

    Ok(())
}

/// The presence identity is the first local user; one is created on first run.
fn local_identity(db: &SharedDatabase, display_name: &str) -> anyhow::Result<UserIdentity> {
    let existing = lock(db)?.table(TableName::Users).all()?.into_iter().next();
    let user = match existing {
        Some(user) => user,
        None => {
            let users = RecordModel::new(db.clone(), TableName::Users)?;
            let created = users.create(json!({ "uuid": uuid::Uuid::new_v4().to_string() }), None)?;
            users
                .find_by_id(&created.id)?
                .ok_or_else(|| anyhow::anyhow!("user {} vanished after creation", created.id))?
        }
    };

    let id = user
        .get("uuid")
        .or_else(|| user.get("id"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let mut identity = UserIdentity::new(id, display_name);
    identity.avatar = user.get("avatar").and_then(|v| v.as_str()).map(str::to_string);
    Ok(identity)
}

fn spawn_event_logs(backend: &dyn SyncBackend) {
    let mut status = backend.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            info!(status = %current, "Sync status");
        }
    });

    let mut tables = backend.table_events();
    tokio::spawn(async move {
        loop {
            match tables.recv().await {
                Ok(table) => info!(table = %table, "Table changed"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Table event log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut presence = backend.awareness();
    tokio::spawn(async move {
        while presence.changed().await.is_ok() {
            let peers = presence.borrow_and_update().clone();
            let names: Vec<String> = peers.iter().map(|p| p.identity.name.clone()).collect();
            info!(count = peers.len(), peers = ?names, "Peers in room");
        }
    });
}
