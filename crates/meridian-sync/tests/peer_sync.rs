use std::sync::Arc;
use std::time::Duration;

use meridian_net::MemoryHub;
use meridian_shared::crypto::room_topic;
use meridian_shared::{ChangeEvent, Origin, SyncStatus, TableName, UserIdentity};
use meridian_store::{lock, Database, OpenOptions, RecordModel, SharedDatabase};
use meridian_sync::{ConnectionParams, PeerParams, PeerSyncBackend, SyncBackend, SyncConfig, SyncSession};
use serde_json::{json, Value};

fn database(rows: &[(&str, &str)]) -> SharedDatabase {
    let db = Database::open_in_memory(&OpenOptions::default())
        .unwrap()
        .into_shared();
    let records: Vec<Value> = rows
        .iter()
        .map(|(id, title)| json!({ "id": id, "title": title, "createdAt": 1, "updatedAt": 1 }))
        .collect();
    lock(&db).unwrap().upsert_records(TableName::Topics, &records).unwrap();
    db
}

fn params(password: &str) -> ConnectionParams {
    ConnectionParams::Peer(PeerParams {
        room_name: "household".into(),
        password: Some(password.into()),
        signaling_url: None,
    })
}

fn topic_ids(db: &SharedDatabase) -> Vec<String> {
    lock(db).unwrap().table(TableName::Topics).ids().unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

fn quick_config() -> SyncConfig {
    SyncConfig {
        throttle: Duration::from_millis(50),
        debounce: Duration::from_millis(200),
        ..SyncConfig::default()
    }
}

async fn wait_for_status(backend: &PeerSyncBackend, wanted: SyncStatus) {
    let mut status = backend.status();
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| *s == wanted))
        .await
        .expect("status reached in time")
        .unwrap();
}

async fn start(hub: &MemoryHub, db: SharedDatabase, name: &str, password: &str) -> Arc<PeerSyncBackend> {
    let backend = Arc::new(PeerSyncBackend::new(db, Arc::new(hub.clone()), quick_config()));
    backend
        .start_sync(UserIdentity::new(name, name), params(password))
        .await
        .unwrap();
    backend
}

#[tokio::test]
async fn peers_with_disjoint_rows_converge_on_the_union() {
    let hub = MemoryHub::new();
    let db_a = database(&[("a1", "alpha"), ("a2", "alpha two")]);
    let db_b = database(&[("b1", "beta")]);

    let a = start(&hub, db_a.clone(), "ada", "secret").await;
    let b = start(&hub, db_b.clone(), "bob", "secret").await;

    let expected = vec!["a1".to_string(), "a2".to_string(), "b1".to_string()];
    eventually(|| {
        let mut ids = topic_ids(&db_a);
        ids.sort();
        ids == expected
    })
    .await;
    eventually(|| {
        let mut ids = topic_ids(&db_b);
        ids.sort();
        ids == expected
    })
    .await;

    let mut presence = a.awareness();
    presence.wait_for(|peers| peers.len() == 2).await.unwrap();
    let peers = presence.borrow().clone();
    assert!(peers[0].is_current_user);
    assert_eq!(peers[1].identity.name, "bob");

    let map = b.shared_map(TableName::Topics).await.unwrap();
    assert_eq!(map.len(), 3);

    wait_for_status(&a, SyncStatus::Synced).await;
    wait_for_status(&b, SyncStatus::Synced).await;

    a.push_local_change(ChangeEvent::upsert(
        Origin::Local,
        TableName::Topics,
        "a3",
        json!({ "id": "a3", "title": "alpha three", "createdAt": 2, "updatedAt": 2 }),
    ));
    wait_for_status(&a, SyncStatus::Syncing).await;
    eventually(|| topic_ids(&db_b).contains(&"a3".to_string())).await;
    wait_for_status(&a, SyncStatus::Synced).await;
    wait_for_status(&b, SyncStatus::Synced).await;
}

#[tokio::test]
async fn local_writes_and_deletes_propagate_through_the_session_sink() {
    let hub = MemoryHub::new();
    let db_a = database(&[]);
    let db_b = database(&[]);

    let session = SyncSession::create(
        "a",
        Arc::new(PeerSyncBackend::new(db_a.clone(), Arc::new(hub.clone()), SyncConfig::default())),
        UserIdentity::new("ada", "Ada"),
        params("pw"),
    )
    .await
    .unwrap();
    let b = start(&hub, db_b.clone(), "bob", "pw").await;
    let mut b_topics = b.observe_remote_changes(TableName::Topics);

    let topics = RecordModel::new(db_a.clone(), TableName::Topics)
        .unwrap()
        .with_sink(session.sink());
    eventually(|| hub.connections(&room_topic("household")) == 2).await;

    topics.create(json!({ "title": "groceries" }), Some("t1")).unwrap();
    let change = b_topics.recv().await.unwrap();
    assert_eq!(change.id, "t1");
    assert!(change.is_remote());

    topics.delete("t1").unwrap();
    eventually(|| topic_ids(&db_b).is_empty()).await;
}

#[tokio::test]
async fn wrong_password_keeps_rooms_apart() {
    let hub = MemoryHub::new();
    let db_a = database(&[("a1", "alpha")]);
    let db_b = database(&[("b1", "beta")]);

    let _a = start(&hub, db_a.clone(), "ada", "one").await;
    let _b = start(&hub, db_b.clone(), "bob", "two").await;

    eventually(|| hub.connections(&room_topic("household")) == 2).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(topic_ids(&db_a), vec!["a1".to_string()]);
    assert_eq!(topic_ids(&db_b), vec!["b1".to_string()]);
}

#[tokio::test]
async fn repeated_reconnects_keep_a_single_transport() {
    let hub = MemoryHub::new();
    let db_a = database(&[("a1", "alpha")]);
    let db_b = database(&[]);

    let a = start(&hub, db_a.clone(), "ada", "pw").await;
    let b = start(&hub, db_b.clone(), "bob", "pw").await;
    eventually(|| topic_ids(&db_b).len() == 1).await;

    a.reconnect().await.unwrap();
    a.reconnect().await.unwrap();
    eventually(|| hub.connections(&room_topic("household")) == 2).await;

    let mut a_topics = a.observe_remote_changes(TableName::Topics);
    let late = RecordModel::new(db_b.clone(), TableName::Topics)
        .unwrap()
        .with_sink(Arc::new(SinkTo(b.clone())));
    // Let the new connection's snapshot exchange settle first.
    tokio::time::sleep(Duration::from_millis(200)).await;
    while a_topics.try_recv().is_some() {}

    late.create(json!({ "title": "late" }), Some("late")).unwrap();
    eventually(|| topic_ids(&db_a).contains(&"late".to_string())).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut seen = 0;
    while let Some(change) = a_topics.try_recv() {
        if change.id == "late" {
            seen += 1;
        }
    }
    assert_eq!(seen, 1);
    assert_ne!(*a.status().borrow(), SyncStatus::Unconnected);
}

#[tokio::test(start_paused = true)]
async fn lost_connectivity_reports_unconnected_until_reconnect() {
    let hub = MemoryHub::new();
    let db = database(&[]);
    let a = start(&hub, db, "ada", "pw").await;
    let mut status = a.status();
    status.wait_for(|s| *s == SyncStatus::Ready).await.unwrap();

    hub.set_online(false);
    status
        .wait_for(|s| *s == SyncStatus::Unconnected)
        .await
        .unwrap();

    a.reconnect().await.unwrap();
    assert_eq!(*a.status().borrow(), SyncStatus::Unconnected);

    hub.set_online(true);
    a.reconnect().await.unwrap();
    status.wait_for(|s| *s == SyncStatus::Ready).await.unwrap();
}

struct SinkTo(Arc<PeerSyncBackend>);

impl meridian_store::ChangeSink for SinkTo {
    fn push(&self, change: meridian_shared::ChangeEvent) {
        self.0.push_local_change(change);
    }
}
