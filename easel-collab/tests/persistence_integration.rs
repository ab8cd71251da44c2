//! Persistence and version history seen from the outside: flush on last
//! leave, durability across a restart, retention, and restore.

mod common;

use common::{close_code, eventually, start, Client};
use easel_collab::{
    DocId, DocumentStore, MemoryStore, RocksStore, ServerConfig, SnapshotTrigger, StaticVerifier, StoreConfig,
    SyncMessage, SyncService, CLOSE_GOING_AWAY, MAX_VERSIONS,
};
use easel_core::{Replica, Shape, ShapeId, ShapeOp};
use std::sync::Arc;
use std::time::Duration;

fn rect(id: &str) -> ShapeOp {
    ShapeOp::Create { shape: Shape::with_id(id, Shape::rectangle(10.0, 10.0, 30.0, 30.0).kind) }
}

fn ids(replica: &Replica) -> Vec<ShapeId> {
    replica.shapes().into_keys().collect()
}

#[tokio::test]
async fn test_last_leave_saves_once_then_removes_room() {
    let store = Arc::new(MemoryStore::new());
    let server = start(store.clone()).await;
    let doc: DocId = "solo".into();

    let mut alice = Client::join(server.addr, "solo", "alice-token").await;
    alice.edit(rect("a")).await;
    alice.edit(ShapeOp::Move { id: "a".into(), dx: 5.0, dy: 5.0 }).await;
    let expected = alice.replica.shapes();
    let service = Arc::clone(&server.service);
    eventually("edits applied", || {
        let service = Arc::clone(&service);
        let doc = doc.clone();
        let expected = expected.clone();
        async move { service.shapes(&doc).await.unwrap() == expected }
    })
    .await;
    alice.close().await;

    let registry = Arc::clone(server.service.registry());
    eventually("room removed", || {
        let registry = Arc::clone(&registry);
        async move { registry.room_count().await == 0 }
    })
    .await;

    assert_eq!(store.save_count(), 1);
    let saved = Replica::from_state(&store.state(&doc).await.unwrap()).unwrap();
    assert_eq!(saved.shapes(), expected);
}

#[tokio::test]
async fn test_failed_flush_is_counted_and_room_still_closes() {
    let store = Arc::new(MemoryStore::new());
    store.set_fail_saves(true);
    let server = start(store.clone()).await;

    let mut alice = Client::join(server.addr, "doc", "alice-token").await;
    alice.edit(rect("a")).await;
    alice.close().await;

    let service = Arc::clone(&server.service);
    eventually("failed flush settled", || {
        let service = Arc::clone(&service);
        async move {
            let stats = service.stats().await;
            stats.active_rooms == 0 && stats.persistence.failed_saves == 1
        }
    })
    .await;
}

async fn open_rocks(path: &std::path::Path) -> Arc<RocksStore> {
    // Aborted room tasks release their handle on the database asynchronously
    for _ in 0..100 {
        if let Ok(store) = RocksStore::open(StoreConfig::for_testing(path)) {
            return Arc::new(store);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("database at {} stayed locked", path.display());
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let doc: DocId = "durable".into();

    {
        let server = start(open_rocks(dir.path()).await).await;
        let mut alice = Client::join(server.addr, "durable", "alice-token").await;
        alice.edit(rect("kept")).await;
        let expected = alice.replica.shapes();
        let service = Arc::clone(&server.service);
        eventually("edit applied", || {
            let service = Arc::clone(&service);
            let doc = doc.clone();
            let expected = expected.clone();
            async move { service.shapes(&doc).await.unwrap() == expected }
        })
        .await;
        // Alice's socket leaves during shutdown and that leave flushes the room
        assert_eq!(server.service.shutdown().await, (0, 0));
    }

    let server = start(open_rocks(dir.path()).await).await;
    let bob = Client::join(server.addr, "durable", "bob-token").await;
    assert_eq!(ids(&bob.replica), vec![ShapeId::from("kept")]);
}

#[tokio::test]
async fn test_open_with_storage_path() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig { storage_path: Some(dir.path().join("db")), ..ServerConfig::for_testing() };
    let service = SyncService::open(config, Arc::new(StaticVerifier::new())).unwrap();
    let doc: DocId = "doc".into();

    service.apply_edit(&doc, "agent", rect("x")).await.unwrap();
    assert_eq!(service.load(&doc).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_version_history_is_capped() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_rocks(dir.path()).await;
    let server = start(store.clone()).await;
    let service = &server.service;
    let doc: DocId = "busy".into();

    let mut created = Vec::new();
    for i in 0..=MAX_VERSIONS {
        service.apply_edit(&doc, "agent", rect(&format!("s{i}"))).await.unwrap();
        created.push(service.create_snapshot(&doc, Some(format!("v{i}"))).await.unwrap().id);
    }

    let versions = service.list_versions(&doc).await.unwrap();
    assert_eq!(versions.len(), MAX_VERSIONS);
    assert_eq!(versions[0].id, created[1]);
    assert_eq!(versions[0].label.as_deref(), Some("v1"));
    assert!(versions.iter().all(|v| v.id != created[0]));
    assert!(store.get_version(created[0]).await.unwrap().is_none());
    assert_eq!(
        versions.iter().map(|v| v.ordinal).collect::<Vec<_>>(),
        (1..=MAX_VERSIONS).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_restore_replaces_live_state() {
    let server = start(Arc::new(MemoryStore::new())).await;
    let service = Arc::clone(&server.service);
    let doc: DocId = "doc".into();
    let mut alice = Client::join(server.addr, "doc", "alice-token").await;

    alice.edit(rect("a")).await;
    let v1_shapes = alice.replica.shapes();
    eventually("a applied", || {
        let service = Arc::clone(&service);
        let doc = doc.clone();
        async move { service.shapes(&doc).await.unwrap().len() == 1 }
    })
    .await;
    let v1 = service.create_snapshot(&doc, Some("v1".into())).await.unwrap();

    alice.edit(rect("b")).await;
    alice.edit(ShapeOp::Move { id: "a".into(), dx: 100.0, dy: 0.0 }).await;
    eventually("b applied", || {
        let service = Arc::clone(&service);
        let doc = doc.clone();
        async move { service.shapes(&doc).await.unwrap().len() == 2 }
    })
    .await;
    service.create_snapshot(&doc, Some("v2".into())).await.unwrap();

    let restored = service.restore(&doc, v1.id).await.unwrap();

    alice.absorb_update().await;
    let notice = alice.expect("version_restored").await;
    assert_eq!(notice, SyncMessage::VersionRestored { version_id: v1.id, ordinal: 1 });
    assert_eq!(alice.replica.shapes(), v1_shapes);
    assert_eq!(service.shapes(&doc).await.unwrap(), v1_shapes);

    let versions = service.list_versions(&doc).await.unwrap();
    assert_eq!(versions.len(), 3);
    let last = &versions[2];
    assert_eq!(last.id, restored.id);
    assert_eq!(last.trigger, SnapshotTrigger::Restore);
    assert_eq!(last.label.as_deref(), Some("Restored from #1 (v1)"));
}

#[tokio::test]
async fn test_restored_away_shapes_do_not_come_back() {
    let store = Arc::new(MemoryStore::new());
    let server = start(store.clone()).await;
    let service = Arc::clone(&server.service);
    let doc: DocId = "doc".into();

    let mut alice = Client::join(server.addr, "doc", "alice-token").await;
    let v1 = service.create_snapshot(&doc, Some("empty".into())).await.unwrap();

    let mut bob = Client::join(server.addr, "doc", "bob-token").await;
    bob.edit(rect("doomed")).await;
    alice.absorb_update().await;
    let stale = bob.replica.encode_state();
    bob.close().await;

    service.restore(&doc, v1.id).await.unwrap();
    alice.absorb_update().await;
    assert!(alice.replica.is_empty());

    // Bob comes back with his pre-restore state
    let bob = Client::join_with(server.addr, "doc", "bob-token", Replica::from_state(&stale).unwrap()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(service.shapes(&doc).await.unwrap().is_empty());
    assert!(bob.replica.is_empty());

    // Nor through the stored state
    service.save(&doc).await.unwrap();
    let saved = Replica::from_state(&store.state(&doc).await.unwrap()).unwrap();
    assert!(saved.is_empty());

    bob.close().await;
    alice.close().await;
    eventually("room closed", || {
        let service = Arc::clone(&service);
        async move { service.registry().room_count().await == 0 }
    })
    .await;
    let saved = Replica::from_state(&store.state(&doc).await.unwrap()).unwrap();
    assert!(saved.is_empty());
}

#[tokio::test]
async fn test_shutdown_closes_sockets_before_final_flush() {
    let store = Arc::new(MemoryStore::new());
    let server = start(store.clone()).await;
    let service = Arc::clone(&server.service);
    let doc: DocId = "doc".into();

    let mut alice = Client::join(server.addr, "doc", "alice-token").await;
    alice.edit(rect("last-edit")).await;
    eventually("edit applied", || {
        let service = Arc::clone(&service);
        let doc = doc.clone();
        async move { service.shapes(&doc).await.unwrap().contains_key(&"last-edit".into()) }
    })
    .await;

    assert_eq!(service.shutdown().await, (0, 0));
    let stats = service.stats().await;
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.active_rooms, 0);
    assert_eq!(store.save_count(), 1);
    let saved = Replica::from_state(&store.state(&doc).await.unwrap()).unwrap();
    assert!(saved.contains(&"last-edit".into()));
    assert_eq!(close_code(&mut alice.ws).await, Some(CLOSE_GOING_AWAY));
}

#[tokio::test]
async fn test_restore_of_unknown_version_changes_nothing() {
    let server = start(Arc::new(MemoryStore::new())).await;
    let doc: DocId = "doc".into();
    server.service.apply_edit(&doc, "agent", rect("a")).await.unwrap();

    assert!(server.service.restore(&doc, uuid::Uuid::new_v4()).await.is_err());
    assert_eq!(server.service.shapes(&doc).await.unwrap().len(), 1);
    assert!(server.service.list_versions(&doc).await.unwrap().is_empty());
}
