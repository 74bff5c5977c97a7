//! Integration tests for the file-backed SQLite ledger
//!
//! Covers:
//! - Checkpoints surviving a reopen (resume after process death)
//! - Concurrent writers on different keys
//! - Snapshot supersession

#![cfg(feature = "sqlite")]

use migration_storage::{
    CheckpointStatus, CheckpointStore, EntitySnapshot, SnapshotSource, SnapshotStore,
    SqliteStore, VolatileFields,
};
use serde_json::json;
use tempfile::TempDir;

#[tokio::test]
async fn test_pending_checkpoints_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("ledger.db");

    {
        let store = SqliteStore::open(&db_path).unwrap();
        store.create("m1", "issue", "E-1", json!({"n": 1})).await.unwrap();
        store.create("m1", "issue", "E-2", json!({"n": 2})).await.unwrap();
        store
            .update("m1", "E-1", CheckpointStatus::Completed, None)
            .await
            .unwrap();
        // E-2 never reaches a terminal state: simulated crash
    }

    let reopened = SqliteStore::open(&db_path).unwrap();
    let pending = reopened.pending("m1", None).await.unwrap();

    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].entity_id, "E-2");
    assert_eq!(pending[0].payload, json!({"n": 2}));

    let summary = reopened.summary("m1").await.unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.pending, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_on_distinct_keys() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(dir.path().join("ledger.db")).unwrap();

    let mut handles = Vec::new();
    for i in 0..32 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let entity_id = format!("E-{}", i);
            store
                .create("m1", "issue", &entity_id, json!(i))
                .await
                .unwrap();
            let status = if i % 4 == 0 {
                CheckpointStatus::Failed
            } else {
                CheckpointStatus::Completed
            };
            store
                .update("m1", &entity_id, status, Some("worker"))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let summary = store.summary("m1").await.unwrap();
    assert_eq!(summary.total, 32);
    assert_eq!(summary.failed, 8);
    assert_eq!(summary.completed, 24);
    assert_eq!(summary.pending, 0);
}

#[tokio::test]
async fn test_snapshot_superseded_by_newer_capture() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(dir.path().join("ledger.db")).unwrap();
    let volatile = VolatileFields::default();

    let first = EntitySnapshot::capture(
        "42",
        "work_packages",
        &json!({"subject": "Old"}),
        SnapshotSource::Migration,
        &volatile,
    );
    let second = EntitySnapshot::capture(
        "42",
        "work_packages",
        &json!({"subject": "New"}),
        SnapshotSource::Migration,
        &volatile,
    );

    store.save_snapshot(&first).await.unwrap();
    store.save_snapshot(&second).await.unwrap();

    let loaded = store
        .get_snapshot("work_packages", "42")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.data, json!({"subject": "New"}));
    assert_eq!(loaded.checksum, second.checksum);
    assert_eq!(store.count_snapshots("work_packages").await.unwrap(), 1);
}
