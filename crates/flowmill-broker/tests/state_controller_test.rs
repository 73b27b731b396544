//! State controller lifecycle: open, close, snapshot, recover.

use flowmill_broker::db::FileDbFactory;
use flowmill_broker::state::StateController;
use flowmill_core::IndexedEntry;
use flowmill_runtime::{ActorScheduler, TaskError};
use flowmill_snapshots::SnapshotStore;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

struct Setup {
    controller: StateController,
    store: Arc<SnapshotStore>,
    exporter_position: Arc<AtomicI64>,
    runtime_dir: PathBuf,
    _dir: TempDir,
}

async fn setup() -> Setup {
    let dir = TempDir::new().unwrap();
    let partition_dir = dir.path().join("partition-1");
    let store = SnapshotStore::open(&partition_dir, 1).await.unwrap();
    let runtime_dir = partition_dir.join("runtime");

    let exporter_position = Arc::new(AtomicI64::new(i64::MAX));
    let exporter = Arc::clone(&exporter_position);

    let controller = StateController::new(
        ActorScheduler::new().spawn_actor("StateController-1"),
        1,
        Arc::new(FileDbFactory::new()),
        Arc::clone(&store),
        runtime_dir.clone(),
        Arc::new(|position| Some(IndexedEntry::new(position.max(0) as u64, 1))),
        Arc::new(move |_db: &dyn flowmill_broker::db::StateDb| exporter.load(Ordering::SeqCst)),
    );

    Setup {
        controller,
        store,
        exporter_position,
        runtime_dir,
        _dir: dir,
    }
}

async fn take_and_persist(setup: &Setup, position: i64) -> flowmill_snapshots::PersistedSnapshot {
    let transient = setup
        .controller
        .take_transient_snapshot(position)
        .await
        .unwrap()
        .expect("no transient snapshot was taken");
    transient.persist().await.unwrap()
}

#[tokio::test]
async fn test_no_snapshot_when_db_closed() {
    let setup = setup().await;

    assert!(!setup.controller.is_db_opened());
    let result = setup.controller.take_transient_snapshot(1).await.unwrap();
    assert!(result.is_none());

    // No filesystem mutation happened.
    assert!(!setup.runtime_dir.exists());
    assert!(setup.store.latest().await.unwrap().is_none());
}

#[tokio::test]
async fn test_snapshot_encodes_exporter_position_as_compaction_bound() {
    let setup = setup().await;
    setup.exporter_position.store(0, Ordering::SeqCst);
    setup.controller.open_db().await.unwrap();

    let snapshot = take_and_persist(&setup, 1).await;

    assert_eq!(snapshot.compaction_bound(), 0);
    assert!(snapshot.id().contains("0000000000000000000"));
}

#[tokio::test]
async fn test_snapshot_round_trip_preserves_state() {
    let setup = setup().await;
    setup.exporter_position.store(3, Ordering::SeqCst);

    let db = setup.controller.open_db().await.unwrap();
    db.put(b"x", b"3").unwrap();

    take_and_persist(&setup, 2).await;
    setup.controller.close_db().await.unwrap();
    setup.controller.recover().await.unwrap();
    let db = setup.controller.open_db().await.unwrap();

    assert_eq!(db.get(b"x").unwrap(), Some(b"3".to_vec()));
}

#[tokio::test]
async fn test_unchanged_exporter_position_still_snapshots() {
    let setup = setup().await;
    setup.exporter_position.store(1, Ordering::SeqCst);
    setup.controller.open_db().await.unwrap();

    let first = take_and_persist(&setup, 2).await;
    let second = take_and_persist(&setup, 3).await;

    assert_eq!(first.compaction_bound(), second.compaction_bound());
    assert_ne!(first.id(), second.id());
    assert!(second.id() > first.id());
}

#[tokio::test]
async fn test_unchanged_processed_position_still_snapshots() {
    let setup = setup().await;
    setup.exporter_position.store(2, Ordering::SeqCst);
    setup.controller.open_db().await.unwrap();

    let first = take_and_persist(&setup, 2).await;
    setup.exporter_position.store(3, Ordering::SeqCst);
    let second = take_and_persist(&setup, 2).await;

    assert_eq!(first.compaction_bound(), second.compaction_bound());
    assert_ne!(first.id(), second.id());
    assert!(second.id() > first.id());
}

#[tokio::test]
async fn test_recover_without_snapshot_leaves_db_closed() {
    let setup = setup().await;

    setup.controller.recover().await.unwrap();

    assert!(!setup.controller.is_db_opened());
}

#[tokio::test]
async fn test_recover_discards_pre_existing_database() {
    let setup = setup().await;

    let db = setup.controller.open_db().await.unwrap();
    db.put(b"x", b"1").unwrap();
    setup.controller.close_db().await.unwrap();
    setup.controller.recover().await.unwrap();
    assert!(!setup.controller.is_db_opened());

    let db = setup.controller.open_db().await.unwrap();
    assert_eq!(db.get(b"x").unwrap(), None);
}

#[tokio::test]
async fn test_recover_uses_latest_snapshot() {
    let setup = setup().await;
    setup.exporter_position.store(i64::MAX, Ordering::SeqCst);

    let db = setup.controller.open_db().await.unwrap();
    db.put(b"x", b"1").unwrap();
    take_and_persist(&setup, 1).await;
    db.put(b"x", b"2").unwrap();
    take_and_persist(&setup, 2).await;
    db.put(b"x", b"3").unwrap();
    take_and_persist(&setup, 3).await;

    setup.controller.close_db().await.unwrap();
    setup.controller.recover().await.unwrap();
    let db = setup.controller.open_db().await.unwrap();

    assert_eq!(db.get(b"x").unwrap(), Some(b"3".to_vec()));
}

#[tokio::test]
async fn test_corrupted_snapshot_fails_open_not_recover() {
    let setup = setup().await;

    let db = setup.controller.open_db().await.unwrap();
    db.put(b"x", b"1").unwrap();
    take_and_persist(&setup, 1).await;
    setup.controller.close_db().await.unwrap();

    let latest = setup.store.latest().await.unwrap().unwrap();
    corrupt_largest_table(latest.path());

    // The copy is byte-for-byte; corruption surfaces on open.
    setup.controller.recover().await.unwrap();
    let result = setup.controller.open_db().await;
    assert!(matches!(result, Err(TaskError::Failed(_))));

    // Probing detects the checksum mismatch.
    assert_eq!(setup.controller.valid_snapshot_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_valid_snapshot_count_counts_retained_snapshots() {
    let setup = setup().await;
    setup.exporter_position.store(i64::MAX, Ordering::SeqCst);
    setup.controller.open_db().await.unwrap();

    assert_eq!(setup.controller.valid_snapshot_count().await.unwrap(), 0);

    take_and_persist(&setup, 1).await;
    take_and_persist(&setup, 3).await;
    let last = take_and_persist(&setup, 5).await;

    // A sixth transient is requested but never persisted.
    let transient = setup
        .controller
        .take_transient_snapshot(6)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(setup.controller.valid_snapshot_count().await.unwrap(), 1);
    let latest = setup.store.latest().await.unwrap().unwrap();
    assert_eq!(latest.id(), last.id());
    assert_eq!(latest.compaction_bound(), 5);

    transient.abort().await.unwrap();
}

#[tokio::test]
async fn test_missing_indexed_entry_fails_with_invariant_violation() {
    let dir = TempDir::new().unwrap();
    let partition_dir = dir.path().join("partition-1");
    let store = SnapshotStore::open(&partition_dir, 1).await.unwrap();

    let controller = StateController::new(
        ActorScheduler::new().spawn_actor("StateController-1"),
        1,
        Arc::new(FileDbFactory::new()),
        Arc::clone(&store),
        partition_dir.join("runtime"),
        Arc::new(|_| None),
        Arc::new(|_db: &dyn flowmill_broker::db::StateDb| i64::MAX),
    );

    controller.open_db().await.unwrap();
    let result = controller.take_transient_snapshot(1).await;
    assert!(matches!(result, Err(TaskError::InvariantViolation(_))));

    // No pending directory remains.
    let pending: Vec<_> = fs::read_dir(partition_dir.join("pending"))
        .unwrap()
        .collect();
    assert!(pending.is_empty());
}

#[tokio::test]
async fn test_failed_snapshot_write_discards_transient() {
    let setup = setup().await;
    let db = setup.controller.open_db().await.unwrap();
    db.put(b"x", b"1").unwrap();
    db.close().unwrap();

    // The database handle is closed underneath the controller, so the write
    // function reports failure.
    let result = setup.controller.take_transient_snapshot(1).await.unwrap();
    assert!(result.is_none());
    assert!(setup.store.latest().await.unwrap().is_none());
}

#[tokio::test]
async fn test_close_deletes_runtime_directory() {
    let setup = setup().await;
    setup.controller.open_db().await.unwrap();
    assert!(setup.runtime_dir.exists());

    setup.controller.close_db().await.unwrap();

    assert!(!setup.controller.is_db_opened());
    assert!(!setup.runtime_dir.exists());
}

#[tokio::test]
async fn test_compaction_bound_is_non_decreasing() {
    let setup = setup().await;
    setup.controller.open_db().await.unwrap();

    let mut previous_bound = i64::MIN;
    for (processed, exported) in [(1, 2), (3, 2), (3, 4), (5, 9)] {
        setup.exporter_position.store(exported, Ordering::SeqCst);
        let snapshot = take_and_persist(&setup, processed).await;
        assert!(
            snapshot.compaction_bound() >= previous_bound,
            "bound regressed: {} < {}",
            snapshot.compaction_bound(),
            previous_bound
        );
        previous_bound = snapshot.compaction_bound();
    }
}

fn corrupt_largest_table(snapshot_path: &Path) {
    let table = fs::read_dir(snapshot_path)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().map(|ext| ext == "sst").unwrap_or(false))
        .max()
        .unwrap();
    fs::write(table, b"<--corrupted-->").unwrap();
}
