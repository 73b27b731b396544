//! Integration tests for the snapshot store lifecycle.

use flowmill_snapshots::{SnapshotStore, TransientSnapshot};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

fn write_db_files(dir: &Path) -> bool {
    fs::write(dir.join("000001.sst"), b"db contents").is_ok()
}

async fn take_and_persist(
    store: &Arc<SnapshotStore>,
    index: u64,
    term: u64,
    processed: i64,
    exported: i64,
) -> flowmill_snapshots::PersistedSnapshot {
    let mut transient = store
        .new_transient(index, term, processed, exported)
        .await
        .unwrap()
        .expect("transient snapshot refused");
    assert!(transient.take(write_db_files).await.unwrap());
    transient.persist().await.unwrap()
}

#[tokio::test]
async fn test_latest_returns_largest_persisted_snapshot() {
    let dir = TempDir::new().unwrap();
    let store = SnapshotStore::open(dir.path(), 1).await.unwrap();

    assert!(store.latest().await.unwrap().is_none());

    take_and_persist(&store, 10, 1, 1, 1).await;
    take_and_persist(&store, 20, 1, 3, 3).await;
    let last = take_and_persist(&store, 30, 1, 5, 5).await;

    let latest = store.latest().await.unwrap().unwrap();
    assert_eq!(latest.id(), last.id());
    assert_eq!(latest.compaction_bound(), 5);
}

#[tokio::test]
async fn test_persist_deletes_prior_snapshots() {
    let dir = TempDir::new().unwrap();
    let store = SnapshotStore::open(dir.path(), 1).await.unwrap();

    take_and_persist(&store, 10, 1, 1, 1).await;
    take_and_persist(&store, 20, 1, 3, 3).await;
    take_and_persist(&store, 30, 1, 5, 5).await;

    assert_eq!(store.valid_snapshot_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_transient_at_unchanged_positions_gets_larger_id() {
    let dir = TempDir::new().unwrap();
    let store = SnapshotStore::open(dir.path(), 1).await.unwrap();

    let first = take_and_persist(&store, 10, 1, 2, 1).await;
    let second = take_and_persist(&store, 10, 1, 2, 1).await;

    assert_ne!(first.id(), second.id());
    assert!(second.id() > first.id());
    assert_eq!(first.compaction_bound(), second.compaction_bound());
}

#[tokio::test]
async fn test_transient_older_than_latest_is_refused() {
    let dir = TempDir::new().unwrap();
    let store = SnapshotStore::open(dir.path(), 1).await.unwrap();

    take_and_persist(&store, 20, 1, 5, 5).await;

    let refused = store.new_transient(10, 1, 3, 3).await.unwrap();
    assert!(refused.is_none());
}

#[tokio::test]
async fn test_write_failure_discards_pending_directory() {
    let dir = TempDir::new().unwrap();
    let store = SnapshotStore::open(dir.path(), 1).await.unwrap();

    let mut transient: TransientSnapshot =
        store.new_transient(10, 1, 1, 1).await.unwrap().unwrap();
    assert!(!transient.take(|_| false).await.unwrap());

    assert!(no_entries(&dir.path().join("pending")));
    assert!(no_entries(&dir.path().join("snapshots")));
}

#[tokio::test]
async fn test_persist_before_take_fails() {
    let dir = TempDir::new().unwrap();
    let store = SnapshotStore::open(dir.path(), 1).await.unwrap();

    let transient = store.new_transient(10, 1, 1, 1).await.unwrap().unwrap();
    assert!(transient.persist().await.is_err());
}

#[tokio::test]
async fn test_abort_removes_pending_directory() {
    let dir = TempDir::new().unwrap();
    let store = SnapshotStore::open(dir.path(), 1).await.unwrap();

    let mut transient = store.new_transient(10, 1, 1, 1).await.unwrap().unwrap();
    assert!(transient.take(write_db_files).await.unwrap());
    transient.abort().await.unwrap();

    assert!(no_entries(&dir.path().join("pending")));
    assert!(store.latest().await.unwrap().is_none());
}

#[tokio::test]
async fn test_abandoned_pending_directories_purged_on_open() {
    let dir = TempDir::new().unwrap();
    {
        let store = SnapshotStore::open(dir.path(), 1).await.unwrap();
        let mut transient = store.new_transient(10, 1, 1, 1).await.unwrap().unwrap();
        assert!(transient.take(write_db_files).await.unwrap());
        // Dropped without persist or abort, simulating a crash.
        drop(transient);
    }
    assert!(!no_entries(&dir.path().join("pending")));

    let _store = SnapshotStore::open(dir.path(), 1).await.unwrap();
    assert!(no_entries(&dir.path().join("pending")));
}

#[tokio::test]
async fn test_corrupted_snapshot_is_skipped_by_latest() {
    let dir = TempDir::new().unwrap();
    let store = SnapshotStore::open(dir.path(), 1).await.unwrap();

    let first = take_and_persist(&store, 10, 1, 1, 1).await;

    // Persist a second snapshot without deleting the first by corrupting
    // afterwards: take two snapshots, corrupt the latest, and verify.
    let second = take_and_persist(&store, 20, 1, 3, 3).await;
    corrupt_snapshot(second.path());

    // Verification marks the corrupted snapshot invalid.
    assert_eq!(store.valid_snapshot_count().await.unwrap(), 0);

    // The first snapshot was already deleted when the second persisted, so
    // nothing valid remains.
    let latest = store.latest().await.unwrap();
    assert!(latest.is_none(), "latest returned {latest:?}");
    assert_ne!(first.id(), second.id());
}

#[tokio::test]
async fn test_listener_notified_on_persist() {
    let dir = TempDir::new().unwrap();
    let store = SnapshotStore::open(dir.path(), 1).await.unwrap();

    let notifications = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notifications);
    store.add_listener(move |snapshot| {
        assert_eq!(snapshot.compaction_bound(), 1);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    take_and_persist(&store, 10, 1, 1, 1).await;
    assert_eq!(notifications.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_copy_snapshot_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let store = SnapshotStore::open(dir.path(), 1).await.unwrap();

    let snapshot = take_and_persist(&store, 10, 1, 1, 1).await;
    let dst = dir.path().join("runtime");
    store.copy_snapshot(&snapshot, &dst).await.unwrap();

    let copied = fs::read(dst.join("000001.sst")).unwrap();
    assert_eq!(copied, b"db contents");
    assert!(dst.join("CHECKSUM").exists());
}

#[tokio::test]
async fn test_ordinals_continue_after_reopen() {
    let dir = TempDir::new().unwrap();
    let first_id = {
        let store = SnapshotStore::open(dir.path(), 1).await.unwrap();
        take_and_persist(&store, 10, 1, 1, 1).await.id()
    };

    let store = SnapshotStore::open(dir.path(), 1).await.unwrap();
    let second = take_and_persist(&store, 10, 1, 1, 1).await;
    assert!(second.id() > first_id);
}

fn corrupt_snapshot(path: &Path) {
    let sst = fs::read_dir(path)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "sst").unwrap_or(false))
        .max()
        .unwrap();
    fs::write(sst, b"<--corrupted-->").unwrap();
}

fn no_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}
