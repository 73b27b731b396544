//! The persistent snapshot store of one partition.

use crate::checksum;
use crate::error::{Result, SnapshotError};
use crate::metadata::SnapshotMetadata;
use crate::transient::TransientSnapshot;
use flowmill_core::{PartitionId, Position};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tracing::{debug, info, trace, warn};

const PENDING_DIR: &str = "pending";
const SNAPSHOTS_DIR: &str = "snapshots";

/// An immutable, published snapshot.
#[derive(Clone, Debug)]
pub struct PersistedSnapshot {
    metadata: SnapshotMetadata,
    path: PathBuf,
}

impl PersistedSnapshot {
    pub fn id(&self) -> String {
        self.metadata.file_name()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    pub fn index(&self) -> u64 {
        self.metadata.index
    }

    pub fn term(&self) -> u64 {
        self.metadata.term
    }

    /// The lowest log position that must be retained for this snapshot.
    pub fn compaction_bound(&self) -> Position {
        self.metadata.compaction_bound()
    }
}

type PersistListener = Arc<dyn Fn(&PersistedSnapshot) + Send + Sync>;

struct StoreInner {
    /// Snapshot ids that failed checksum verification; skipped by
    /// [`SnapshotStore::latest`] from the moment they are discovered.
    invalid: HashSet<String>,
    listeners: Vec<PersistListener>,
    next_ordinal: u64,
}

/// Owns the `pending/` and `snapshots/` directories of one partition.
pub struct SnapshotStore {
    partition_id: PartitionId,
    pending_dir: PathBuf,
    snapshots_dir: PathBuf,
    inner: Mutex<StoreInner>,
}

impl SnapshotStore {
    /// Open (or create) the store under `root`. Partial pending directories
    /// left behind by a crash are deleted.
    pub async fn open(root: impl AsRef<Path>, partition_id: PartitionId) -> Result<Arc<Self>> {
        let root = root.as_ref();
        let pending_dir = root.join(PENDING_DIR);
        let snapshots_dir = root.join(SNAPSHOTS_DIR);
        fs::create_dir_all(&pending_dir).await?;
        fs::create_dir_all(&snapshots_dir).await?;

        // Crash recovery: anything still pending was never published.
        let mut entries = fs::read_dir(&pending_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            warn!(
                partition_id,
                path = %entry.path().display(),
                "Deleting abandoned pending snapshot"
            );
            let _ = fs::remove_dir_all(entry.path()).await;
        }

        let store = Arc::new(Self {
            partition_id,
            pending_dir,
            snapshots_dir,
            inner: Mutex::new(StoreInner {
                invalid: HashSet::new(),
                listeners: Vec::new(),
                next_ordinal: 1,
            }),
        });

        let persisted = store.scan().await?;
        if let Some(max_ordinal) = persisted.iter().map(|s| s.metadata.ordinal).max() {
            store.inner.lock().expect("store state poisoned").next_ordinal = max_ordinal + 1;
        }

        info!(
            partition_id,
            snapshots = persisted.len(),
            "Snapshot store opened"
        );
        Ok(store)
    }

    /// All persisted snapshots, sorted ascending by metadata (equivalently,
    /// by name). Directories with unparseable names are skipped.
    async fn scan(&self) -> Result<Vec<PersistedSnapshot>> {
        let mut snapshots = Vec::new();
        let mut entries = fs::read_dir(&self.snapshots_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            match SnapshotMetadata::parse(&name) {
                Ok(metadata) => snapshots.push(PersistedSnapshot {
                    metadata,
                    path: entry.path(),
                }),
                Err(_) => warn!(
                    partition_id = self.partition_id,
                    name, "Ignoring directory with invalid snapshot name"
                ),
            }
        }
        snapshots.sort_by_key(|s| s.metadata);
        Ok(snapshots)
    }

    /// The largest snapshot by name that has not been marked invalid. This
    /// path does not verify checksums; corruption is discovered by
    /// [`SnapshotStore::valid_snapshot_count`] or by the consumer reading the
    /// snapshot.
    pub async fn latest(&self) -> Result<Option<PersistedSnapshot>> {
        let snapshots = self.scan().await?;
        let inner = self.inner.lock().expect("store state poisoned");
        Ok(snapshots
            .into_iter()
            .rev()
            .find(|s| !inner.invalid.contains(&s.id())))
    }

    /// Reserve a pending directory for a new snapshot.
    ///
    /// Returns `None` when the requested `(processed, exported, index, term)`
    /// tuple is strictly older than the current latest snapshot's: such a
    /// snapshot would sort below the existing one and could neither become
    /// `latest()` nor advance the compaction bound. Requests at an unchanged
    /// tuple are accepted and receive a fresh, larger ordinal.
    pub async fn new_transient(
        self: &Arc<Self>,
        index: u64,
        term: u64,
        processed_position: Position,
        exported_position: Position,
    ) -> Result<Option<TransientSnapshot>> {
        if let Some(latest) = self.latest().await? {
            let requested = (processed_position, exported_position, index, term);
            if requested < latest.metadata.position_tuple() {
                debug!(
                    partition_id = self.partition_id,
                    latest = %latest.id(),
                    ?requested,
                    "Refusing transient snapshot older than the latest persisted one"
                );
                return Ok(None);
            }
        }

        let ordinal = {
            let mut inner = self.inner.lock().expect("store state poisoned");
            let ordinal = inner.next_ordinal;
            inner.next_ordinal += 1;
            ordinal
        };
        let metadata = SnapshotMetadata::new(
            processed_position,
            exported_position,
            index,
            term,
            ordinal,
        );
        let pending = self.pending_dir.join(metadata.file_name());
        fs::create_dir_all(&pending).await?;
        trace!(
            partition_id = self.partition_id,
            id = %metadata,
            "Reserved pending snapshot"
        );
        Ok(Some(TransientSnapshot::new(
            Arc::clone(self),
            metadata,
            pending,
        )))
    }

    /// Byte-for-byte copy of a persisted snapshot into `dst`.
    pub async fn copy_snapshot(&self, snapshot: &PersistedSnapshot, dst: &Path) -> Result<()> {
        fs::create_dir_all(dst).await?;
        let mut entries = fs::read_dir(snapshot.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            fs::copy(entry.path(), dst.join(entry.file_name())).await?;
        }
        debug!(
            partition_id = self.partition_id,
            id = %snapshot.id(),
            dst = %dst.display(),
            "Copied snapshot"
        );
        Ok(())
    }

    /// Verify every persisted snapshot and return how many are valid.
    /// Mismatches are marked invalid and skipped by `latest()` from then on.
    pub async fn valid_snapshot_count(&self) -> Result<usize> {
        let snapshots = self.scan().await?;
        let mut valid = 0;
        for snapshot in snapshots {
            let path = snapshot.path().to_path_buf();
            let verified = tokio::task::spawn_blocking(move || checksum::verify(&path))
                .await
                .map_err(|err| {
                    SnapshotError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
                })??;
            if verified {
                valid += 1;
            } else {
                warn!(
                    partition_id = self.partition_id,
                    id = %snapshot.id(),
                    "Snapshot failed checksum verification, marking invalid"
                );
                self.inner
                    .lock()
                    .expect("store state poisoned")
                    .invalid
                    .insert(snapshot.id());
            }
        }
        Ok(valid)
    }

    /// Register a callback invoked for every newly persisted snapshot.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&PersistedSnapshot) + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .expect("store state poisoned")
            .listeners
            .push(Arc::new(listener));
    }

    /// Publish a taken pending snapshot: verify, rename into `snapshots/`,
    /// delete prior snapshots, notify listeners.
    pub(crate) async fn persist_pending(
        &self,
        metadata: SnapshotMetadata,
        pending: &Path,
    ) -> Result<PersistedSnapshot> {
        let verify_path = pending.to_path_buf();
        let verified = tokio::task::spawn_blocking(move || checksum::verify(&verify_path))
            .await
            .map_err(|err| SnapshotError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))??;
        if !verified {
            return Err(SnapshotError::ChecksumMismatch(metadata.file_name()));
        }

        let target = self.snapshots_dir.join(metadata.file_name());
        fs::rename(pending, &target).await?;
        self.sync_directory(&self.snapshots_dir).await?;

        // The new snapshot supersedes everything before it.
        for prior in self.scan().await? {
            if prior.metadata != metadata {
                if let Err(err) = fs::remove_dir_all(prior.path()).await {
                    warn!(
                        partition_id = self.partition_id,
                        id = %prior.id(),
                        error = %err,
                        "Failed to delete superseded snapshot"
                    );
                } else {
                    self.inner
                        .lock()
                        .expect("store state poisoned")
                        .invalid
                        .remove(&prior.id());
                }
            }
        }

        let snapshot = PersistedSnapshot {
            metadata,
            path: target,
        };
        info!(
            partition_id = self.partition_id,
            id = %snapshot.id(),
            compaction_bound = snapshot.compaction_bound(),
            "Persisted snapshot"
        );
        self.notify_listeners(&snapshot);
        Ok(snapshot)
    }

    pub(crate) async fn discard_pending(&self, pending: &Path) -> Result<()> {
        match fs::remove_dir_all(pending).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn sync_directory(&self, dir: &Path) -> Result<()> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || std::fs::File::open(dir)?.sync_all())
            .await
            .map_err(|err| SnapshotError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))??;
        Ok(())
    }

    fn notify_listeners(&self, snapshot: &PersistedSnapshot) {
        // Listeners run outside the lock; they may call back into the store.
        let listeners: Vec<PersistListener> = self
            .inner
            .lock()
            .expect("store state poisoned")
            .listeners
            .clone();
        for listener in listeners {
            listener(snapshot);
        }
    }
}
