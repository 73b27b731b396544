//! The in-progress side of the snapshot handshake.

use crate::error::{Result, SnapshotError};
use crate::metadata::SnapshotMetadata;
use crate::store::{PersistedSnapshot, SnapshotStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// A snapshot under construction in the store's pending area.
///
/// The handle is move-only: [`TransientSnapshot::persist`] and
/// [`TransientSnapshot::abort`] consume it, so double-persist and
/// use-after-persist do not compile.
pub struct TransientSnapshot {
    store: Arc<SnapshotStore>,
    metadata: SnapshotMetadata,
    pending_dir: PathBuf,
    taken: bool,
}

impl TransientSnapshot {
    pub(crate) fn new(
        store: Arc<SnapshotStore>,
        metadata: SnapshotMetadata,
        pending_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            metadata,
            pending_dir,
            taken: false,
        }
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    pub fn id(&self) -> String {
        self.metadata.file_name()
    }

    /// Index of the log entry the snapshot is anchored at; a leader-side
    /// snapshot may only persist once this index is committed.
    pub fn index(&self) -> u64 {
        self.metadata.index
    }

    pub fn pending_dir(&self) -> &Path {
        &self.pending_dir
    }

    /// Fill the pending directory by running `write` on a blocking worker.
    ///
    /// `write` returns `true` on success, after which the checksum file is
    /// written alongside and the handle may be persisted. On `false` the
    /// pending directory is deleted and the handle is spent; persisting it
    /// afterwards fails.
    pub async fn take<F>(&mut self, write: F) -> Result<bool>
    where
        F: FnOnce(&Path) -> bool + Send + 'static,
    {
        let dir = self.pending_dir.clone();
        trace!(id = %self.metadata, "Taking snapshot into pending directory");
        let written = tokio::task::spawn_blocking(move || -> std::io::Result<bool> {
            if !write(&dir) {
                return Ok(false);
            }
            crate::checksum::write(&dir)?;
            Ok(true)
        })
        .await
        .map_err(|err| SnapshotError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))??;

        if written {
            self.taken = true;
            Ok(true)
        } else {
            debug!(id = %self.metadata, "Snapshot write reported failure, discarding pending directory");
            self.store.discard_pending(&self.pending_dir).await?;
            Ok(false)
        }
    }

    /// Atomically publish the snapshot, deleting any prior persisted
    /// snapshots of the partition. Consumes the handle.
    pub async fn persist(self) -> Result<PersistedSnapshot> {
        if !self.taken {
            return Err(SnapshotError::NotTaken(self.metadata.file_name()));
        }
        self.store
            .persist_pending(self.metadata, &self.pending_dir)
            .await
    }

    /// Delete the pending directory. Consumes the handle.
    pub async fn abort(self) -> Result<()> {
        debug!(id = %self.metadata, "Aborting transient snapshot");
        self.store.discard_pending(&self.pending_dir).await
    }
}
