//! Log compaction driven by snapshot persistence.
//!
//! Once a snapshot is persisted, everything below its compaction bound is
//! recoverable from the snapshot and the log can be truncated. The deletion
//! service subscribes to the snapshot store and forwards each new bound to
//! the log compactor seam.

use flowmill_core::{PartitionId, Position};
use flowmill_snapshots::SnapshotStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// The consumed surface of the log storage: delete everything strictly below
/// `position`.
pub trait LogCompactor: Send + Sync {
    fn delete_up_to(&self, position: Position);
}

/// Forwards compaction bounds of newly persisted snapshots to the compactor.
pub struct LogDeletionService {
    enabled: Arc<AtomicBool>,
}

impl LogDeletionService {
    /// Subscribe to `store`. The subscription cannot be removed from the
    /// store, so teardown flips the `enabled` flag instead.
    pub fn install(
        store: &SnapshotStore,
        compactor: Arc<dyn LogCompactor>,
        partition_id: PartitionId,
    ) -> Self {
        let enabled = Arc::new(AtomicBool::new(true));
        let guard = Arc::clone(&enabled);
        store.add_listener(move |snapshot| {
            if !guard.load(Ordering::SeqCst) {
                return;
            }
            let bound = snapshot.compaction_bound();
            debug!(
                partition_id,
                compaction_bound = bound,
                "Requesting log deletion below compaction bound"
            );
            compactor.delete_up_to(bound);
        });
        Self { enabled }
    }

    pub fn uninstall(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }
}
