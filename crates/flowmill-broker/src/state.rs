//! Controls how snapshot and recovery operations are performed.
//!
//! The controller owns the partition's runtime database directory. All
//! decisions run on the controller's actor; filesystem-heavy work happens on
//! bridged tasks and re-enters the actor to settle state, so the database
//! slot is only ever touched from one logical thread.

use crate::db::{DbError, DbFactory, StateDb};
use flowmill_core::{IndexedEntry, PartitionId, Position};
use flowmill_runtime::{bridge, CompletableFuture, ConcurrencyControl, TaskError};
use flowmill_snapshots::{SnapshotError, SnapshotStore, TransientSnapshot};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, trace, warn};

/// Looks up the indexed log entry at or before a position. `None` means the
/// position cannot be reconciled with the log, which is unrecoverable for
/// snapshotting.
pub type EntrySupplier = Arc<dyn Fn(Position) -> Option<IndexedEntry> + Send + Sync>;

/// Reads the exporter pipeline's lowest externalized position out of the
/// runtime database.
pub type ExporterPositionSupplier = Arc<dyn Fn(&dyn StateDb) -> Position + Send + Sync>;

struct ControllerInner {
    db: Option<Arc<dyn StateDb>>,
    snapshot_in_progress: bool,
}

#[derive(Clone)]
pub struct StateController {
    partition_id: PartitionId,
    control: ConcurrencyControl,
    runtime_dir: PathBuf,
    db_factory: Arc<dyn DbFactory>,
    store: Arc<SnapshotStore>,
    entry_supplier: EntrySupplier,
    exporter_position: ExporterPositionSupplier,
    inner: Arc<Mutex<ControllerInner>>,
}

impl StateController {
    pub fn new(
        control: ConcurrencyControl,
        partition_id: PartitionId,
        db_factory: Arc<dyn DbFactory>,
        store: Arc<SnapshotStore>,
        runtime_dir: PathBuf,
        entry_supplier: EntrySupplier,
        exporter_position: ExporterPositionSupplier,
    ) -> Self {
        Self {
            partition_id,
            control,
            runtime_dir,
            db_factory,
            store,
            entry_supplier,
            exporter_position,
            inner: Arc::new(Mutex::new(ControllerInner {
                db: None,
                snapshot_in_progress: false,
            })),
        }
    }

    pub fn is_db_opened(&self) -> bool {
        self.inner.lock().expect("controller state poisoned").db.is_some()
    }

    pub fn snapshot_store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// Open the runtime database, creating it when absent. Resolves with the
    /// already-open handle when called twice.
    pub fn open_db(&self) -> CompletableFuture<Arc<dyn StateDb>> {
        let future = self.control.create_future();
        let controller = self.clone();
        let result = future.clone();
        self.control.run(move || controller.open_db_internal(&result));
        future
    }

    /// Close the handle, clear the slot, and best-effort delete the runtime
    /// directory.
    pub fn close_db(&self) -> CompletableFuture<()> {
        let future = self.control.create_future();
        let controller = self.clone();
        let result = future.clone();
        self.control.run(move || {
            let db = controller
                .inner
                .lock()
                .expect("controller state poisoned")
                .db
                .take();
            if let Some(db) = db {
                if let Err(err) = db.close() {
                    result.fail(db_error(err));
                    return;
                }
                debug!(
                    partition_id = controller.partition_id,
                    dir = %controller.runtime_dir.display(),
                    "Closed database"
                );
            }
            controller.try_delete_runtime_directory();
            result.complete(());
        });
        future
    }

    /// Rebuild the runtime directory from the latest persisted snapshot.
    ///
    /// The database is not opened: callers follow up with
    /// [`StateController::open_db`], which is where a corrupted snapshot
    /// surfaces. With no snapshot available the runtime directory is simply
    /// left deleted, so a subsequent open starts empty. Copy failure is
    /// fatal.
    pub fn recover(&self) -> CompletableFuture<()> {
        let future = self.control.create_future();
        let controller = self.clone();
        let result = future.clone();
        self.control.run(move || {
            if let Err(err) = remove_dir_if_exists(&controller.runtime_dir) {
                result.fail(TaskError::Failed(format!(
                    "failed to delete runtime directory, cannot recover from snapshot: {err}"
                )));
                return;
            }

            let store = Arc::clone(&controller.store);
            let runtime_dir = controller.runtime_dir.clone();
            let partition_id = controller.partition_id;
            tokio::spawn(async move {
                let copied: Result<(), TaskError> = async {
                    if let Some(snapshot) = store.latest().await.map_err(snapshot_error)? {
                        debug!(
                            partition_id,
                            id = %snapshot.id(),
                            "Recovering state from available snapshot"
                        );
                        store
                            .copy_snapshot(&snapshot, &runtime_dir)
                            .await
                            .map_err(|err| {
                                TaskError::Failed(format!(
                                    "failed to recover from snapshot {}: {err}",
                                    snapshot.id()
                                ))
                            })?;
                    }
                    Ok(())
                }
                .await;

                match copied {
                    Ok(()) => result.complete(()),
                    Err(err) => result.fail(err),
                }
            });
        });
        future
    }

    /// Construct a transient snapshot anchored at
    /// `min(lower_bound_position, exported position)`.
    ///
    /// Resolves with `None` when the database is closed, when a snapshot is
    /// already in progress, when the store refuses the construction, or when
    /// the snapshot write reports failure. Fails when the computed position
    /// has no matching indexed log entry.
    pub fn take_transient_snapshot(
        &self,
        lower_bound_position: Position,
    ) -> CompletableFuture<Option<TransientSnapshot>> {
        let future = self.control.create_future();
        let controller = self.clone();
        let result = future.clone();
        self.control.run(move || {
            controller.take_transient_snapshot_internal(lower_bound_position, result)
        });
        future
    }

    /// Verify all persisted snapshots; see
    /// [`SnapshotStore::valid_snapshot_count`].
    pub fn valid_snapshot_count(&self) -> CompletableFuture<usize> {
        let store = Arc::clone(&self.store);
        bridge(async move { store.valid_snapshot_count().await.map_err(snapshot_error) })
    }

    fn take_transient_snapshot_internal(
        &self,
        lower_bound_position: Position,
        future: CompletableFuture<Option<TransientSnapshot>>,
    ) {
        let db = {
            let mut inner = self.inner.lock().expect("controller state poisoned");
            let Some(db) = inner.db.clone() else {
                warn!(
                    partition_id = self.partition_id,
                    lower_bound_position,
                    "Expected to take snapshot for last processed position, but the database was closed"
                );
                future.complete(None);
                return;
            };
            if inner.snapshot_in_progress {
                trace!(
                    partition_id = self.partition_id,
                    "Snapshot construction already in progress, skipping"
                );
                future.complete(None);
                return;
            }
            inner.snapshot_in_progress = true;
            db
        };

        let exported_position = (self.exporter_position)(db.as_ref());
        let snapshot_position = lower_bound_position.min(exported_position);
        trace!(
            partition_id = self.partition_id,
            exported_position,
            processed_position = lower_bound_position,
            snapshot_position,
            "Determined snapshot position"
        );

        let Some(entry) = (self.entry_supplier)(snapshot_position) else {
            self.clear_snapshot_in_progress();
            future.fail(TaskError::InvariantViolation(format!(
                "no indexed log entry contains snapshot position {snapshot_position} \
                 (processed position {lower_bound_position}, exported position {exported_position})"
            )));
            return;
        };

        let store = Arc::clone(&self.store);
        let controller = self.clone();
        tokio::spawn(async move {
            let outcome: Result<Option<TransientSnapshot>, TaskError> =
                construct_snapshot(store, entry, lower_bound_position, exported_position, db).await;

            let settle = controller.clone();
            controller.control.run(move || {
                settle.clear_snapshot_in_progress();
                match outcome {
                    Ok(transient) => future.complete(transient),
                    Err(err) => {
                        error!(
                            partition_id = settle.partition_id,
                            error = %err,
                            "Failed to take transient snapshot"
                        );
                        future.fail(err);
                    }
                }
            });
        });
    }

    fn open_db_internal(&self, future: &CompletableFuture<Arc<dyn StateDb>>) {
        let mut inner = self.inner.lock().expect("controller state poisoned");
        if let Some(db) = &inner.db {
            future.complete(Arc::clone(db));
            return;
        }
        match self.db_factory.create_db(&self.runtime_dir) {
            Ok(db) => {
                inner.db = Some(Arc::clone(&db));
                debug!(
                    partition_id = self.partition_id,
                    dir = %self.runtime_dir.display(),
                    "Opened database"
                );
                future.complete(db);
            }
            Err(err) => {
                future.fail(TaskError::Failed(format!("failed to open database: {err}")));
            }
        }
    }

    fn clear_snapshot_in_progress(&self) {
        self.inner
            .lock()
            .expect("controller state poisoned")
            .snapshot_in_progress = false;
    }

    fn try_delete_runtime_directory(&self) {
        if let Err(err) = remove_dir_if_exists(&self.runtime_dir) {
            debug!(
                partition_id = self.partition_id,
                error = %err,
                "Failed to delete runtime directory on close"
            );
        }
    }
}

async fn construct_snapshot(
    store: Arc<SnapshotStore>,
    entry: IndexedEntry,
    processed_position: Position,
    exported_position: Position,
    db: Arc<dyn StateDb>,
) -> Result<Option<TransientSnapshot>, TaskError> {
    let Some(mut transient) = store
        .new_transient(entry.index, entry.term, processed_position, exported_position)
        .await
        .map_err(snapshot_error)?
    else {
        return Ok(None);
    };

    let taken = transient
        .take(move |dir| match db.create_snapshot(dir) {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "Failed to create snapshot of runtime database");
                false
            }
        })
        .await
        .map_err(snapshot_error)?;

    if taken {
        Ok(Some(transient))
    } else {
        Ok(None)
    }
}

fn remove_dir_if_exists(dir: &std::path::Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn db_error(err: DbError) -> TaskError {
    match err {
        DbError::Io(io) => TaskError::Io(io.to_string()),
        other => TaskError::Failed(other.to_string()),
    }
}

fn snapshot_error(err: SnapshotError) -> TaskError {
    match err {
        SnapshotError::Io(io) => TaskError::Io(io.to_string()),
        other => TaskError::Failed(other.to_string()),
    }
}
