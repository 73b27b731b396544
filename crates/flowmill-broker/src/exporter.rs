//! The partition's exporter director service.
//!
//! The concrete exporters (what gets externalized, and where) are outside
//! the lifecycle core. The director owns the exported position and the
//! pause/resume phase, and writes the position through to the runtime
//! database so it rides inside snapshots: the snapshot store encodes it in
//! every snapshot name and the compaction bound is derived from it.

use crate::db::StateDb;
use crate::health::{HealthMonitorable, HealthStatus};
use flowmill_core::{PartitionId, Position};
use flowmill_runtime::{CompletableFuture, ConcurrencyControl};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Reserved key holding the lowest exported position.
pub const EXPORTED_POSITION_KEY: &[u8] = b"__exporter.position";

/// Read the exported position out of a runtime database. With no exporter
/// state present the position is unbounded, so the processed position alone
/// determines the snapshot position.
pub fn exported_position(db: &dyn StateDb) -> Position {
    db.get(EXPORTED_POSITION_KEY)
        .ok()
        .flatten()
        .and_then(|bytes| bytes.try_into().ok().map(Position::from_be_bytes))
        .unwrap_or(Position::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterPhase {
    Exporting,
    Paused,
    Closed,
}

struct ExporterInner {
    phase: ExporterPhase,
    failed: bool,
}

pub struct ExporterDirector {
    partition_id: PartitionId,
    control: ConcurrencyControl,
    db: Arc<dyn StateDb>,
    inner: Arc<Mutex<ExporterInner>>,
}

impl ExporterDirector {
    pub fn new(
        control: ConcurrencyControl,
        partition_id: PartitionId,
        db: Arc<dyn StateDb>,
    ) -> Arc<Self> {
        info!(
            partition_id,
            exported_position = exported_position(db.as_ref()),
            "Exporter director created"
        );
        Arc::new(Self {
            partition_id,
            control,
            db,
            inner: Arc::new(Mutex::new(ExporterInner {
                phase: ExporterPhase::Exporting,
                failed: false,
            })),
        })
    }

    pub fn pause_exporting(&self) -> CompletableFuture<()> {
        let inner = Arc::clone(&self.inner);
        let partition_id = self.partition_id;
        self.control.submit(move || {
            let mut inner = inner.lock().expect("exporter state poisoned");
            if inner.phase == ExporterPhase::Exporting {
                inner.phase = ExporterPhase::Paused;
                info!(partition_id, "Exporting paused");
            }
        })
    }

    pub fn resume_exporting(&self) -> CompletableFuture<()> {
        let inner = Arc::clone(&self.inner);
        let partition_id = self.partition_id;
        self.control.submit(move || {
            let mut inner = inner.lock().expect("exporter state poisoned");
            if inner.phase == ExporterPhase::Paused {
                inner.phase = ExporterPhase::Exporting;
                info!(partition_id, "Exporting resumed");
            }
        })
    }

    pub fn phase(&self) -> ExporterPhase {
        self.inner.lock().expect("exporter state poisoned").phase
    }

    /// Record that everything up to `position` has been externalized.
    /// Ignored while paused.
    pub fn record_exported(&self, position: Position) -> CompletableFuture<()> {
        let inner = Arc::clone(&self.inner);
        let db = Arc::clone(&self.db);
        self.control.submit(move || {
            let inner = inner.lock().expect("exporter state poisoned");
            if inner.phase != ExporterPhase::Exporting {
                return;
            }
            let current = exported_position(db.as_ref());
            if current == Position::MAX || position > current {
                let _ = db.put(EXPORTED_POSITION_KEY, &position.to_be_bytes());
            }
        })
    }

    pub fn position(&self) -> Position {
        exported_position(self.db.as_ref())
    }

    pub fn on_failure(&self) {
        self.inner.lock().expect("exporter state poisoned").failed = true;
    }

    pub fn close_async(&self) -> CompletableFuture<()> {
        let inner = Arc::clone(&self.inner);
        let partition_id = self.partition_id;
        self.control.submit(move || {
            inner.lock().expect("exporter state poisoned").phase = ExporterPhase::Closed;
            debug!(partition_id, "Exporter director closed");
        })
    }
}

impl HealthMonitorable for ExporterDirector {
    fn component_name(&self) -> String {
        format!("ExporterDirector-{}", self.partition_id)
    }

    fn health_status(&self) -> HealthStatus {
        let inner = self.inner.lock().expect("exporter state poisoned");
        if inner.failed {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DbFactory, FileDbFactory};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_position_defaults_to_unbounded() {
        let dir = TempDir::new().unwrap();
        let db = FileDbFactory::new().create_db(dir.path()).unwrap();
        assert_eq!(exported_position(db.as_ref()), Position::MAX);
    }

    #[tokio::test]
    async fn test_position_written_through_to_database() {
        let dir = TempDir::new().unwrap();
        let db = FileDbFactory::new().create_db(dir.path()).unwrap();
        let director = ExporterDirector::new(ConcurrencyControl::inline(), 1, Arc::clone(&db));

        director.record_exported(12).await.unwrap();
        assert_eq!(exported_position(db.as_ref()), 12);
        assert_eq!(director.position(), 12);
    }

    #[tokio::test]
    async fn test_position_does_not_regress() {
        let dir = TempDir::new().unwrap();
        let db = FileDbFactory::new().create_db(dir.path()).unwrap();
        let director = ExporterDirector::new(ConcurrencyControl::inline(), 1, db);

        director.record_exported(12).await.unwrap();
        director.record_exported(8).await.unwrap();
        assert_eq!(director.position(), 12);
    }

    #[tokio::test]
    async fn test_paused_director_ignores_positions() {
        let dir = TempDir::new().unwrap();
        let db = FileDbFactory::new().create_db(dir.path()).unwrap();
        let director = ExporterDirector::new(ConcurrencyControl::inline(), 1, db);

        director.record_exported(3).await.unwrap();
        director.pause_exporting().await.unwrap();
        director.record_exported(9).await.unwrap();
        assert_eq!(director.position(), 3);

        director.resume_exporting().await.unwrap();
        director.record_exported(9).await.unwrap();
        assert_eq!(director.position(), 9);
    }
}
