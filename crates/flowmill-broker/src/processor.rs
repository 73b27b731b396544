//! The partition's stream processor service.
//!
//! The record appliers themselves belong to the execution engine; this
//! service owns the processing phase and the last processed position, which
//! is what the partition lifecycle needs: pausing under disk pressure or
//! admin request, reporting health, and anchoring snapshots.
//!
//! The position is written through to the runtime database under a reserved
//! key, so it survives snapshot round-trips.

use crate::db::StateDb;
use crate::health::{HealthMonitorable, HealthStatus};
use flowmill_core::{PartitionId, Position};
use flowmill_runtime::{CompletableFuture, ConcurrencyControl};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Reserved key holding the last processed position.
pub const PROCESSED_POSITION_KEY: &[u8] = b"__processor.position";

/// No record processed yet.
pub const NO_POSITION: Position = -1;

/// Leaders process commands; followers replay committed events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorMode {
    Processing,
    Replay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorPhase {
    Processing,
    Paused,
    Closed,
}

struct ProcessorInner {
    phase: ProcessorPhase,
    last_processed_position: Position,
    failed: bool,
}

pub struct StreamProcessor {
    partition_id: PartitionId,
    mode: ProcessorMode,
    control: ConcurrencyControl,
    db: Arc<dyn StateDb>,
    inner: Arc<Mutex<ProcessorInner>>,
}

impl StreamProcessor {
    /// Create a processor over the partition's runtime database. The last
    /// processed position is restored from the database when present.
    pub fn new(
        control: ConcurrencyControl,
        partition_id: PartitionId,
        mode: ProcessorMode,
        db: Arc<dyn StateDb>,
    ) -> Arc<Self> {
        let restored = db
            .get(PROCESSED_POSITION_KEY)
            .ok()
            .flatten()
            .and_then(|bytes| bytes.try_into().ok().map(Position::from_be_bytes))
            .unwrap_or(NO_POSITION);
        info!(
            partition_id,
            ?mode,
            restored_position = restored,
            "Stream processor created"
        );
        Arc::new(Self {
            partition_id,
            mode,
            control,
            db,
            inner: Arc::new(Mutex::new(ProcessorInner {
                phase: ProcessorPhase::Processing,
                last_processed_position: restored,
                failed: false,
            })),
        })
    }

    pub fn mode(&self) -> ProcessorMode {
        self.mode
    }

    pub fn pause_processing(&self) -> CompletableFuture<()> {
        let inner = Arc::clone(&self.inner);
        let partition_id = self.partition_id;
        self.control.submit(move || {
            let mut inner = inner.lock().expect("processor state poisoned");
            if inner.phase == ProcessorPhase::Processing {
                inner.phase = ProcessorPhase::Paused;
                info!(partition_id, "Processing paused");
            }
        })
    }

    pub fn resume_processing(&self) -> CompletableFuture<()> {
        let inner = Arc::clone(&self.inner);
        let partition_id = self.partition_id;
        self.control.submit(move || {
            let mut inner = inner.lock().expect("processor state poisoned");
            if inner.phase == ProcessorPhase::Paused {
                inner.phase = ProcessorPhase::Processing;
                info!(partition_id, "Processing resumed");
            }
        })
    }

    pub fn phase(&self) -> ProcessorPhase {
        self.inner.lock().expect("processor state poisoned").phase
    }

    /// Record that the state machine consumed the record at `position`.
    /// Called by the engine after applying a record; ignored while paused.
    pub fn record_processed(&self, position: Position) -> CompletableFuture<()> {
        let inner = Arc::clone(&self.inner);
        let db = Arc::clone(&self.db);
        self.control.submit(move || {
            let mut inner = inner.lock().expect("processor state poisoned");
            if inner.phase != ProcessorPhase::Processing {
                return;
            }
            if position > inner.last_processed_position {
                inner.last_processed_position = position;
                drop(inner);
                let _ = db.put(PROCESSED_POSITION_KEY, &position.to_be_bytes());
            }
        })
    }

    /// The position the next snapshot will be anchored at.
    pub fn last_processed_position(&self) -> CompletableFuture<Position> {
        let inner = Arc::clone(&self.inner);
        self.control.submit(move || {
            inner
                .lock()
                .expect("processor state poisoned")
                .last_processed_position
        })
    }

    pub fn on_failure(&self) {
        self.inner.lock().expect("processor state poisoned").failed = true;
    }

    pub fn close_async(&self) -> CompletableFuture<()> {
        let inner = Arc::clone(&self.inner);
        let partition_id = self.partition_id;
        self.control.submit(move || {
            inner.lock().expect("processor state poisoned").phase = ProcessorPhase::Closed;
            debug!(partition_id, "Stream processor closed");
        })
    }
}

impl HealthMonitorable for StreamProcessor {
    fn component_name(&self) -> String {
        format!("StreamProcessor-{}", self.partition_id)
    }

    fn health_status(&self) -> HealthStatus {
        let inner = self.inner.lock().expect("processor state poisoned");
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

    fn processor(dir: &TempDir) -> (Arc<StreamProcessor>, Arc<dyn StateDb>) {
        let db = FileDbFactory::new().create_db(dir.path()).unwrap();
        let processor = StreamProcessor::new(
            ConcurrencyControl::inline(),
            1,
            ProcessorMode::Processing,
            Arc::clone(&db),
        );
        (processor, db)
    }

    #[tokio::test]
    async fn test_position_advances_monotonically() {
        let dir = TempDir::new().unwrap();
        let (processor, _db) = processor(&dir);

        processor.record_processed(5).await.unwrap();
        processor.record_processed(3).await.unwrap();
        assert_eq!(processor.last_processed_position().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_paused_processor_ignores_records() {
        let dir = TempDir::new().unwrap();
        let (processor, _db) = processor(&dir);

        processor.record_processed(2).await.unwrap();
        processor.pause_processing().await.unwrap();
        processor.record_processed(9).await.unwrap();
        assert_eq!(processor.last_processed_position().await.unwrap(), 2);
        assert_eq!(processor.phase(), ProcessorPhase::Paused);

        processor.resume_processing().await.unwrap();
        processor.record_processed(9).await.unwrap();
        assert_eq!(processor.last_processed_position().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_position_restored_from_database() {
        let dir = TempDir::new().unwrap();
        let (processor, db) = processor(&dir);
        processor.record_processed(17).await.unwrap();

        let restored = StreamProcessor::new(
            ConcurrencyControl::inline(),
            1,
            ProcessorMode::Replay,
            db,
        );
        assert_eq!(restored.last_processed_position().await.unwrap(), 17);
    }

    #[tokio::test]
    async fn test_new_processor_has_no_position() {
        let dir = TempDir::new().unwrap();
        let (processor, _db) = processor(&dir);
        assert_eq!(
            processor.last_processed_position().await.unwrap(),
            NO_POSITION
        );
    }
}
