//! Wires one partition's resources together.
//!
//! Directory layout under the data directory:
//!
//! ```text
//! <data_dir>/partition-<id>/
//!   runtime/     the live database (deleted on close, rebuilt on recover)
//!   pending/     snapshots under construction
//!   snapshots/   persisted snapshots
//! ```

use crate::db::{DbFactory, FileDbFactory};
use crate::exporter::exported_position;
use crate::health::HealthMonitor;
use crate::log::LogCompactor;
use crate::partition::Partition;
use crate::partition_startup::default_startup_steps;
use crate::raft::RaftPartitionHandle;
use crate::state::{EntrySupplier, StateController};
use crate::transition::{PartitionTransition, TransitionContext};
use flowmill_core::{NodeId, PartitionId};
use flowmill_runtime::{ActorScheduler, TaskError};
use flowmill_snapshots::SnapshotStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub struct PartitionBuilder {
    partition_id: PartitionId,
    node_id: NodeId,
    data_dir: PathBuf,
    snapshot_period: Duration,
    scheduler: ActorScheduler,
    db_factory: Arc<dyn DbFactory>,
    raft: Option<Arc<dyn RaftPartitionHandle>>,
    entry_supplier: Option<EntrySupplier>,
    log_compactor: Option<Arc<dyn LogCompactor>>,
}

impl PartitionBuilder {
    pub fn new(partition_id: PartitionId, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            partition_id,
            node_id: 0,
            data_dir: data_dir.into(),
            snapshot_period: Duration::from_secs(15 * 60),
            scheduler: ActorScheduler::new(),
            db_factory: Arc::new(FileDbFactory::new()),
            raft: None,
            entry_supplier: None,
            log_compactor: None,
        }
    }

    pub fn node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn snapshot_period(mut self, period: Duration) -> Self {
        self.snapshot_period = period;
        self
    }

    pub fn scheduler(mut self, scheduler: ActorScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn db_factory(mut self, factory: Arc<dyn DbFactory>) -> Self {
        self.db_factory = factory;
        self
    }

    pub fn raft(mut self, raft: Arc<dyn RaftPartitionHandle>) -> Self {
        self.raft = Some(raft);
        self
    }

    pub fn entry_supplier(mut self, supplier: EntrySupplier) -> Self {
        self.entry_supplier = Some(supplier);
        self
    }

    pub fn log_compactor(mut self, compactor: Arc<dyn LogCompactor>) -> Self {
        self.log_compactor = Some(compactor);
        self
    }

    pub async fn build(self) -> Result<Arc<Partition>, TaskError> {
        let raft = self
            .raft
            .ok_or_else(|| TaskError::Failed("raft handle is required".to_string()))?;
        let entry_supplier = self
            .entry_supplier
            .ok_or_else(|| TaskError::Failed("entry supplier is required".to_string()))?;
        let log_compactor = self
            .log_compactor
            .ok_or_else(|| TaskError::Failed("log compactor is required".to_string()))?;

        let partition_dir = self
            .data_dir
            .join(format!("partition-{}", self.partition_id));
        let store = SnapshotStore::open(&partition_dir, self.partition_id)
            .await
            .map_err(|err| TaskError::Failed(format!("failed to open snapshot store: {err}")))?;

        let state_controller = Arc::new(StateController::new(
            self.scheduler
                .spawn_actor(format!("StateController-{}", self.partition_id)),
            self.partition_id,
            self.db_factory,
            store,
            partition_dir.join("runtime"),
            entry_supplier,
            Arc::new(|db: &dyn crate::db::StateDb| exported_position(db)),
        ));

        let health_monitor = HealthMonitor::new(
            self.partition_id,
            self.scheduler
                .spawn_actor(format!("HealthMonitor-{}", self.partition_id)),
        );

        let ctx = TransitionContext::new(
            self.partition_id,
            self.node_id,
            self.snapshot_period,
            self.scheduler.clone(),
            raft,
            state_controller,
            health_monitor,
        );
        let transition = PartitionTransition::with_default_steps(ctx);

        Ok(Partition::new(
            self.scheduler
                .spawn_actor(format!("Partition-{}", self.partition_id)),
            transition,
            default_startup_steps(),
            log_compactor,
        ))
    }
}
