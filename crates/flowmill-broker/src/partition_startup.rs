//! Partition startup steps.
//!
//! These install the role-independent services of a partition before the
//! raft role listeners attach, and tear them down in reverse during close.

use crate::log::LogDeletionService;
use crate::metrics::DB_ENTRIES;
use crate::partition::PartitionStartupContext;
use async_trait::async_trait;
use flowmill_runtime::{StartupStep, TaskError};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How often the runtime database gauge is refreshed.
const DB_METRICS_INTERVAL: Duration = Duration::from_secs(30);

/// Subscribes the log deletion service to the partition's snapshot store, so
/// the log is truncated below each newly persisted snapshot's compaction
/// bound.
pub struct LogDeletionServiceStep;

#[async_trait]
impl StartupStep<PartitionStartupContext> for LogDeletionServiceStep {
    fn name(&self) -> &str {
        "LogDeletionService"
    }

    async fn startup(&self, ctx: &mut PartitionStartupContext) -> Result<(), TaskError> {
        let store = {
            let transition_ctx = ctx
                .transition_ctx
                .lock()
                .expect("transition context poisoned");
            Arc::clone(transition_ctx.state_controller.snapshot_store())
        };
        let service =
            LogDeletionService::install(&store, Arc::clone(&ctx.log_compactor), ctx.partition_id);
        ctx.log_deletion_service = Some(service);
        Ok(())
    }

    async fn shutdown(&self, ctx: &mut PartitionStartupContext) -> Result<(), TaskError> {
        if let Some(service) = ctx.log_deletion_service.take() {
            service.uninstall();
        }
        Ok(())
    }
}

/// Periodically exports the runtime database's entry gauge. The database is
/// only present while role services are installed; probes in between are
/// skipped.
pub struct DbMetricsExporterStep;

#[async_trait]
impl StartupStep<PartitionStartupContext> for DbMetricsExporterStep {
    fn name(&self) -> &str {
        "DbMetricsExporter"
    }

    async fn startup(&self, ctx: &mut PartitionStartupContext) -> Result<(), TaskError> {
        let control = {
            let transition_ctx = ctx
                .transition_ctx
                .lock()
                .expect("transition context poisoned");
            transition_ctx
                .scheduler
                .spawn_actor(format!("DbMetrics-{}", ctx.partition_id))
        };

        let transition_ctx = Arc::clone(&ctx.transition_ctx);
        let partition_id = ctx.partition_id;
        let timer = control.run_at_fixed_rate(DB_METRICS_INTERVAL, move || {
            let db = transition_ctx
                .lock()
                .expect("transition context poisoned")
                .db
                .clone();
            let Some(db) = db else {
                return;
            };
            match db.approximate_entry_count() {
                Ok(entries) => {
                    DB_ENTRIES
                        .with_label_values(&[&partition_id.to_string()])
                        .set(entries as i64);
                }
                Err(err) => debug!(partition_id, error = %err, "Database metrics probe failed"),
            }
        });
        ctx.db_metrics_timer = Some(timer);
        Ok(())
    }

    async fn shutdown(&self, ctx: &mut PartitionStartupContext) -> Result<(), TaskError> {
        if let Some(mut timer) = ctx.db_metrics_timer.take() {
            timer.cancel();
        }
        Ok(())
    }
}

/// The default partition startup step order.
pub fn default_startup_steps() -> Vec<Box<dyn StartupStep<PartitionStartupContext>>> {
    vec![
        Box::new(LogDeletionServiceStep),
        Box::new(DbMetricsExporterStep),
    ]
}
