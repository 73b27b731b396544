//! The partition's transition steps, in install order.

use crate::exporter::ExporterDirector;
use crate::health::HealthMonitorable;
use crate::processor::{ProcessorMode, StreamProcessor};
use crate::snapshot_director::AsyncSnapshotDirector;
use crate::transition::{SharedTransitionContext, TransitionStep};
use async_trait::async_trait;
use flowmill_core::RaftRole;
use flowmill_runtime::TaskError;
use std::sync::{Arc, Weak};

/// Opens or recovers the runtime database. Runs first: every other step
/// reads the database it produces.
pub struct DatabaseTransitionStep;

#[async_trait]
impl TransitionStep for DatabaseTransitionStep {
    fn name(&self) -> &str {
        "Database"
    }

    async fn prepare(
        &self,
        ctx: &SharedTransitionContext,
        _term: u64,
        _target: RaftRole,
    ) -> Result<(), TaskError> {
        let controller = {
            let mut ctx = ctx.lock().expect("transition context poisoned");
            if ctx.db.is_some() {
                ctx.db = None;
                Some(Arc::clone(&ctx.state_controller))
            } else {
                None
            }
        };
        if let Some(controller) = controller {
            controller.close_db().await?;
        }
        Ok(())
    }

    async fn transition_to(
        &self,
        ctx: &SharedTransitionContext,
        _term: u64,
        target: RaftRole,
    ) -> Result<(), TaskError> {
        let controller = {
            let ctx = ctx.lock().expect("transition context poisoned");
            if target != RaftRole::Inactive && ctx.db.is_none() {
                Some(Arc::clone(&ctx.state_controller))
            } else {
                None
            }
        };
        if let Some(controller) = controller {
            controller.recover().await?;
            let db = controller.open_db().await?;
            ctx.lock().expect("transition context poisoned").db = Some(db);
        }
        Ok(())
    }
}

pub struct StreamProcessorTransitionStep;

#[async_trait]
impl TransitionStep for StreamProcessorTransitionStep {
    fn name(&self) -> &str {
        "StreamProcessor"
    }

    async fn prepare(
        &self,
        ctx: &SharedTransitionContext,
        _term: u64,
        _target: RaftRole,
    ) -> Result<(), TaskError> {
        let removed = {
            let mut ctx = ctx.lock().expect("transition context poisoned");
            ctx.stream_processor
                .take()
                .map(|processor| (processor, Arc::clone(&ctx.health_monitor)))
        };
        if let Some((processor, health_monitor)) = removed {
            health_monitor.remove_component(&processor.component_name());
            processor.close_async().await?;
        }
        Ok(())
    }

    async fn transition_to(
        &self,
        ctx: &SharedTransitionContext,
        _term: u64,
        target: RaftRole,
    ) -> Result<(), TaskError> {
        let mut ctx = ctx.lock().expect("transition context poisoned");
        if target == RaftRole::Inactive || ctx.stream_processor.is_some() {
            return Ok(());
        }
        let db = ctx.db.clone().ok_or_else(|| {
            TaskError::InvariantViolation(
                "database must be opened before the stream processor installs".to_string(),
            )
        })?;
        let mode = if target == RaftRole::Leader {
            ProcessorMode::Processing
        } else {
            ProcessorMode::Replay
        };
        let control = ctx
            .scheduler
            .spawn_actor(format!("StreamProcessor-{}", ctx.partition_id));
        let processor = StreamProcessor::new(control, ctx.partition_id, mode, db);
        ctx.health_monitor
            .register_component(Arc::downgrade(&processor) as Weak<dyn HealthMonitorable>);
        ctx.stream_processor = Some(processor);
        Ok(())
    }
}

pub struct ExporterDirectorTransitionStep;

#[async_trait]
impl TransitionStep for ExporterDirectorTransitionStep {
    fn name(&self) -> &str {
        "ExporterDirector"
    }

    async fn prepare(
        &self,
        ctx: &SharedTransitionContext,
        _term: u64,
        _target: RaftRole,
    ) -> Result<(), TaskError> {
        let removed = {
            let mut ctx = ctx.lock().expect("transition context poisoned");
            ctx.exporter_director
                .take()
                .map(|director| (director, Arc::clone(&ctx.health_monitor)))
        };
        if let Some((director, health_monitor)) = removed {
            health_monitor.remove_component(&director.component_name());
            director.close_async().await?;
        }
        Ok(())
    }

    async fn transition_to(
        &self,
        ctx: &SharedTransitionContext,
        _term: u64,
        target: RaftRole,
    ) -> Result<(), TaskError> {
        let mut ctx = ctx.lock().expect("transition context poisoned");
        if target == RaftRole::Inactive || ctx.exporter_director.is_some() {
            return Ok(());
        }
        let db = ctx.db.clone().ok_or_else(|| {
            TaskError::InvariantViolation(
                "database must be opened before the exporter director installs".to_string(),
            )
        })?;
        let control = ctx
            .scheduler
            .spawn_actor(format!("ExporterDirector-{}", ctx.partition_id));
        let director = ExporterDirector::new(control, ctx.partition_id, db);
        ctx.health_monitor
            .register_component(Arc::downgrade(&director) as Weak<dyn HealthMonitorable>);
        ctx.exporter_director = Some(director);
        Ok(())
    }
}

/// Installs the snapshot director in processing mode on leaders and replay
/// mode otherwise; the committed-entry listener is registered only on the
/// leader, where uncommitted entries can be anchored.
pub struct SnapshotDirectorTransitionStep;

#[async_trait]
impl TransitionStep for SnapshotDirectorTransitionStep {
    fn name(&self) -> &str {
        "SnapshotDirector"
    }

    async fn prepare(
        &self,
        ctx: &SharedTransitionContext,
        _term: u64,
        _target: RaftRole,
    ) -> Result<(), TaskError> {
        let removed = {
            let mut ctx = ctx.lock().expect("transition context poisoned");
            match ctx.snapshot_director.take() {
                Some(director) => {
                    let listener = ctx.committed_entry_listener.take();
                    Some((
                        director,
                        listener,
                        Arc::clone(&ctx.health_monitor),
                        Arc::clone(&ctx.raft),
                    ))
                }
                None => None,
            }
        };
        if let Some((director, listener, health_monitor, raft)) = removed {
            health_monitor.remove_component(&director.component_name());
            if let Some(listener) = listener {
                raft.remove_committed_entry_listener(listener);
            }
            director.close_async().await?;
        }
        Ok(())
    }

    async fn transition_to(
        &self,
        ctx: &SharedTransitionContext,
        _term: u64,
        target: RaftRole,
    ) -> Result<(), TaskError> {
        let mut ctx = ctx.lock().expect("transition context poisoned");
        if target == RaftRole::Inactive || ctx.snapshot_director.is_some() {
            return Ok(());
        }
        let processor = ctx.stream_processor.clone().ok_or_else(|| {
            TaskError::InvariantViolation(
                "stream processor must be installed before the snapshot director".to_string(),
            )
        })?;

        let control = ctx
            .scheduler
            .spawn_actor(format!("SnapshotDirector-{}", ctx.partition_id));
        let director = if target == RaftRole::Leader {
            AsyncSnapshotDirector::of_processing_mode(
                control,
                ctx.partition_id,
                processor,
                Arc::clone(&ctx.state_controller),
                ctx.snapshot_period,
            )
        } else {
            AsyncSnapshotDirector::of_replay_mode(
                control,
                ctx.partition_id,
                processor,
                Arc::clone(&ctx.state_controller),
                ctx.snapshot_period,
            )
        };
        director.start();
        ctx.health_monitor
            .register_component(Arc::downgrade(&director) as Weak<dyn HealthMonitorable>);

        if target == RaftRole::Leader {
            let observer = Arc::downgrade(&director);
            let listener = ctx.raft.add_committed_entry_listener(Box::new(move |entry| {
                if let Some(director) = observer.upgrade() {
                    director.on_committed_entry(entry);
                }
            }));
            ctx.committed_entry_listener = Some(listener);
        }
        ctx.snapshot_director = Some(director);
        Ok(())
    }
}
