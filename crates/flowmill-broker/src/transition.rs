//! Role-driven service installation and teardown.
//!
//! A partition transition is an ordered list of steps sharing a two-method
//! capability set: `prepare` tears down what must not survive the role
//! change, `transition_to` installs the services for the target role. Every
//! `prepare` runs in step order, then every `transition_to` in step order; a
//! failure aborts the remaining steps and propagates.
//!
//! The target role is only ever leader, follower or inactive: the partition
//! actor maps every other active raft role to a follower transition and
//! filters out role changes that keep services in place (a leader term bump,
//! follower↔candidate flapping) before anything is enqueued. Each executed
//! transition is therefore a real role change, and installed services are
//! torn down unconditionally during `prepare`.
//!
//! Transitions for a partition never interleave: the partition actor starts
//! a new transition only after the previous transition's future resolved.

use crate::metrics::ROLE_TRANSITIONS_TOTAL;
use crate::raft::{ListenerId, RaftPartitionHandle};
use crate::state::StateController;
use crate::{
    db::StateDb, exporter::ExporterDirector, health::HealthMonitor,
    processor::StreamProcessor, snapshot_director::AsyncSnapshotDirector,
};
use async_trait::async_trait;
use flowmill_core::{NodeId, PartitionId, RaftRole};
use flowmill_runtime::{bridge, ActorScheduler, CompletableFuture, TaskError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};

/// The per-partition resources steps install into and tear down from.
/// Mutated only while a transition or the partition actor holds the lock;
/// never locked across an await point.
pub struct TransitionContext {
    pub partition_id: PartitionId,
    pub node_id: NodeId,
    pub snapshot_period: Duration,
    pub scheduler: ActorScheduler,
    pub raft: Arc<dyn RaftPartitionHandle>,
    pub state_controller: Arc<StateController>,
    pub health_monitor: Arc<HealthMonitor>,

    pub db: Option<Arc<dyn StateDb>>,
    pub stream_processor: Option<Arc<StreamProcessor>>,
    pub exporter_director: Option<Arc<ExporterDirector>>,
    pub snapshot_director: Option<Arc<AsyncSnapshotDirector>>,
    pub committed_entry_listener: Option<ListenerId>,

    /// Role and term of the most recently *completed* transition.
    pub current_role: Option<RaftRole>,
    pub current_term: u64,

    pub disk_space_available: bool,
    pub processing_paused: bool,
    pub exporting_paused: bool,
}

impl TransitionContext {
    pub fn new(
        partition_id: PartitionId,
        node_id: NodeId,
        snapshot_period: Duration,
        scheduler: ActorScheduler,
        raft: Arc<dyn RaftPartitionHandle>,
        state_controller: Arc<StateController>,
        health_monitor: Arc<HealthMonitor>,
    ) -> SharedTransitionContext {
        Arc::new(Mutex::new(Self {
            partition_id,
            node_id,
            snapshot_period,
            scheduler,
            raft,
            state_controller,
            health_monitor,
            db: None,
            stream_processor: None,
            exporter_director: None,
            snapshot_director: None,
            committed_entry_listener: None,
            current_role: None,
            current_term: 0,
            disk_space_available: true,
            processing_paused: false,
            exporting_paused: false,
        }))
    }
}

pub type SharedTransitionContext = Arc<Mutex<TransitionContext>>;

#[async_trait]
pub trait TransitionStep: Send + Sync {
    fn name(&self) -> &str;

    /// Tear down whatever must not survive the transition to `target`.
    async fn prepare(
        &self,
        ctx: &SharedTransitionContext,
        term: u64,
        target: RaftRole,
    ) -> Result<(), TaskError>;

    /// Install the step's services for `target`.
    async fn transition_to(
        &self,
        ctx: &SharedTransitionContext,
        term: u64,
        target: RaftRole,
    ) -> Result<(), TaskError>;
}

pub struct PartitionTransition {
    ctx: SharedTransitionContext,
    steps: Arc<Vec<Box<dyn TransitionStep>>>,
}

impl PartitionTransition {
    pub fn new(ctx: SharedTransitionContext, steps: Vec<Box<dyn TransitionStep>>) -> Self {
        Self {
            ctx,
            steps: Arc::new(steps),
        }
    }

    /// The default step order: the database first (everything else reads
    /// it), then the processing pipeline, then snapshotting on top.
    pub fn with_default_steps(ctx: SharedTransitionContext) -> Self {
        Self::new(
            ctx,
            vec![
                Box::new(crate::steps::DatabaseTransitionStep),
                Box::new(crate::steps::StreamProcessorTransitionStep),
                Box::new(crate::steps::ExporterDirectorTransitionStep),
                Box::new(crate::steps::SnapshotDirectorTransitionStep),
            ],
        )
    }

    pub fn context(&self) -> &SharedTransitionContext {
        &self.ctx
    }

    pub fn to_leader(&self, term: u64) -> CompletableFuture<()> {
        self.transition(term, RaftRole::Leader)
    }

    pub fn to_follower(&self, term: u64) -> CompletableFuture<()> {
        self.transition(term, RaftRole::Follower)
    }

    pub fn to_inactive(&self) -> CompletableFuture<()> {
        let term = self.ctx.lock().expect("transition context poisoned").current_term;
        self.transition(term, RaftRole::Inactive)
    }

    fn transition(&self, term: u64, target: RaftRole) -> CompletableFuture<()> {
        let ctx = Arc::clone(&self.ctx);
        let steps = Arc::clone(&self.steps);
        bridge(async move {
            let (partition_id, from) = {
                let ctx = ctx.lock().expect("transition context poisoned");
                (ctx.partition_id, ctx.current_role)
            };
            info!(partition_id, ?from, to = %target, term, "Transitioning partition role");

            for step in steps.iter() {
                step.prepare(&ctx, term, target).await.map_err(|err| {
                    error!(
                        partition_id,
                        step = step.name(),
                        error = %err,
                        "Transition preparation failed"
                    );
                    err
                })?;
            }
            for step in steps.iter() {
                step.transition_to(&ctx, term, target).await.map_err(|err| {
                    error!(
                        partition_id,
                        step = step.name(),
                        error = %err,
                        "Transition step failed, aborting remaining steps"
                    );
                    err
                })?;
            }

            {
                let mut ctx = ctx.lock().expect("transition context poisoned");
                ctx.current_role = Some(target);
                ctx.current_term = term;
            }
            ROLE_TRANSITIONS_TOTAL
                .with_label_values(&[&partition_id.to_string(), &target.to_string()])
                .inc();
            info!(partition_id, role = %target, term, "Partition role transition complete");
            Ok(())
        })
    }
}

