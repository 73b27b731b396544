//! The per-partition actor.
//!
//! One actor owns every lifecycle decision of a partition: raft role
//! changes, disk-space signals, snapshot replication signals, admin
//! requests, and health edges all serialize onto it. Role transitions are
//! chained: a new transition starts only after the previous transition's
//! future resolved, so transitions for a partition never interleave.

use crate::admin::PartitionAdminAccess;
use crate::disk::DiskSpaceListener;
use crate::health::{
    FailureListener, HealthMonitor, HealthMonitorable, HealthStatus, PartitionHealth,
};
use crate::metrics::LEADER_TRANSITION_LATENCY;
use crate::raft::{ListenerId, RaftPartitionHandle, SnapshotReplicationListener};
use crate::transition::{PartitionTransition, SharedTransitionContext};
use flowmill_core::{PartitionId, RaftRole};
use flowmill_runtime::{
    bridge, CompletableFuture, ConcurrencyControl, StartupProcess, TaskError,
};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often the aggregate health of the partition's components is
/// recomputed.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Context threaded through the partition's startup steps (services that
/// exist independently of the raft role).
pub struct PartitionStartupContext {
    pub partition_id: PartitionId,
    pub transition_ctx: SharedTransitionContext,
    pub log_compactor: Arc<dyn crate::log::LogCompactor>,
    pub log_deletion_service: Option<crate::log::LogDeletionService>,
    pub db_metrics_timer: Option<flowmill_runtime::TimerHandle>,
}

struct PartitionInner {
    /// Raft role as last reported by the role-change listener.
    raft_role: Option<RaftRole>,
    current_transition: CompletableFuture<()>,
    close_future: Option<CompletableFuture<()>>,
    failure_listeners: Vec<Arc<dyn FailureListener>>,
    role_change_listener: Option<ListenerId>,
    replication_listener: Option<ListenerId>,
    startup_ctx: Option<PartitionStartupContext>,
}

pub struct Partition {
    partition_id: PartitionId,
    control: ConcurrencyControl,
    transition: PartitionTransition,
    raft: Arc<dyn RaftPartitionHandle>,
    health_monitor: Arc<HealthMonitor>,
    partition_health: Arc<PartitionHealth>,
    startup: StartupProcess<PartitionStartupContext>,
    log_compactor: Arc<dyn crate::log::LogCompactor>,
    inner: Mutex<PartitionInner>,
}

impl Partition {
    /// `control` must be an actor dedicated to this partition;
    /// `transition`'s context carries the partition's resources.
    pub fn new(
        control: ConcurrencyControl,
        transition: PartitionTransition,
        startup_steps: Vec<Box<dyn flowmill_runtime::StartupStep<PartitionStartupContext>>>,
        log_compactor: Arc<dyn crate::log::LogCompactor>,
    ) -> Arc<Self> {
        let (partition_id, raft, health_monitor) = {
            let ctx = transition.context().lock().expect("transition context poisoned");
            (ctx.partition_id, Arc::clone(&ctx.raft), Arc::clone(&ctx.health_monitor))
        };
        let partition_health = PartitionHealth::new(partition_id);
        let startup = StartupProcess::new(format!("Partition-{partition_id}"), startup_steps);
        Arc::new(Self {
            partition_id,
            control,
            transition,
            raft,
            health_monitor,
            partition_health,
            startup,
            log_compactor,
            inner: Mutex::new(PartitionInner {
                raft_role: None,
                current_transition: CompletableFuture::completed(()),
                close_future: None,
                failure_listeners: Vec::new(),
                role_change_listener: None,
                replication_listener: None,
                startup_ctx: None,
            }),
        })
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn admin_access(self: &Arc<Self>) -> PartitionAdminAccess {
        PartitionAdminAccess::new(
            self.control.clone(),
            Arc::clone(self.transition.context()),
            Arc::downgrade(self),
        )
    }

    pub fn health_status(&self) -> HealthStatus {
        self.health_monitor.health_status()
    }

    pub fn add_failure_listener(&self, listener: Arc<dyn FailureListener>) {
        self.inner
            .lock()
            .expect("partition state poisoned")
            .failure_listeners
            .push(listener);
    }

    /// Run the partition's startup process, register the raft and health
    /// listeners, and trigger the initial role transition.
    pub fn start(self: &Arc<Self>) -> CompletableFuture<()> {
        let partition = Arc::clone(self);
        let startup_future = bridge(async move {
            let mut ctx = PartitionStartupContext {
                partition_id: partition.partition_id,
                transition_ctx: Arc::clone(partition.transition.context()),
                log_compactor: Arc::clone(&partition.log_compactor),
                log_deletion_service: None,
                db_metrics_timer: None,
            };
            partition
                .startup
                .startup(&mut ctx)
                .await
                .map_err(|err| TaskError::Failed(err.to_string()))?;
            partition
                .inner
                .lock()
                .expect("partition state poisoned")
                .startup_ctx = Some(ctx);
            Ok(())
        });

        let future = self.control.create_future();
        let partition = Arc::clone(self);
        let result = future.clone();
        self.control.run_on_completion(&startup_future, move |started| {
            match started {
                Ok(()) => {
                    partition.register_listeners();
                    info!(partition_id = partition.partition_id, "Partition started");
                    result.complete(());
                }
                Err(err) => {
                    error!(
                        partition_id = partition.partition_id,
                        error = %err,
                        "Partition startup failed"
                    );
                    partition.handle_unrecoverable_failure();
                    result.fail(err);
                }
            }
        });
        future
    }

    /// Runs on the partition actor.
    fn register_listeners(self: &Arc<Self>) {
        self.health_monitor.register_component(
            Arc::downgrade(&self.partition_health) as Weak<dyn HealthMonitorable>
        );
        self.health_monitor.start_monitoring(HEALTH_CHECK_INTERVAL);

        let role_observer = Arc::downgrade(self);
        let role_listener = self.raft.add_role_change_listener(Box::new(move |role, term| {
            if let Some(partition) = role_observer.upgrade() {
                partition.on_new_role(role, term);
            }
        }));

        struct ReplicationForwarder(Weak<Partition>);
        impl SnapshotReplicationListener for ReplicationForwarder {
            fn on_snapshot_replication_started(&self) {
                if let Some(partition) = self.0.upgrade() {
                    partition.on_snapshot_replication_started();
                }
            }

            fn on_snapshot_replication_completed(&self, term: u64) {
                if let Some(partition) = self.0.upgrade() {
                    partition.on_snapshot_replication_completed(term);
                }
            }
        }
        let replication_listener = self
            .raft
            .add_snapshot_replication_listener(Box::new(ReplicationForwarder(Arc::downgrade(self))));

        {
            let mut inner = self.inner.lock().expect("partition state poisoned");
            inner.role_change_listener = Some(role_listener);
            inner.replication_listener = Some(replication_listener);
        }

        // Catch up with whatever role raft already is in.
        self.on_role_change(self.raft.role(), self.raft.term());
    }

    /// Raft role-change callback; fires on an external thread.
    pub fn on_new_role(self: &Arc<Self>, role: RaftRole, term: u64) {
        let partition = Arc::clone(self);
        self.control.run(move || partition.on_role_change(role, term));
    }

    /// Runs on the partition actor.
    fn on_role_change(self: &Arc<Self>, new_role: RaftRole, new_term: u64) {
        let previous = self
            .inner
            .lock()
            .expect("partition state poisoned")
            .raft_role;

        match new_role {
            RaftRole::Leader => {
                if previous != Some(RaftRole::Leader) {
                    self.enqueue_leader_transition(new_term);
                }
            }
            RaftRole::Inactive => {
                self.enqueue_inactive_transition();
            }
            _ => {
                // Passive, promotable, candidate and follower all run
                // follower services; only install them when coming from
                // nothing or from leadership.
                if previous.is_none() || previous == Some(RaftRole::Leader) {
                    self.enqueue_follower_transition(new_term);
                }
            }
        }

        debug!(
            partition_id = self.partition_id,
            from = ?previous,
            to = %new_role,
            term = new_term,
            "Partition observed role change"
        );
        self.inner.lock().expect("partition state poisoned").raft_role = Some(new_role);
    }

    /// Chain `start` behind the currently running transition, so that two
    /// transitions never execute concurrently.
    fn enqueue_transition<F>(self: &Arc<Self>, start: F) -> CompletableFuture<()>
    where
        F: FnOnce(&Arc<Self>) -> CompletableFuture<()> + Send + 'static,
    {
        let chained = self.control.create_future();
        let previous = {
            let mut inner = self.inner.lock().expect("partition state poisoned");
            let previous = inner.current_transition.clone();
            inner.current_transition = chained.clone();
            previous
        };

        let partition = Arc::clone(self);
        let forward = chained.clone();
        self.control.run_on_completion(&previous, move |_| {
            let transition_future = start(&partition);
            transition_future.on_complete(move |outcome| match outcome {
                Ok(()) => forward.complete(()),
                Err(err) => forward.fail(err.clone()),
            });
        });
        chained
    }

    fn enqueue_leader_transition(self: &Arc<Self>, term: u64) {
        self.enqueue_transition(move |partition| {
            let started_at = Instant::now();
            let future = partition.transition.to_leader(term);
            let observer = Arc::clone(partition);
            future.on_complete(move |outcome| match outcome {
                Ok(()) => {
                    LEADER_TRANSITION_LATENCY
                        .with_label_values(&[&observer.partition_id.to_string()])
                        .observe(started_at.elapsed().as_secs_f64());
                    observer.on_transition_complete();
                }
                Err(err) => {
                    let err = err.clone();
                    let failed = Arc::clone(&observer);
                    observer.control.run(move || failed.on_install_failure(err, term));
                }
            });
            future
        });
    }

    fn enqueue_follower_transition(self: &Arc<Self>, term: u64) {
        self.enqueue_transition(move |partition| {
            let future = partition.transition.to_follower(term);
            let observer = Arc::clone(partition);
            future.on_complete(move |outcome| match outcome {
                Ok(()) => observer.on_transition_complete(),
                Err(err) => {
                    let err = err.clone();
                    let failed = Arc::clone(&observer);
                    observer.control.run(move || failed.on_install_failure(err, term));
                }
            });
            future
        });
    }

    fn enqueue_inactive_transition(self: &Arc<Self>) -> CompletableFuture<()> {
        self.partition_health.set_services_installed(false);
        self.enqueue_transition(move |partition| partition.transition.to_inactive())
    }

    /// Runs on the completing thread; only touches thread-safe state.
    fn on_transition_complete(&self) {
        self.partition_health.set_services_installed(true);
        self.health_monitor.update();
    }

    /// Runs on the partition actor.
    fn on_install_failure(self: &Arc<Self>, error: TaskError, term: u64) {
        if error.is_unrecoverable() {
            error!(
                partition_id = self.partition_id,
                error = %error,
                "Failed to install partition services with unrecoverable failure"
            );
            self.handle_unrecoverable_failure();
        } else {
            self.handle_recoverable_failure(error, term);
        }
    }

    fn handle_recoverable_failure(self: &Arc<Self>, error: TaskError, term: u64) {
        self.partition_health.set_services_installed(false);
        self.health_monitor.update();

        let current_role = self
            .transition
            .context()
            .lock()
            .expect("transition context poisoned")
            .current_role;
        match current_role {
            Some(RaftRole::Leader) => {
                // Only step down for the term we are actually leading. A
                // failure carrying an older term is stale: a transition for
                // the newer term is already enqueued and will install
                // services for the new role.
                if term != self.raft.term() {
                    debug!(
                        partition_id = self.partition_id,
                        stale_term = term,
                        current_term = self.raft.term(),
                        "Ignoring stale transition failure, a newer transition supersedes it"
                    );
                    return;
                }
                info!(
                    partition_id = self.partition_id,
                    term,
                    error = %error,
                    "Unexpected failure while leader, stepping down"
                );
                self.raft.step_down();
            }
            _ => {
                // A follower (or not-yet-installed) partition leaves
                // replication regardless of the failure's term.
                info!(
                    partition_id = self.partition_id,
                    term,
                    error = %error,
                    "Unexpected failure while follower, going inactive"
                );
                self.raft.go_inactive();
            }
        }
    }

    fn handle_unrecoverable_failure(self: &Arc<Self>) {
        self.partition_health.on_unrecoverable_failure();
        self.health_monitor.update();

        let listeners = self
            .inner
            .lock()
            .expect("partition state poisoned")
            .failure_listeners
            .clone();
        for listener in listeners {
            listener.on_unrecoverable_failure();
        }

        self.enqueue_inactive_transition();
        self.raft.go_inactive();
    }

    /// A snapshot is being replicated onto this follower: tear the services
    /// down so the stream processor and exporter restart from the new state.
    /// Deliberately not marked unhealthy; this is normal follower life.
    pub fn on_snapshot_replication_started(self: &Arc<Self>) {
        let partition = Arc::clone(self);
        self.control.run(move || {
            info!(
                partition_id = partition.partition_id,
                "Snapshot replication started, transitioning to inactive"
            );
            partition.enqueue_transition(|p| p.transition.to_inactive());
        });
    }

    /// Replication finished; reinstall follower services over the new state.
    pub fn on_snapshot_replication_completed(self: &Arc<Self>, term: u64) {
        let partition = Arc::clone(self);
        self.control.run(move || {
            info!(
                partition_id = partition.partition_id,
                term, "Snapshot replication completed, reinstalling follower services"
            );
            partition.enqueue_follower_transition(term);
        });
    }

    /// Wait for the in-flight transition, go inactive, unregister listeners,
    /// shut the startup process down, and clear context references.
    pub fn close_async(self: &Arc<Self>) -> CompletableFuture<()> {
        {
            let mut inner = self.inner.lock().expect("partition state poisoned");
            if let Some(existing) = &inner.close_future {
                return existing.clone();
            }
            inner.close_future = Some(self.control.create_future());
        }
        let close_future = self
            .inner
            .lock()
            .expect("partition state poisoned")
            .close_future
            .clone()
            .expect("close future was just set");

        debug!(partition_id = self.partition_id, "Closing partition");
        let partition = Arc::clone(self);
        let result = close_future.clone();
        self.control.run(move || {
            let inactive = partition.enqueue_inactive_transition();
            let closing = Arc::clone(&partition);
            closing.clone().control.run_on_completion(&inactive, move |outcome| {
                if let Err(err) = outcome {
                    warn!(
                        partition_id = closing.partition_id,
                        error = %err,
                        "Transition to inactive failed during close"
                    );
                }
                closing.finish_close(result);
            });
        });
        close_future
    }

    /// Runs on the partition actor after the final inactive transition.
    fn finish_close(self: &Arc<Self>, close_future: CompletableFuture<()>) {
        {
            let mut inner = self.inner.lock().expect("partition state poisoned");
            if let Some(id) = inner.role_change_listener.take() {
                self.raft.remove_role_change_listener(id);
            }
            if let Some(id) = inner.replication_listener.take() {
                self.raft.remove_snapshot_replication_listener(id);
            }
        }
        self.health_monitor.stop_monitoring();
        self.health_monitor
            .remove_component(&self.partition_health.component_name());

        let partition = Arc::clone(self);
        tokio::spawn(async move {
            let startup_ctx = partition
                .inner
                .lock()
                .expect("partition state poisoned")
                .startup_ctx
                .take();
            if let Some(mut ctx) = startup_ctx {
                if let Err(err) = partition.startup.shutdown(&mut ctx).await {
                    warn!(
                        partition_id = partition.partition_id,
                        error = %err,
                        "Partition startup process shutdown failed"
                    );
                }
            }
            info!(partition_id = partition.partition_id, "Partition closed");
            close_future.complete(());
        });
    }
}

impl DiskSpaceListener for Partition {
    fn on_disk_space_not_available(&self) {
        let ctx = Arc::clone(self.transition.context());
        let partition_health = Arc::clone(&self.partition_health);
        let health_monitor = Arc::clone(&self.health_monitor);
        let partition_id = self.partition_id;
        self.control.run(move || {
            let processor = {
                let mut ctx = ctx.lock().expect("transition context poisoned");
                ctx.disk_space_available = false;
                ctx.stream_processor.clone()
            };
            partition_health.set_disk_space_available(false);
            health_monitor.update();
            if let Some(processor) = processor {
                warn!(
                    partition_id,
                    "Disk space usage is above threshold, pausing stream processor"
                );
                processor.pause_processing();
            }
        });
    }

    fn on_disk_space_available(&self) {
        let ctx = Arc::clone(self.transition.context());
        let partition_health = Arc::clone(&self.partition_health);
        let health_monitor = Arc::clone(&self.health_monitor);
        let partition_id = self.partition_id;
        self.control.run(move || {
            let processor = {
                let mut ctx = ctx.lock().expect("transition context poisoned");
                ctx.disk_space_available = true;
                // Stay paused when the admin surface paused processing.
                if ctx.processing_paused {
                    None
                } else {
                    ctx.stream_processor.clone()
                }
            };
            partition_health.set_disk_space_available(true);
            health_monitor.update();
            if let Some(processor) = processor {
                info!(
                    partition_id,
                    "Disk space usage is below threshold, resuming stream processor"
                );
                processor.resume_processing();
            }
        });
    }
}
