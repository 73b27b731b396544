//! Periodic snapshot construction for one partition.
//!
//! The director runs on its own actor. On every period it asks the stream
//! processor for the last processed position and hands it to the state
//! controller. What happens to the resulting transient snapshot depends on
//! the mode:
//!
//! - **processing mode** (leader): the snapshot is anchored at a log entry
//!   that may not be committed yet; the director holds the transient until a
//!   committed-entry notification reaches the snapshot's index, then
//!   persists.
//! - **replay mode** (follower): everything applied is already committed, so
//!   the snapshot persists immediately.
//!
//! At most one snapshot construction is in flight at a time.

use crate::health::{HealthMonitorable, HealthStatus};
use crate::metrics::SNAPSHOT_DURATION;
use crate::processor::{StreamProcessor, NO_POSITION};
use crate::state::StateController;
use flowmill_core::{IndexedEntry, PartitionId, Position};
use flowmill_runtime::{CompletableFuture, ConcurrencyControl, TaskError, TimerHandle};
use flowmill_snapshots::{PersistedSnapshot, TransientSnapshot};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    Processing,
    Replay,
}

struct DirectorInner {
    /// A taken snapshot waiting for its anchor entry to commit.
    pending: Option<TransientSnapshot>,
    commit_index: u64,
    in_progress: bool,
    healthy: bool,
    started_at: Option<Instant>,
}

pub struct AsyncSnapshotDirector {
    partition_id: PartitionId,
    mode: SnapshotMode,
    control: ConcurrencyControl,
    state_controller: Arc<StateController>,
    processor: Arc<StreamProcessor>,
    period: Duration,
    inner: Mutex<DirectorInner>,
    timer: Mutex<Option<TimerHandle>>,
}

impl AsyncSnapshotDirector {
    pub fn of_processing_mode(
        control: ConcurrencyControl,
        partition_id: PartitionId,
        processor: Arc<StreamProcessor>,
        state_controller: Arc<StateController>,
        period: Duration,
    ) -> Arc<Self> {
        Self::new(control, partition_id, SnapshotMode::Processing, processor, state_controller, period)
    }

    pub fn of_replay_mode(
        control: ConcurrencyControl,
        partition_id: PartitionId,
        processor: Arc<StreamProcessor>,
        state_controller: Arc<StateController>,
        period: Duration,
    ) -> Arc<Self> {
        Self::new(control, partition_id, SnapshotMode::Replay, processor, state_controller, period)
    }

    fn new(
        control: ConcurrencyControl,
        partition_id: PartitionId,
        mode: SnapshotMode,
        processor: Arc<StreamProcessor>,
        state_controller: Arc<StateController>,
        period: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            partition_id,
            mode,
            control,
            state_controller,
            processor,
            period,
            inner: Mutex::new(DirectorInner {
                pending: None,
                commit_index: 0,
                in_progress: false,
                healthy: true,
                started_at: None,
            }),
            timer: Mutex::new(None),
        })
    }

    pub fn mode(&self) -> SnapshotMode {
        self.mode
    }

    /// Begin the periodic snapshot schedule.
    pub fn start(self: &Arc<Self>) {
        let director = Arc::downgrade(self);
        let handle = self.control.run_at_fixed_rate(self.period, move || {
            if let Some(director) = director.upgrade() {
                director.trigger();
            }
        });
        *self.timer.lock().expect("director timer poisoned") = Some(handle);
        info!(
            partition_id = self.partition_id,
            mode = ?self.mode,
            period_secs = self.period.as_secs(),
            "Snapshot director started"
        );
    }

    /// Trigger a snapshot outside the schedule (admin surface). The future
    /// resolves when the attempt has been enqueued on the director's actor.
    pub fn force_snapshot(self: &Arc<Self>) -> CompletableFuture<()> {
        let director = Arc::clone(self);
        self.control.submit(move || director.trigger())
    }

    /// Committed-entry notification from the raft collaborator. May be
    /// called from any thread.
    pub fn on_committed_entry(self: &Arc<Self>, entry: IndexedEntry) {
        let director = Arc::clone(self);
        self.control.run(move || {
            let ready = {
                let mut inner = director.inner.lock().expect("director state poisoned");
                inner.commit_index = inner.commit_index.max(entry.index);
                match &inner.pending {
                    Some(pending) if pending.index() <= inner.commit_index => inner.pending.take(),
                    _ => None,
                }
            };
            if let Some(snapshot) = ready {
                trace!(
                    partition_id = director.partition_id,
                    commit_index = entry.index,
                    "Commit position reached pending snapshot, persisting"
                );
                director.persist_now(snapshot);
            }
        });
    }

    /// Cancel the schedule and abort any pending transient snapshot.
    pub fn close_async(self: &Arc<Self>) -> CompletableFuture<()> {
        if let Some(mut timer) = self.timer.lock().expect("director timer poisoned").take() {
            timer.cancel();
        }
        let future = self.control.create_future();
        let director = Arc::clone(self);
        let result = future.clone();
        self.control.run(move || {
            let pending = director
                .inner
                .lock()
                .expect("director state poisoned")
                .pending
                .take();
            match pending {
                Some(snapshot) => {
                    let partition_id = director.partition_id;
                    tokio::spawn(async move {
                        if let Err(err) = snapshot.abort().await {
                            warn!(
                                partition_id,
                                error = %err,
                                "Failed to abort pending snapshot on close"
                            );
                        }
                        result.complete(());
                    });
                }
                None => result.complete(()),
            }
        });
        future
    }

    /// Runs on the director's actor.
    fn trigger(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().expect("director state poisoned");
            if inner.in_progress {
                debug!(
                    partition_id = self.partition_id,
                    "Snapshot already in progress, skipping trigger"
                );
                return;
            }
            inner.in_progress = true;
            inner.started_at = Some(Instant::now());
        }

        let director = Arc::clone(self);
        let position_future = self.processor.last_processed_position();
        self.control
            .run_on_completion(&position_future, move |position| match position {
                Ok(position) => director.on_position(position),
                Err(err) => {
                    error!(
                        partition_id = director.partition_id,
                        error = %err,
                        "Failed to query last processed position"
                    );
                    director.finish(false);
                }
            });
    }

    fn on_position(self: &Arc<Self>, position: Position) {
        if position == NO_POSITION {
            debug!(
                partition_id = self.partition_id,
                "Nothing processed yet, skipping snapshot"
            );
            self.finish_quietly();
            return;
        }

        let director = Arc::clone(self);
        let snapshot_future = self.state_controller.take_transient_snapshot(position);
        tokio::spawn(async move {
            let outcome = snapshot_future.await;
            let settle = Arc::clone(&director);
            director
                .control
                .run(move || settle.on_snapshot_taken(outcome));
        });
    }

    fn on_snapshot_taken(self: &Arc<Self>, outcome: Result<Option<TransientSnapshot>, TaskError>) {
        match outcome {
            Err(err) => {
                error!(
                    partition_id = self.partition_id,
                    error = %err,
                    "Snapshot construction failed"
                );
                self.finish(false);
            }
            Ok(None) => {
                debug!(
                    partition_id = self.partition_id,
                    "No snapshot was taken"
                );
                self.finish_quietly();
            }
            Ok(Some(snapshot)) => match self.mode {
                SnapshotMode::Replay => self.persist_now(snapshot),
                SnapshotMode::Processing => {
                    let commit_index = self
                        .inner
                        .lock()
                        .expect("director state poisoned")
                        .commit_index;
                    if snapshot.index() <= commit_index {
                        self.persist_now(snapshot);
                    } else {
                        debug!(
                            partition_id = self.partition_id,
                            snapshot_index = snapshot.index(),
                            commit_index,
                            "Holding snapshot until its anchor entry commits"
                        );
                        self.inner
                            .lock()
                            .expect("director state poisoned")
                            .pending = Some(snapshot);
                    }
                }
            },
        }
    }

    fn persist_now(self: &Arc<Self>, snapshot: TransientSnapshot) {
        let director = Arc::clone(self);
        tokio::spawn(async move {
            let persisted = snapshot.persist().await;
            let settle = Arc::clone(&director);
            director.control.run(move || settle.on_persisted(persisted));
        });
    }

    fn on_persisted(
        self: &Arc<Self>,
        persisted: Result<PersistedSnapshot, flowmill_snapshots::SnapshotError>,
    ) {
        match persisted {
            Ok(snapshot) => {
                info!(
                    partition_id = self.partition_id,
                    id = %snapshot.id(),
                    compaction_bound = snapshot.compaction_bound(),
                    "Snapshot persisted"
                );
                self.finish(true);
            }
            Err(err) => {
                error!(
                    partition_id = self.partition_id,
                    error = %err,
                    "Failed to persist snapshot"
                );
                self.finish(false);
            }
        }
    }

    /// End the in-flight attempt and update health.
    fn finish(&self, success: bool) {
        let started_at = {
            let mut inner = self.inner.lock().expect("director state poisoned");
            inner.in_progress = false;
            inner.healthy = success;
            inner.started_at.take()
        };
        if success {
            if let Some(started_at) = started_at {
                SNAPSHOT_DURATION
                    .with_label_values(&[&self.partition_id.to_string()])
                    .observe(started_at.elapsed().as_secs_f64());
            }
        }
    }

    /// End the attempt without touching health (nothing happened).
    fn finish_quietly(&self) {
        let mut inner = self.inner.lock().expect("director state poisoned");
        inner.in_progress = false;
        inner.started_at = None;
    }
}

impl HealthMonitorable for AsyncSnapshotDirector {
    fn component_name(&self) -> String {
        format!("SnapshotDirector-{}", self.partition_id)
    }

    fn health_status(&self) -> HealthStatus {
        if self.inner.lock().expect("director state poisoned").healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}
