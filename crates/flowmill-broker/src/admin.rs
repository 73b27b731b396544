//! The partition's admin surface.
//!
//! Every operation serializes onto the partition actor and returns a future;
//! operations on services that are not installed resolve immediately (benign
//! absence).

use crate::partition::Partition;
use crate::transition::SharedTransitionContext;
use flowmill_core::RaftRole;
use flowmill_runtime::{CompletableFuture, ConcurrencyControl};
use std::sync::{Arc, Weak};
use tracing::debug;

pub struct PartitionAdminAccess {
    control: ConcurrencyControl,
    ctx: SharedTransitionContext,
    partition: Weak<Partition>,
}

impl PartitionAdminAccess {
    pub(crate) fn new(
        control: ConcurrencyControl,
        ctx: SharedTransitionContext,
        partition: Weak<Partition>,
    ) -> Self {
        Self {
            control,
            ctx,
            partition,
        }
    }

    pub fn pause_processing(&self) -> CompletableFuture<()> {
        let ctx = Arc::clone(&self.ctx);
        self.forwarded(move |done| {
            let processor = {
                let mut ctx = ctx.lock().expect("transition context poisoned");
                ctx.processing_paused = true;
                ctx.stream_processor.clone()
            };
            match processor {
                Some(processor) => forward(processor.pause_processing(), done),
                None => done.complete(()),
            }
        })
    }

    pub fn resume_processing(&self) -> CompletableFuture<()> {
        let ctx = Arc::clone(&self.ctx);
        self.forwarded(move |done| {
            let processor = {
                let mut ctx = ctx.lock().expect("transition context poisoned");
                ctx.processing_paused = false;
                // Disk pressure overrides the admin resume until it clears.
                if ctx.disk_space_available {
                    ctx.stream_processor.clone()
                } else {
                    None
                }
            };
            match processor {
                Some(processor) => forward(processor.resume_processing(), done),
                None => done.complete(()),
            }
        })
    }

    pub fn pause_exporting(&self) -> CompletableFuture<()> {
        let ctx = Arc::clone(&self.ctx);
        self.forwarded(move |done| {
            let director = {
                let mut ctx = ctx.lock().expect("transition context poisoned");
                ctx.exporting_paused = true;
                ctx.exporter_director.clone()
            };
            match director {
                Some(director) => forward(director.pause_exporting(), done),
                None => done.complete(()),
            }
        })
    }

    pub fn resume_exporting(&self) -> CompletableFuture<()> {
        let ctx = Arc::clone(&self.ctx);
        self.forwarded(move |done| {
            let director = {
                let mut ctx = ctx.lock().expect("transition context poisoned");
                ctx.exporting_paused = false;
                ctx.exporter_director.clone()
            };
            match director {
                Some(director) => forward(director.resume_exporting(), done),
                None => done.complete(()),
            }
        })
    }

    /// Trigger a snapshot outside the periodic schedule.
    pub fn take_snapshot(&self) -> CompletableFuture<()> {
        let ctx = Arc::clone(&self.ctx);
        self.forwarded(move |done| {
            let director = ctx
                .lock()
                .expect("transition context poisoned")
                .snapshot_director
                .clone();
            match director {
                Some(director) => forward(director.force_snapshot(), done),
                None => {
                    debug!("No snapshot director installed, ignoring snapshot request");
                    done.complete(());
                }
            }
        })
    }

    /// The role of the most recently completed transition.
    pub fn get_current_role(&self) -> CompletableFuture<Option<RaftRole>> {
        let ctx = Arc::clone(&self.ctx);
        self.control.submit(move || {
            ctx.lock().expect("transition context poisoned").current_role
        })
    }

    /// Whether the partition behind this handle still exists.
    pub fn is_attached(&self) -> bool {
        self.partition.upgrade().is_some()
    }

    fn forwarded<F>(&self, task: F) -> CompletableFuture<()>
    where
        F: FnOnce(CompletableFuture<()>) + Send + 'static,
    {
        let future = self.control.create_future();
        let done = future.clone();
        self.control.run(move || task(done));
        future
    }
}

/// Resolve `done` with the outcome of `inner`.
fn forward(inner: CompletableFuture<()>, done: CompletableFuture<()>) {
    inner.on_complete(move |outcome| match outcome {
        Ok(()) => done.complete(()),
        Err(err) => done.fail(err.clone()),
    });
}
