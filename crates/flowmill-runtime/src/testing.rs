//! Synchronous concurrency control for unit tests.
//!
//! The inline executor runs every submitted task immediately on the caller's
//! thread, without an actor queue. Futures passed to
//! [`crate::ConcurrencyControl::run_on_completion`] invoke the callback
//! immediately when already complete. Repeating timers are inert: there is no
//! scheduler to drive them, so tests trigger periodic behavior by hand.
//!
//! This trades away the dynamic scheduling behavior, so it is only suitable
//! for unit tests; integration suites use a real [`crate::ActorScheduler`].

use crate::concurrency::{ConcurrencyControl, Executor, TimerHandle};
use std::sync::Arc;
use std::time::Duration;

struct InlineExecutor;

impl Executor for InlineExecutor {
    fn name(&self) -> &str {
        "inline"
    }

    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }

    fn schedule_repeating(
        &self,
        _period: Duration,
        _task: Arc<dyn Fn() + Send + Sync>,
    ) -> TimerHandle {
        TimerHandle::inert()
    }
}

pub(crate) fn inline_control() -> ConcurrencyControl {
    ConcurrencyControl::from_executor(Arc::new(InlineExecutor))
}
