//! Cooperative scheduling: one logical thread per actor.
//!
//! An actor is an unbounded FIFO of tasks drained by a single dedicated tokio
//! task. Tasks submitted from one actor to itself run in FIFO order relative
//! to each other; tasks submitted from other actors may interleave between
//! them. Tasks are short and non-blocking; anything that touches the disk or
//! waits on another component goes through [`bridge`] and re-enters the actor
//! via [`ConcurrencyControl::run_on_completion`].

use crate::error::TaskError;
use crate::future::{CompletableFuture, CompletionGuard};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, trace};

type Task = Box<dyn FnOnce() + Send>;
type RepeatingTask = Arc<dyn Fn() + Send + Sync>;

pub(crate) trait Executor: Send + Sync {
    fn name(&self) -> &str;
    fn execute(&self, task: Task);
    fn schedule_repeating(&self, period: Duration, task: RepeatingTask) -> TimerHandle;
}

/// Cancellation handle for a repeating timer. Cancelling (or dropping) the
/// handle stops future firings; a task already enqueued still runs.
pub struct TimerHandle {
    handle: Option<JoinHandle<()>>,
}

impl TimerHandle {
    pub(crate) fn inert() -> Self {
        Self { handle: None }
    }

    pub(crate) fn from_join_handle(handle: JoinHandle<()>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Handle to an actor's task queue.
///
/// Cloning is cheap; all clones feed the same queue. When every clone is
/// dropped the actor drains its queue and stops.
#[derive(Clone)]
pub struct ConcurrencyControl {
    executor: Arc<dyn Executor>,
}

impl ConcurrencyControl {
    pub(crate) fn from_executor(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    /// The synchronous variant used by unit tests; see [`crate::testing`].
    pub fn inline() -> Self {
        crate::testing::inline_control()
    }

    pub fn name(&self) -> &str {
        self.executor.name()
    }

    /// Enqueue a task.
    pub fn run<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.executor.execute(Box::new(task));
    }

    /// Enqueue a task and resolve the returned future with its result. The
    /// future fails with [`TaskError::Canceled`] when the actor stops before
    /// the task runs.
    pub fn submit<T, F>(&self, task: F) -> CompletableFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let future = CompletableFuture::new();
        let guard = CompletionGuard::new(future.clone());
        self.run(move || guard.complete(task()));
        future
    }

    /// A fresh completable future usable across actors.
    pub fn create_future<T: Send + 'static>(&self) -> CompletableFuture<T> {
        CompletableFuture::new()
    }

    /// Run `callback` on *this* actor once `future` resolves. The callback is
    /// re-enqueued rather than run inline on the completing thread, so it
    /// cannot race with the actor's other tasks.
    pub fn run_on_completion<T, F>(&self, future: &CompletableFuture<T>, callback: F)
    where
        T: Clone + Send + 'static,
        F: FnOnce(Result<T, TaskError>) + Send + 'static,
    {
        let control = self.clone();
        future.on_complete(move |result| {
            let result = result.clone();
            control.run(move || callback(result));
        });
    }

    /// Schedule `task` onto this actor every `period` until the handle is
    /// cancelled. The first firing happens one period after scheduling.
    pub fn run_at_fixed_rate<F>(&self, period: Duration, task: F) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.executor.schedule_repeating(period, Arc::new(task))
    }
}

struct ActorExecutor {
    name: String,
    sender: mpsc::UnboundedSender<Task>,
}

impl Executor for ActorExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, task: Task) {
        // A closed queue means the actor stopped; dropping the task lets its
        // completion guard cancel the associated future.
        if self.sender.send(task).is_err() {
            trace!(actor = %self.name, "task submitted to stopped actor");
        }
    }

    fn schedule_repeating(&self, period: Duration, task: RepeatingTask) -> TimerHandle {
        let sender = self.sender.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately; consume
            // it so firings start one period from now.
            interval.tick().await;
            loop {
                interval.tick().await;
                let task = Arc::clone(&task);
                if sender.send(Box::new(move || task())).is_err() {
                    break;
                }
            }
        });
        TimerHandle::from_join_handle(handle)
    }
}

/// Spawns actors. Passed into constructors rather than accessed globally so
/// tests can substitute the inline control.
#[derive(Clone, Default)]
pub struct ActorScheduler {
    _private: (),
}

impl ActorScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an actor: an unbounded queue drained by one dedicated tokio
    /// task. Must be called from within a tokio runtime.
    pub fn spawn_actor(&self, name: impl Into<String>) -> ConcurrencyControl {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        let actor_name = name.clone();
        tokio::spawn(async move {
            while let Some(task) = receiver.recv().await {
                // A panicking task must not take down the whole actor; the
                // task's completion guard cancels its future on unwind.
                if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(task)) {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(actor = %actor_name, panic = %message, "actor task panicked");
                }
            }
            trace!(actor = %actor_name, "actor stopped");
        });
        ConcurrencyControl::from_executor(Arc::new(ActorExecutor { name, sender }))
    }
}

/// Adapt an ordinary async block into a completable future by spawning it.
/// Must be called from within a tokio runtime.
pub fn bridge<T, F>(future: F) -> CompletableFuture<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T, TaskError>> + Send + 'static,
{
    let completable = CompletableFuture::new();
    let completer = completable.clone();
    tokio::spawn(async move {
        match future.await {
            Ok(value) => completer.complete(value),
            Err(error) => completer.fail(error),
        }
    });
    completable
}
