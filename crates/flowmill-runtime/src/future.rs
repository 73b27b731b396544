//! A completable future usable across actors.
//!
//! Modeled as a cloneable handle to shared completion state. One side
//! completes (or fails) the future exactly once; the other side either awaits
//! it or registers observer callbacks with [`CompletableFuture::on_complete`].
//!
//! Awaiting takes the value, so a future must be awaited by at most one
//! consumer; clones that only need to observe the outcome use `on_complete`,
//! which receives the result by reference and may be registered any number of
//! times.

use crate::error::TaskError;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

type Observer<T> = Box<dyn FnOnce(&Result<T, TaskError>) + Send>;

struct State<T> {
    /// Present from completion until a poll takes it.
    result: Option<Result<T, TaskError>>,
    completed: bool,
    /// Completion is currently running observer callbacks outside the lock;
    /// polls must park until the result lands.
    dispatching: bool,
    observers: Vec<Observer<T>>,
    wakers: Vec<Waker>,
}

pub struct CompletableFuture<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for CompletableFuture<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Send + 'static> Default for CompletableFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> CompletableFuture<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                result: None,
                completed: false,
                dispatching: false,
                observers: Vec::new(),
                wakers: Vec::new(),
            })),
        }
    }

    pub fn completed(value: T) -> Self {
        let future = Self::new();
        future.complete(value);
        future
    }

    pub fn failed(error: TaskError) -> Self {
        let future = Self::new();
        future.fail(error);
        future
    }

    /// Resolve the future. The first completion wins; later completions are
    /// ignored.
    pub fn complete(&self, value: T) {
        self.finish(Ok(value));
    }

    /// Fail the future. The first completion wins; later completions are
    /// ignored.
    pub fn fail(&self, error: TaskError) {
        self.finish(Err(error));
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().expect("future state poisoned").completed
    }

    /// Register an observer. Runs immediately when the future is already
    /// complete, otherwise at completion time, on the completing thread; use
    /// [`crate::ConcurrencyControl::run_on_completion`] to re-serialize onto
    /// an actor instead.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Result<T, TaskError>) + Send + 'static,
    {
        let taken = {
            let mut state = self.state.lock().expect("future state poisoned");
            if !state.completed {
                state.observers.push(Box::new(callback));
                return;
            }
            if state.dispatching {
                // Completion is dispatching observers right now; join them.
                state.observers.push(Box::new(callback));
                return;
            }
            state.dispatching = true;
            state.result.take()
        };

        match taken {
            Some(result) => {
                callback(&result);
                self.settle(result);
            }
            None => {
                // The value was already moved out by an awaiting consumer.
                callback(&Err(TaskError::Canceled(
                    "future result already consumed".to_string(),
                )));
                let mut state = self.state.lock().expect("future state poisoned");
                state.dispatching = false;
            }
        }
    }

    fn finish(&self, result: Result<T, TaskError>) {
        let observers = {
            let mut state = self.state.lock().expect("future state poisoned");
            if state.completed {
                return;
            }
            state.completed = true;
            state.dispatching = true;
            std::mem::take(&mut state.observers)
        };

        for observer in observers {
            observer(&result);
        }
        self.settle(result);
    }

    /// Store the result, drain observers registered while dispatching, and
    /// wake awaiting consumers.
    fn settle(&self, result: Result<T, TaskError>) {
        loop {
            let late = {
                let mut state = self.state.lock().expect("future state poisoned");
                if state.observers.is_empty() {
                    state.result = Some(result);
                    state.dispatching = false;
                    for waker in state.wakers.drain(..) {
                        waker.wake();
                    }
                    return;
                }
                std::mem::take(&mut state.observers)
            };
            for observer in late {
                observer(&result);
            }
        }
    }
}

impl<T: Send + 'static> Future for CompletableFuture<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.lock().expect("future state poisoned");
        if state.completed && !state.dispatching {
            match state.result.take() {
                Some(result) => return Poll::Ready(result),
                None => {
                    return Poll::Ready(Err(TaskError::Canceled(
                        "future result already consumed".to_string(),
                    )))
                }
            }
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// Fails its future with [`TaskError::Canceled`] when dropped unarmed. Wrapped
/// around submitted tasks so that futures of tasks discarded by a stopping
/// actor still resolve.
pub(crate) struct CompletionGuard<T: Send + 'static> {
    future: Option<CompletableFuture<T>>,
}

impl<T: Send + 'static> CompletionGuard<T> {
    pub(crate) fn new(future: CompletableFuture<T>) -> Self {
        Self {
            future: Some(future),
        }
    }

    pub(crate) fn complete(mut self, value: T) {
        if let Some(future) = self.future.take() {
            future.complete(value);
        }
    }
}

impl<T: Send + 'static> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        if let Some(future) = self.future.take() {
            future.fail(TaskError::Canceled("task dropped before running".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_await_resolves_with_completed_value() {
        let future = CompletableFuture::new();
        future.complete(7);
        assert_eq!(future.await, Ok(7));
    }

    #[tokio::test]
    async fn test_await_resolves_with_failure() {
        let future: CompletableFuture<u32> = CompletableFuture::new();
        future.fail(TaskError::Failed("boom".to_string()));
        assert_eq!(future.await, Err(TaskError::Failed("boom".to_string())));
    }

    #[tokio::test]
    async fn test_first_completion_wins() {
        let future = CompletableFuture::new();
        future.complete(1);
        future.complete(2);
        future.fail(TaskError::Failed("late".to_string()));
        assert_eq!(future.await, Ok(1));
    }

    #[test]
    fn test_observer_registered_before_completion_fires_once() {
        let future = CompletableFuture::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        future.on_complete(move |result| {
            sink.lock().unwrap().push(result.clone());
        });
        future.complete(42);
        assert_eq!(&*seen.lock().unwrap(), &[Ok(42)]);
    }

    #[test]
    fn test_observer_registered_after_completion_fires_immediately() {
        let future = CompletableFuture::completed(9);
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        future.on_complete(move |result| {
            *sink.lock().unwrap() = Some(result.clone());
        });
        assert_eq!(*seen.lock().unwrap(), Some(Ok(9)));
    }

    #[tokio::test]
    async fn test_observer_does_not_consume_the_value() {
        let future = CompletableFuture::new();
        future.on_complete(|_| {});
        future.complete(3);
        assert_eq!(future.await, Ok(3));
    }

    #[tokio::test]
    async fn test_await_across_tasks() {
        let future: CompletableFuture<&'static str> = CompletableFuture::new();
        let completer = future.clone();
        tokio::spawn(async move {
            completer.complete("done");
        });
        assert_eq!(future.await, Ok("done"));
    }

    #[tokio::test]
    async fn test_dropped_guard_cancels() {
        let future: CompletableFuture<u32> = CompletableFuture::new();
        let guard = CompletionGuard::new(future.clone());
        drop(guard);
        assert!(matches!(future.await, Err(TaskError::Canceled(_))));
    }
}
