//! Ordered, reversible startup steps.
//!
//! A startup process runs its steps forward in order, threading a mutable
//! context through them. When a step fails, the steps that already started
//! are shut down again in reverse order before the original error is
//! returned, so a half-started process never leaks running services.
//! Shutdown is best-effort: a failing step is logged and the unwind
//! continues.
//!
//! Used both for process-wide broker bring-up and for per-partition service
//! installation.

use crate::error::TaskError;
use crate::metrics::STARTUP_STEP_DURATION;
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Error)]
pub enum StartupError {
    #[error("step '{step}' failed during {operation}")]
    StepFailed {
        step: String,
        operation: &'static str,
        #[source]
        source: TaskError,
    },

    #[error("startup process '{0}' was already started")]
    AlreadyStarted(String),

    #[error("startup process '{0}' was already shut down")]
    AlreadyShutDown(String),
}

impl StartupError {
    /// The error of the step that originally failed.
    pub fn source_error(&self) -> Option<&TaskError> {
        match self {
            StartupError::StepFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// One reversible unit of bring-up. `startup` installs, `shutdown` reverses
/// it; both mutate the shared context in place.
#[async_trait]
pub trait StartupStep<C: Send>: Send + Sync {
    fn name(&self) -> &str;

    async fn startup(&self, ctx: &mut C) -> Result<(), TaskError>;

    async fn shutdown(&self, ctx: &mut C) -> Result<(), TaskError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Started,
    ShutDown,
}

pub struct StartupProcess<C: Send> {
    name: String,
    steps: Vec<Box<dyn StartupStep<C>>>,
    /// Indexes of the steps whose `startup` completed, in start order.
    started: Mutex<Vec<usize>>,
    phase: Mutex<Phase>,
}

impl<C: Send> StartupProcess<C> {
    pub fn new(name: impl Into<String>, steps: Vec<Box<dyn StartupStep<C>>>) -> Self {
        Self {
            name: name.into(),
            steps,
            started: Mutex::new(Vec::new()),
            phase: Mutex::new(Phase::NotStarted),
        }
    }

    /// Run all steps in order. On the first failure the already-started steps
    /// are shut down in reverse order and the failing step's error is
    /// returned.
    pub async fn startup(&self, ctx: &mut C) -> Result<(), StartupError> {
        {
            let mut phase = self.phase.lock().expect("startup phase poisoned");
            match *phase {
                Phase::NotStarted => *phase = Phase::Started,
                Phase::Started => return Err(StartupError::AlreadyStarted(self.name.clone())),
                Phase::ShutDown => return Err(StartupError::AlreadyShutDown(self.name.clone())),
            }
        }

        info!(process = %self.name, steps = self.steps.len(), "Starting");
        for (index, step) in self.steps.iter().enumerate() {
            let started_at = Instant::now();
            debug!(process = %self.name, step = step.name(), "Starting step");

            match step.startup(ctx).await {
                Ok(()) => {
                    self.observe(step.name(), "startup", started_at);
                    debug!(
                        process = %self.name,
                        step = step.name(),
                        duration_ms = started_at.elapsed().as_millis() as u64,
                        "Step started"
                    );
                    self.started.lock().expect("startup stack poisoned").push(index);
                }
                Err(source) => {
                    self.observe(step.name(), "startup", started_at);
                    error!(
                        process = %self.name,
                        step = step.name(),
                        error = %source,
                        "Step failed, unwinding already-started steps"
                    );
                    self.unwind(ctx).await;
                    *self.phase.lock().expect("startup phase poisoned") = Phase::ShutDown;
                    return Err(StartupError::StepFailed {
                        step: step.name().to_string(),
                        operation: "startup",
                        source,
                    });
                }
            }
        }

        info!(process = %self.name, "Started");
        Ok(())
    }

    /// Shut down all started steps in reverse order. Best-effort: a failing
    /// step is logged and the unwind continues past it.
    pub async fn shutdown(&self, ctx: &mut C) -> Result<(), StartupError> {
        {
            let mut phase = self.phase.lock().expect("startup phase poisoned");
            if *phase == Phase::ShutDown {
                return Err(StartupError::AlreadyShutDown(self.name.clone()));
            }
            *phase = Phase::ShutDown;
        }

        info!(process = %self.name, "Shutting down");
        self.unwind(ctx).await;
        info!(process = %self.name, "Shut down");
        Ok(())
    }

    async fn unwind(&self, ctx: &mut C) {
        let started: Vec<usize> = {
            let mut stack = self.started.lock().expect("startup stack poisoned");
            stack.drain(..).collect()
        };

        for index in started.into_iter().rev() {
            let step = &self.steps[index];
            let started_at = Instant::now();
            debug!(process = %self.name, step = step.name(), "Shutting down step");
            if let Err(error) = step.shutdown(ctx).await {
                error!(
                    process = %self.name,
                    step = step.name(),
                    error = %error,
                    "Step shutdown failed, continuing teardown"
                );
            }
            self.observe(step.name(), "shutdown", started_at);
        }
    }

    fn observe(&self, step: &str, operation: &str, started_at: Instant) {
        STARTUP_STEP_DURATION
            .with_label_values(&[&self.name, step, operation])
            .observe(started_at.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Context recording the order in which steps ran.
    #[derive(Default)]
    struct Journal {
        events: Vec<String>,
    }

    struct RecordingStep {
        name: String,
        fail_on_startup: bool,
    }

    impl RecordingStep {
        fn ok(name: &str) -> Box<Self> {
            Box::new(Self {
                name: name.to_string(),
                fail_on_startup: false,
            })
        }

        fn failing(name: &str) -> Box<Self> {
            Box::new(Self {
                name: name.to_string(),
                fail_on_startup: true,
            })
        }
    }

    #[async_trait]
    impl StartupStep<Journal> for RecordingStep {
        fn name(&self) -> &str {
            &self.name
        }

        async fn startup(&self, ctx: &mut Journal) -> Result<(), TaskError> {
            if self.fail_on_startup {
                return Err(TaskError::Failed(format!("{} refused", self.name)));
            }
            ctx.events.push(format!("start:{}", self.name));
            Ok(())
        }

        async fn shutdown(&self, ctx: &mut Journal) -> Result<(), TaskError> {
            ctx.events.push(format!("stop:{}", self.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let process = StartupProcess::new(
            "test",
            vec![RecordingStep::ok("a"), RecordingStep::ok("b"), RecordingStep::ok("c")],
        );
        let mut journal = Journal::default();
        process.startup(&mut journal).await.unwrap();
        assert_eq!(journal.events, ["start:a", "start:b", "start:c"]);
    }

    #[tokio::test]
    async fn test_shutdown_runs_in_reverse_order() {
        let process = StartupProcess::new(
            "test",
            vec![RecordingStep::ok("a"), RecordingStep::ok("b"), RecordingStep::ok("c")],
        );
        let mut journal = Journal::default();
        process.startup(&mut journal).await.unwrap();
        process.shutdown(&mut journal).await.unwrap();
        assert_eq!(
            journal.events,
            ["start:a", "start:b", "start:c", "stop:c", "stop:b", "stop:a"]
        );
    }

    #[tokio::test]
    async fn test_failure_unwinds_started_steps_only() {
        let process = StartupProcess::new(
            "test",
            vec![
                RecordingStep::ok("a"),
                RecordingStep::failing("b"),
                RecordingStep::ok("c"),
            ],
        );
        let mut journal = Journal::default();
        let error = process.startup(&mut journal).await.unwrap_err();

        // A started and was shut down; C never ran in either direction.
        assert_eq!(journal.events, ["start:a", "stop:a"]);
        assert_eq!(
            error.source_error(),
            Some(&TaskError::Failed("b refused".to_string()))
        );
        match error {
            StartupError::StepFailed { step, .. } => assert_eq!(step, "b"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_continues_past_failing_step() {
        struct FailingShutdown;

        #[async_trait]
        impl StartupStep<Journal> for FailingShutdown {
            fn name(&self) -> &str {
                "failing-shutdown"
            }

            async fn startup(&self, ctx: &mut Journal) -> Result<(), TaskError> {
                ctx.events.push("start:failing-shutdown".to_string());
                Ok(())
            }

            async fn shutdown(&self, _ctx: &mut Journal) -> Result<(), TaskError> {
                Err(TaskError::Failed("cannot stop".to_string()))
            }
        }

        let process = StartupProcess::new(
            "test",
            vec![
                RecordingStep::ok("a"),
                Box::new(FailingShutdown),
                RecordingStep::ok("c"),
            ],
        );
        let mut journal = Journal::default();
        process.startup(&mut journal).await.unwrap();
        process.shutdown(&mut journal).await.unwrap();

        // The failing middle step does not stop A from shutting down.
        assert_eq!(
            journal.events,
            [
                "start:a",
                "start:failing-shutdown",
                "start:c",
                "stop:c",
                "stop:a"
            ]
        );
    }

    #[tokio::test]
    async fn test_double_startup_is_rejected() {
        let process = StartupProcess::new("test", vec![RecordingStep::ok("a")]);
        let mut journal = Journal::default();
        process.startup(&mut journal).await.unwrap();
        assert!(matches!(
            process.startup(&mut journal).await,
            Err(StartupError::AlreadyStarted(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_process_starts_and_stops() {
        let process: StartupProcess<Journal> = StartupProcess::new("empty", Vec::new());
        let mut journal = Journal::default();
        process.startup(&mut journal).await.unwrap();
        process.shutdown(&mut journal).await.unwrap();
        assert!(journal.events.is_empty());
    }

    #[tokio::test]
    async fn test_steps_shared_between_tasks() {
        // StartupProcess is used behind Arc by the partition actor.
        let process = Arc::new(StartupProcess::new("shared", vec![RecordingStep::ok("a")]));
        let mut journal = Journal::default();
        process.startup(&mut journal).await.unwrap();
        process.shutdown(&mut journal).await.unwrap();
        assert_eq!(journal.events, ["start:a", "stop:a"]);
    }
}
