//! The error currency carried by futures across actor boundaries.

use thiserror::Error;

/// Categorized error resolved into a [`crate::CompletableFuture`].
///
/// The categories drive the partition failure policy: transient I/O and
/// generic failures are recoverable (the partition steps down or goes
/// inactive and may be reinstalled), invariant violations fail the operation
/// loudly, and `Unrecoverable` marks the partition dead.
///
/// The type is `Clone` because several observers may watch the same future.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task was dropped before it ran, usually because its actor shut
    /// down.
    #[error("task canceled: {0}")]
    Canceled(String),

    /// An I/O failure that may succeed on retry.
    #[error("i/o error: {0}")]
    Io(String),

    /// A broken internal assumption, e.g. a computed snapshot position with
    /// no matching indexed log entry. Never silently ignored.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The partition cannot continue; it transitions to inactive and its
    /// health becomes dead.
    #[error("unrecoverable failure: {0}")]
    Unrecoverable(String),

    /// A bounded wait on a collaborator elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Any other recoverable failure.
    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, TaskError::Unrecoverable(_))
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        TaskError::Io(err.to_string())
    }
}
