//! Actor runtime and startup framework.
//!
//! Every partition in the broker is a single logical thread of execution: an
//! unbounded FIFO of tasks drained by one dedicated tokio task. All access to
//! a partition's state is serialized through its queue, so components never
//! lock across operations and external callers always get a future back.
//!
//! The crate also carries the reversible startup-step framework used both for
//! process-wide service bring-up and for partition bring-up: steps run forward
//! in order, and a failure unwinds the already-started steps in reverse.

pub mod concurrency;
pub mod error;
pub mod future;
pub mod metrics;
pub mod startup;
pub mod testing;

pub use concurrency::{bridge, ActorScheduler, ConcurrencyControl, TimerHandle};
pub use error::TaskError;
pub use future::CompletableFuture;
pub use startup::{StartupError, StartupProcess, StartupStep};
