//! File-based snapshot store.
//!
//! A snapshot is a directory of database files plus a `CHECKSUM` file, named
//! so that lexicographic name order equals logical recency. Snapshots are
//! built in a `pending/` scratch area and become visible atomically through a
//! rename into `snapshots/`, so readers observe either the old or the new
//! snapshot, never a partial one.
//!
//! ## Lifecycle
//!
//! ```text
//! new_transient() → pending/<name>/   (scratch, invisible)
//!        take()   → database files + CHECKSUM written
//!      persist()  → snapshots/<name>/ (atomic rename, prior snapshots deleted)
//!       abort()   → scratch deleted
//! ```
//!
//! Partial pending directories left behind by a crash are purged the next
//! time the store opens.

pub mod checksum;
pub mod error;
pub mod metadata;
pub mod store;
pub mod transient;

pub use error::{Result, SnapshotError};
pub use metadata::SnapshotMetadata;
pub use store::{PersistedSnapshot, SnapshotStore};
pub use transient::TransientSnapshot;
