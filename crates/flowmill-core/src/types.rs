//! Shared identifiers used across the broker.

use serde::{Deserialize, Serialize};

/// Identifies one replicated shard of the workflow state. Each node hosts a
/// subset of partitions.
pub type PartitionId = u32;

/// Identifies a broker node within the cluster.
pub type NodeId = u32;

/// A 64-bit log-stream position. Two positions matter per snapshot: the
/// lowest position the state machine has consumed (`processed`) and the
/// lowest position the exporter pipeline has externalized (`exported`).
pub type Position = i64;

/// The projection of a raft log entry consumed by the snapshot subsystem.
///
/// The payload is never inspected here; snapshots reference the entry by
/// `index` and pin the leadership epoch through `term`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedEntry {
    pub index: u64,
    pub term: u64,
}

impl IndexedEntry {
    pub fn new(index: u64, term: u64) -> Self {
        Self { index, term }
    }
}
