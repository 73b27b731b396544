pub mod role;
pub mod types;

pub use role::RaftRole;
pub use types::{IndexedEntry, NodeId, PartitionId, Position};
