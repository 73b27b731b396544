//! The consumed surface of the raft collaborator.
//!
//! The consensus implementation is external; the partition lifecycle only
//! observes role changes, committed entries, and snapshot replication, and
//! issues `step_down` / `go_inactive` control requests. Listener callbacks
//! may fire from any thread; consumers re-submit onto their own actor before
//! touching state.

use flowmill_core::{IndexedEntry, PartitionId, RaftRole};

/// Identifies a registered listener so it can be removed again.
pub type ListenerId = u64;

pub type RoleChangeListener = Box<dyn Fn(RaftRole, u64) + Send + Sync>;
pub type CommittedEntryListener = Box<dyn Fn(IndexedEntry) + Send + Sync>;

/// Observes replication of a snapshot from the leader to this follower.
pub trait SnapshotReplicationListener: Send + Sync {
    fn on_snapshot_replication_started(&self);

    fn on_snapshot_replication_completed(&self, term: u64);
}

pub trait RaftPartitionHandle: Send + Sync {
    fn partition_id(&self) -> PartitionId;

    fn role(&self) -> RaftRole;

    fn term(&self) -> u64;

    fn add_role_change_listener(&self, listener: RoleChangeListener) -> ListenerId;

    fn remove_role_change_listener(&self, id: ListenerId);

    fn add_committed_entry_listener(&self, listener: CommittedEntryListener) -> ListenerId;

    fn remove_committed_entry_listener(&self, id: ListenerId);

    fn add_snapshot_replication_listener(
        &self,
        listener: Box<dyn SnapshotReplicationListener>,
    ) -> ListenerId;

    fn remove_snapshot_replication_listener(&self, id: ListenerId);

    /// Ask the raft server to relinquish leadership.
    fn step_down(&self);

    /// Ask the raft server to leave replication entirely.
    fn go_inactive(&self);
}
