//! Shared fixtures for broker integration tests.

use flowmill_broker::log::LogCompactor;
use flowmill_broker::raft::{
    CommittedEntryListener, ListenerId, RaftPartitionHandle, RoleChangeListener,
    SnapshotReplicationListener,
};
use flowmill_core::{IndexedEntry, PartitionId, Position, RaftRole};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type SharedRoleListener = Arc<dyn Fn(RaftRole, u64) + Send + Sync>;
type SharedEntryListener = Arc<dyn Fn(IndexedEntry) + Send + Sync>;

struct RaftInner {
    role: RaftRole,
    term: u64,
    next_listener: ListenerId,
    role_listeners: HashMap<ListenerId, SharedRoleListener>,
    entry_listeners: HashMap<ListenerId, SharedEntryListener>,
    replication_listeners: HashMap<ListenerId, Arc<dyn SnapshotReplicationListener>>,
    step_downs: u32,
    go_inactives: u32,
}

/// A scripted raft collaborator: tests drive role changes, committed
/// entries, and snapshot replication by hand and observe the control
/// requests the partition issues.
pub struct TestRaft {
    partition_id: PartitionId,
    inner: Mutex<RaftInner>,
}

impl TestRaft {
    pub fn new(partition_id: PartitionId, role: RaftRole, term: u64) -> Arc<Self> {
        Arc::new(Self {
            partition_id,
            inner: Mutex::new(RaftInner {
                role,
                term,
                next_listener: 1,
                role_listeners: HashMap::new(),
                entry_listeners: HashMap::new(),
                replication_listeners: HashMap::new(),
                step_downs: 0,
                go_inactives: 0,
            }),
        })
    }

    /// Change the role and notify every role-change listener.
    pub fn set_role(&self, role: RaftRole, term: u64) {
        let listeners: Vec<SharedRoleListener> = {
            let mut inner = self.inner.lock().unwrap();
            inner.role = role;
            inner.term = term;
            inner.role_listeners.values().cloned().collect()
        };
        for listener in listeners {
            listener(role, term);
        }
    }

    pub fn commit(&self, entry: IndexedEntry) {
        let listeners: Vec<SharedEntryListener> = {
            let inner = self.inner.lock().unwrap();
            inner.entry_listeners.values().cloned().collect()
        };
        for listener in listeners {
            listener(entry);
        }
    }

    pub fn start_snapshot_replication(&self) {
        let listeners: Vec<Arc<dyn SnapshotReplicationListener>> = {
            let inner = self.inner.lock().unwrap();
            inner.replication_listeners.values().cloned().collect()
        };
        for listener in listeners {
            listener.on_snapshot_replication_started();
        }
    }

    pub fn complete_snapshot_replication(&self, term: u64) {
        let listeners: Vec<Arc<dyn SnapshotReplicationListener>> = {
            let inner = self.inner.lock().unwrap();
            inner.replication_listeners.values().cloned().collect()
        };
        for listener in listeners {
            listener.on_snapshot_replication_completed(term);
        }
    }

    pub fn step_down_count(&self) -> u32 {
        self.inner.lock().unwrap().step_downs
    }

    pub fn go_inactive_count(&self) -> u32 {
        self.inner.lock().unwrap().go_inactives
    }

    pub fn committed_entry_listener_count(&self) -> usize {
        self.inner.lock().unwrap().entry_listeners.len()
    }

    pub fn role_change_listener_count(&self) -> usize {
        self.inner.lock().unwrap().role_listeners.len()
    }
}

impl RaftPartitionHandle for TestRaft {
    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    fn role(&self) -> RaftRole {
        self.inner.lock().unwrap().role
    }

    fn term(&self) -> u64 {
        self.inner.lock().unwrap().term
    }

    fn add_role_change_listener(&self, listener: RoleChangeListener) -> ListenerId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_listener;
        inner.next_listener += 1;
        inner.role_listeners.insert(id, Arc::from(listener));
        id
    }

    fn remove_role_change_listener(&self, id: ListenerId) {
        self.inner.lock().unwrap().role_listeners.remove(&id);
    }

    fn add_committed_entry_listener(&self, listener: CommittedEntryListener) -> ListenerId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_listener;
        inner.next_listener += 1;
        inner.entry_listeners.insert(id, Arc::from(listener));
        id
    }

    fn remove_committed_entry_listener(&self, id: ListenerId) {
        self.inner.lock().unwrap().entry_listeners.remove(&id);
    }

    fn add_snapshot_replication_listener(
        &self,
        listener: Box<dyn SnapshotReplicationListener>,
    ) -> ListenerId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_listener;
        inner.next_listener += 1;
        inner.replication_listeners.insert(id, Arc::from(listener));
        id
    }

    fn remove_snapshot_replication_listener(&self, id: ListenerId) {
        self.inner.lock().unwrap().replication_listeners.remove(&id);
    }

    fn step_down(&self) {
        self.inner.lock().unwrap().step_downs += 1;
    }

    fn go_inactive(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.go_inactives += 1;
        inner.role = RaftRole::Inactive;
    }
}

/// Records requested compaction bounds.
#[derive(Default)]
pub struct RecordingCompactor {
    bounds: Mutex<Vec<Position>>,
    calls: AtomicUsize,
}

impl RecordingCompactor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bounds(&self) -> Vec<Position> {
        self.bounds.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LogCompactor for RecordingCompactor {
    fn delete_up_to(&self, position: Position) {
        self.bounds.lock().unwrap().push(position);
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll until `predicate` holds or the timeout elapses.
pub async fn wait_until<F>(predicate: F)
where
    F: Fn() -> bool,
{
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}
