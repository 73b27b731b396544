//! Raft replication roles as observed by the partition lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The replication role of a node for a given partition.
///
/// Only `Leader`, `Follower` and `Inactive` carry service semantics for the
/// partition lifecycle; the remaining roles install follower services (an
/// intermediate role still replicates and must be able to serve a later
/// promotion).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Inactive,
    Passive,
    Promotable,
    Candidate,
    Follower,
    Leader,
}

impl RaftRole {
    /// Whether the role participates in replication at all.
    pub fn is_active(&self) -> bool {
        !matches!(self, RaftRole::Inactive)
    }

    /// Whether the partition installs leader services for this role.
    pub fn is_leader(&self) -> bool {
        matches!(self, RaftRole::Leader)
    }
}

impl fmt::Display for RaftRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RaftRole::Inactive => "inactive",
            RaftRole::Passive => "passive",
            RaftRole::Promotable => "promotable",
            RaftRole::Candidate => "candidate",
            RaftRole::Follower => "follower",
            RaftRole::Leader => "leader",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_inactive_is_not_active() {
        assert!(!RaftRole::Inactive.is_active());
        for role in [
            RaftRole::Passive,
            RaftRole::Promotable,
            RaftRole::Candidate,
            RaftRole::Follower,
            RaftRole::Leader,
        ] {
            assert!(role.is_active(), "{role} should be active");
        }
    }

    #[test]
    fn test_display_names() {
        assert_eq!(RaftRole::Leader.to_string(), "leader");
        assert_eq!(RaftRole::Inactive.to_string(), "inactive");
    }
}
