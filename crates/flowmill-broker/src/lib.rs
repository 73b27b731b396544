//! Partition lifecycle and snapshot coordination.
//!
//! A broker node hosts a set of partitions. Each partition owns a raft role,
//! a runtime key-value database, a processing pipeline, and a snapshot
//! schedule; all of it driven by one actor per partition. This crate
//! implements that lifecycle:
//!
//! - the **state controller** opens, closes, and recovers the runtime
//!   database and constructs transient snapshots from it;
//! - **partition transitions** install and tear down role-dependent services
//!   (stream processor, exporter director, snapshot director) in order;
//! - the **partition actor** serializes raft role changes, disk-space
//!   signals, snapshot replication, admin requests and health edges;
//! - **broker bootstrap** brings process-wide services up in reversible
//!   steps.
//!
//! Consensus, cluster messaging, and the gateway are consumed through the
//! trait seams in [`raft`] and [`bootstrap`].

pub mod admin;
pub mod bootstrap;
pub mod builder;
pub mod config;
pub mod db;
pub mod disk;
pub mod exporter;
pub mod health;
pub mod log;
pub mod metrics;
pub mod partition;
pub mod partition_startup;
pub mod processor;
pub mod raft;
pub mod snapshot_director;
pub mod state;
pub mod steps;
pub mod transition;

pub use admin::PartitionAdminAccess;
pub use bootstrap::{BrokerStartupContext, BrokerStartupProcess, ClusterServices, EmbeddedGateway};
pub use builder::PartitionBuilder;
pub use config::{BrokerConfig, ConfigError};
pub use db::{DbFactory, FileDbFactory, StateDb};
pub use health::{FailureListener, HealthMonitor, HealthStatus};
pub use partition::Partition;
pub use raft::RaftPartitionHandle;
pub use state::StateController;
pub use transition::{PartitionTransition, TransitionContext, TransitionStep};
