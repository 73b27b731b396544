//! Broker configuration.
//!
//! Loaded from TOML. Unknown keys are rejected at startup rather than
//! silently ignored, so a typo in an option name fails fast.

use flowmill_core::NodeId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BrokerConfig {
    /// This node's id within the cluster.
    pub node_id: NodeId,

    /// Root directory for partition state (runtime databases and snapshot
    /// stores live underneath it).
    pub data_dir: PathBuf,

    /// Number of partitions hosted by the cluster.
    pub partition_count: u32,

    /// How often each partition attempts a snapshot (default: 15 minutes).
    #[serde(with = "duration_ms")]
    pub snapshot_period: Duration,

    /// Whether the disk usage monitor runs (default: true).
    pub disk_usage_monitoring_enabled: bool,

    /// Fraction of disk capacity above which processing pauses
    /// (default: 0.97).
    pub disk_usage_replication_watermark: f64,

    /// Disk budget for the data directory, in bytes.
    pub disk_capacity_bytes: u64,

    /// How often the disk usage monitor probes (default: 1s).
    #[serde(with = "duration_ms")]
    pub disk_monitoring_interval: Duration,

    /// Bound on waiting for cluster messaging start/stop (default: 15s).
    #[serde(with = "duration_ms")]
    pub cluster_request_timeout: Duration,

    /// Whether the embedded gateway starts with the broker (default: false).
    pub gateway_enabled: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            data_dir: PathBuf::from("./data"),
            partition_count: 1,
            snapshot_period: Duration::from_secs(15 * 60),
            disk_usage_monitoring_enabled: true,
            disk_usage_replication_watermark: 0.97,
            disk_capacity_bytes: 64 * 1024 * 1024 * 1024,
            disk_monitoring_interval: Duration::from_secs(1),
            cluster_request_timeout: Duration::from_secs(15),
            gateway_enabled: false,
        }
    }
}

impl BrokerConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: BrokerConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.disk_usage_replication_watermark) {
            return Err(ConfigError::Invalid(format!(
                "disk_usage_replication_watermark must be a fraction in [0, 1], got {}",
                self.disk_usage_replication_watermark
            )));
        }
        if self.partition_count == 0 {
            return Err(ConfigError::Invalid(
                "partition_count must be at least 1".to_string(),
            ));
        }
        if self.snapshot_period.is_zero() {
            return Err(ConfigError::Invalid(
                "snapshot_period must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
