//! Configuration for the chunk replicator.

use crate::cluster::{MasterRole, PlacementStrategy};
use crate::error::{ReplicatorError, Result};
use crate::types::CellTag;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration of a replicator instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Tag of the master cell this replicator runs in.
    pub cell_tag: CellTag,
    /// Whether this cell is the primary or a secondary master.
    pub role: MasterRole,
    /// Replicator tuning.
    pub replicator: ReplicatorConfig,
    /// Default placement engine settings.
    pub placement: PlacementConfig,
    /// Observability configuration.
    pub observability: ObservabilityConfig,
}

impl ServiceConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReplicatorError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            ReplicatorError::Config(format!("Failed to parse config: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        self.replicator.validate()?;
        self.placement.validate()?;
        Ok(())
    }

    /// Create a configuration suitable for a single-process local cluster.
    pub fn development() -> Self {
        Self {
            cell_tag: 1,
            role: MasterRole::Primary,
            replicator: ReplicatorConfig::development(),
            placement: PlacementConfig::default(),
            observability: ObservabilityConfig {
                metrics_enabled: false,
                log_level: "debug".to_string(),
                ..Default::default()
            },
        }
    }
}

/// Tuning knobs of the replication controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicatorConfig {
    /// How long a chunk must sit in the refresh queue before it is eligible.
    #[serde(with = "humantime_serde")]
    pub chunk_refresh_delay: Duration,
    /// Period of the refresh task.
    #[serde(with = "humantime_serde")]
    pub chunk_refresh_period: Duration,
    /// Maximum chunks dequeued by one refresh pass.
    pub max_chunks_per_refresh: usize,
    /// Wall-clock budget of one refresh pass.
    #[serde(with = "humantime_serde")]
    pub max_time_per_refresh: Duration,
    /// Period of the properties update task.
    #[serde(with = "humantime_serde")]
    pub chunk_properties_update_period: Duration,
    /// Maximum chunks dequeued by one properties update pass.
    pub max_chunks_per_properties_update: usize,
    /// Wall-clock budget of one properties update pass.
    #[serde(with = "humantime_serde")]
    pub max_time_per_properties_update: Duration,
    /// Period of the enablement check.
    #[serde(with = "humantime_serde")]
    pub replicator_enabled_check_period: Duration,
    /// Running or waiting jobs older than this are aborted.
    #[serde(with = "humantime_serde")]
    pub job_timeout: Duration,
    /// Nodes filled below this never act as balancing sources.
    pub min_balancing_fill_factor: f64,
    /// Required fill factor gap between balancing source and target.
    pub min_balancing_fill_factor_diff: f64,
    /// The replicator is disabled while fewer nodes are online.
    pub safe_online_node_count: usize,
    /// The replicator is disabled while a larger share of chunks is lost.
    pub safe_lost_chunk_fraction: f64,
    /// The replicator is disabled while more vital chunks are lost.
    pub safe_lost_chunk_count: u64,
    /// Memory reserved on a node for each repair job.
    pub repair_job_memory_usage: u64,
    /// Cluster-wide job issuance limit.
    pub job_throttler: ThrottlerConfig,
    /// Number of replication priority buckets per node.
    pub replication_priority_count: usize,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            chunk_refresh_delay: Duration::from_secs(30),
            chunk_refresh_period: Duration::from_millis(100),
            max_chunks_per_refresh: 10_000,
            max_time_per_refresh: Duration::from_millis(80),
            chunk_properties_update_period: Duration::from_secs(1),
            max_chunks_per_properties_update: 10_000,
            max_time_per_properties_update: Duration::from_millis(80),
            replicator_enabled_check_period: Duration::from_secs(1),
            job_timeout: Duration::from_secs(5 * 60),
            min_balancing_fill_factor: 0.1,
            min_balancing_fill_factor_diff: 0.2,
            safe_online_node_count: 0,
            safe_lost_chunk_fraction: 0.5,
            safe_lost_chunk_count: 1000,
            repair_job_memory_usage: 256 * 1024 * 1024,
            job_throttler: ThrottlerConfig::default(),
            replication_priority_count: 3,
        }
    }
}

impl ReplicatorConfig {
    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("replicator.chunk_refresh_period", self.chunk_refresh_period),
            (
                "replicator.chunk_properties_update_period",
                self.chunk_properties_update_period,
            ),
            (
                "replicator.replicator_enabled_check_period",
                self.replicator_enabled_check_period,
            ),
            ("replicator.job_throttler.period", self.job_throttler.period),
        ];
        for (field, period) in periods {
            if period.is_zero() {
                return Err(ReplicatorError::InvalidConfig {
                    field: field.to_string(),
                    reason: "Period must be non-zero".to_string(),
                });
            }
        }

        if !(0.0..=1.0).contains(&self.safe_lost_chunk_fraction) {
            return Err(ReplicatorError::InvalidConfig {
                field: "replicator.safe_lost_chunk_fraction".to_string(),
                reason: format!(
                    "Fraction must be within [0, 1], got {}",
                    self.safe_lost_chunk_fraction
                ),
            });
        }

        if self.min_balancing_fill_factor < 0.0 || self.min_balancing_fill_factor_diff < 0.0 {
            return Err(ReplicatorError::InvalidConfig {
                field: "replicator.min_balancing_fill_factor".to_string(),
                reason: "Fill factor settings must be non-negative".to_string(),
            });
        }

        if self.replication_priority_count == 0 {
            return Err(ReplicatorError::InvalidConfig {
                field: "replicator.replication_priority_count".to_string(),
                reason: "At least one priority is required".to_string(),
            });
        }

        Ok(())
    }

    /// Short delays for local clusters and tests.
    pub fn development() -> Self {
        Self {
            chunk_refresh_delay: Duration::from_millis(100),
            chunk_refresh_period: Duration::from_millis(50),
            chunk_properties_update_period: Duration::from_millis(200),
            replicator_enabled_check_period: Duration::from_millis(200),
            job_timeout: Duration::from_secs(30),
            ..Default::default()
        }
    }

    /// Builder-style override of the refresh delay.
    pub fn with_chunk_refresh_delay(mut self, delay: Duration) -> Self {
        self.chunk_refresh_delay = delay;
        self
    }

    /// Builder-style override of the safe online node count.
    pub fn with_safe_online_node_count(mut self, count: usize) -> Self {
        self.safe_online_node_count = count;
        self
    }
}

/// Job throttler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlerConfig {
    /// Jobs allowed per period. `None` disables throttling.
    pub limit: Option<u64>,
    /// Refill period.
    #[serde(with = "humantime_serde")]
    pub period: Duration,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            limit: Some(10_000),
            period: Duration::from_secs(1),
        }
    }
}

impl ThrottlerConfig {
    /// Throttler that never runs into overdraft.
    pub fn unlimited() -> Self {
        Self {
            limit: None,
            ..Default::default()
        }
    }
}

/// Default placement engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// How candidate nodes are ordered.
    pub strategy: PlacementStrategy,
    /// Upper bound on replicas of one chunk in one rack, per medium.
    pub max_replicas_per_rack: usize,
    /// Nodes above this fill factor do not receive new replicas.
    pub max_fill_factor: f64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            strategy: PlacementStrategy::LeastLoaded,
            max_replicas_per_rack: 64,
            max_fill_factor: 0.95,
        }
    }
}

impl PlacementConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_replicas_per_rack == 0 {
            return Err(ReplicatorError::InvalidConfig {
                field: "placement.max_replicas_per_rack".to_string(),
                reason: "Must allow at least one replica per rack".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.max_fill_factor) {
            return Err(ReplicatorError::InvalidConfig {
                field: "placement.max_fill_factor".to_string(),
                reason: format!("Fill factor must be within [0, 1], got {}", self.max_fill_factor),
            });
        }
        Ok(())
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics.
    pub metrics_enabled: bool,
    /// Metrics bind address.
    pub metrics_addr: SocketAddr,
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration written as `"250ms"`, `"30s"`, `"5m"` or `"1h"`.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis();
        let text = if millis % 1000 != 0 || millis == 0 {
            format!("{}ms", millis)
        } else if millis % 60_000 != 0 {
            format!("{}s", millis / 1000)
        } else {
            format!("{}m", millis / 60_000)
        };
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (value, scale_ms) = if let Some(v) = s.strip_suffix("ms") {
            (v, 1)
        } else if let Some(v) = s.strip_suffix('s') {
            (v, 1000)
        } else if let Some(v) = s.strip_suffix('m') {
            (v, 60_000)
        } else if let Some(v) = s.strip_suffix('h') {
            (v, 3_600_000)
        } else {
            (s, 1)
        };
        value
            .trim()
            .parse::<u64>()
            .map(|v| Duration::from_millis(v * scale_ms))
            .map_err(|e| format!("invalid duration {:?}: {}", s, e))
    }
}
