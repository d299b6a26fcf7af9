//! Safety gate deciding whether the replicator may issue jobs.
//!
//! The primary computes the verdict from cluster health; secondaries mirror
//! the primary's value. Seal jobs are issued regardless of the verdict.

use super::replicator::ChunkReplicator;
use crate::config::ReplicatorConfig;
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Role of this master in a multi-cell deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterRole {
    /// Computes the enablement verdict.
    #[default]
    Primary,
    /// Mirrors the primary's verdict.
    Secondary,
}

/// Aggregate chunk counters across the cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterChunkStatistics {
    pub chunk_count: u64,
    pub lost_vital_chunk_count: u64,
}

/// Cluster health as seen by the enablement gate.
#[async_trait]
pub trait ClusterHealthSource: Send + Sync {
    /// Whether the cluster finished initializing. No verdict is computed before.
    async fn is_initialized(&self) -> Result<bool>;

    /// Operator override that forces the replicator off.
    async fn replicator_disabled_override(&self) -> Result<bool>;

    async fn online_node_count(&self) -> Result<usize>;

    async fn cluster_statistics(&self) -> Result<ClusterChunkStatistics>;

    /// The verdict computed by the primary, read by secondaries.
    async fn primary_replicator_enabled(&self) -> Result<bool>;
}

/// Inputs of the primary's verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnablementInputs {
    pub disabled_override: bool,
    pub online_node_count: usize,
    pub statistics: ClusterChunkStatistics,
}

/// Why the replicator is off.
#[derive(Debug, Clone, PartialEq)]
pub enum DisableReason {
    Override,
    TooFewOnlineNodes { online: usize, required: usize },
    TooManyLostChunksFraction { lost: u64, total: u64, max_fraction: f64 },
    TooManyLostChunks { lost: u64, max_count: u64 },
    PrimaryDisabled,
    CheckFailed(String),
}

impl fmt::Display for DisableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisableReason::Override => write!(f, "disabled by override"),
            DisableReason::TooFewOnlineNodes { online, required } => {
                write!(f, "too few online nodes: {} < {}", online, required)
            }
            DisableReason::TooManyLostChunksFraction {
                lost,
                total,
                max_fraction,
            } => write!(
                f,
                "too many lost vital chunks: {} of {} exceeds fraction {}",
                lost, total, max_fraction
            ),
            DisableReason::TooManyLostChunks { lost, max_count } => {
                write!(f, "too many lost vital chunks: {} > {}", lost, max_count)
            }
            DisableReason::PrimaryDisabled => write!(f, "disabled on primary"),
            DisableReason::CheckFailed(error) => write!(f, "enablement check failed: {}", error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnablementVerdict {
    Enabled,
    Disabled(DisableReason),
}

impl EnablementVerdict {
    pub fn is_enabled(&self) -> bool {
        matches!(self, EnablementVerdict::Enabled)
    }
}

/// The primary's verdict. Checks run in order and the first failing one wins.
pub fn evaluate_primary(config: &ReplicatorConfig, inputs: &EnablementInputs) -> EnablementVerdict {
    if inputs.disabled_override {
        return EnablementVerdict::Disabled(DisableReason::Override);
    }

    if inputs.online_node_count < config.safe_online_node_count {
        return EnablementVerdict::Disabled(DisableReason::TooFewOnlineNodes {
            online: inputs.online_node_count,
            required: config.safe_online_node_count,
        });
    }

    let ClusterChunkStatistics {
        chunk_count,
        lost_vital_chunk_count,
    } = inputs.statistics;
    if chunk_count > 0
        && lost_vital_chunk_count as f64 / chunk_count as f64 > config.safe_lost_chunk_fraction
    {
        return EnablementVerdict::Disabled(DisableReason::TooManyLostChunksFraction {
            lost: lost_vital_chunk_count,
            total: chunk_count,
            max_fraction: config.safe_lost_chunk_fraction,
        });
    }

    if lost_vital_chunk_count > config.safe_lost_chunk_count {
        return EnablementVerdict::Disabled(DisableReason::TooManyLostChunks {
            lost: lost_vital_chunk_count,
            max_count: config.safe_lost_chunk_count,
        });
    }

    EnablementVerdict::Enabled
}

/// Computes verdicts from a [`ClusterHealthSource`].
pub struct EnablementGate {
    role: MasterRole,
    source: Arc<dyn ClusterHealthSource>,
}

impl EnablementGate {
    pub fn new(role: MasterRole, source: Arc<dyn ClusterHealthSource>) -> Self {
        Self { role, source }
    }

    pub fn role(&self) -> MasterRole {
        self.role
    }

    /// Compute the current verdict. `None` while the cluster is still
    /// initializing.
    pub async fn check(&self, config: &ReplicatorConfig) -> Result<Option<EnablementVerdict>> {
        if !self.source.is_initialized().await? {
            debug!("Cluster is not initialized, skipping replicator enablement check");
            return Ok(None);
        }

        let verdict = match self.role {
            MasterRole::Primary => {
                let inputs = EnablementInputs {
                    disabled_override: self.source.replicator_disabled_override().await?,
                    online_node_count: self.source.online_node_count().await?,
                    statistics: self.source.cluster_statistics().await?,
                };
                evaluate_primary(config, &inputs)
            }
            MasterRole::Secondary => {
                if self.source.primary_replicator_enabled().await? {
                    EnablementVerdict::Enabled
                } else {
                    EnablementVerdict::Disabled(DisableReason::PrimaryDisabled)
                }
            }
        };
        Ok(Some(verdict))
    }
}

impl ChunkReplicator {
    /// Apply a verdict, logging only transitions.
    pub fn apply_enablement(&mut self, verdict: &EnablementVerdict) {
        let enabled = verdict.is_enabled();
        if self.enabled() != Some(enabled) {
            match verdict {
                EnablementVerdict::Enabled => info!("Chunk replicator enabled"),
                EnablementVerdict::Disabled(reason) => {
                    info!(reason = %reason, "Chunk replicator disabled")
                }
            }
        }
        self.set_enabled(enabled);
    }
}

/// Health source backed by the local replicator, for single-cell setups.
pub struct LocalClusterHealth {
    replicator: Arc<Mutex<ChunkReplicator>>,
    disabled_override: AtomicBool,
}

impl LocalClusterHealth {
    pub fn new(replicator: Arc<Mutex<ChunkReplicator>>) -> Self {
        Self {
            replicator,
            disabled_override: AtomicBool::new(false),
        }
    }

    pub fn set_disabled_override(&self, disabled: bool) {
        self.disabled_override.store(disabled, Ordering::Relaxed);
    }
}

#[async_trait]
impl ClusterHealthSource for LocalClusterHealth {
    async fn is_initialized(&self) -> Result<bool> {
        Ok(true)
    }

    async fn replicator_disabled_override(&self) -> Result<bool> {
        Ok(self.disabled_override.load(Ordering::Relaxed))
    }

    async fn online_node_count(&self) -> Result<usize> {
        Ok(self.replicator.lock().state().online_node_count())
    }

    async fn cluster_statistics(&self) -> Result<ClusterChunkStatistics> {
        let replicator = self.replicator.lock();
        Ok(ClusterChunkStatistics {
            chunk_count: replicator.state().chunk_count() as u64,
            lost_vital_chunk_count: replicator.lost_vital_chunks().len() as u64,
        })
    }

    async fn primary_replicator_enabled(&self) -> Result<bool> {
        Ok(self.replicator.lock().is_enabled())
    }
}
