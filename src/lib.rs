//! Chunk replicator - keeps every chunk of a storage fleet at its configured redundancy.
//!
//! The replicator runs inside the master of a storage cluster. It watches
//! every chunk's replicas across nodes and storage media and issues jobs to
//! data nodes to restore the desired state.
//!
//! # Features
//!
//! - **Status Computation**: Per-medium and cross-medium health of regular,
//!   erasure-coded and journal chunks.
//! - **Job Scheduling**: Replication, removal, repair, balancing and seal jobs
//!   handed out on node heartbeats within per-node resource budgets.
//! - **Safety Gate**: Job issuance stops when the cluster looks unhealthy.
//! - **Properties Update**: Replication policy derived from the chunk ownership tree.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ReplicatorExecutor                       │
//! │     refresh task | properties update task | enabled check   │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     ChunkReplicator                         │
//! │   index sets | repair queue | job map | scan queues         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  StatusEngine | ChunkPlacement | JobThrottler               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ClusterState: chunks | nodes | media | chunk lists         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use chunk_replicator::config::ServiceConfig;
//!
//! #[tokio::main]
//! async fn main() -> chunk_replicator::Result<()> {
//!     let config = ServiceConfig::development();
//!     chunk_replicator::run(config).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod types;

pub mod cluster;
pub mod erasure;
pub mod observability;
pub mod ratelimit;

// Re-exports
pub use error::{ReplicatorError, Result};
pub use types::*;

use cluster::{
    ChunkReplicator, ClusterState, EnablementGate, LocalClusterHealth, LocalCommitter, Medium,
    PlacementEngine, ReplicatorExecutor,
};
use config::ServiceConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Build a replicator over `state` with the default placement engine.
pub fn build_replicator(config: &ServiceConfig, state: ClusterState) -> Arc<Mutex<ChunkReplicator>> {
    let placement = Arc::new(PlacementEngine::new(config.placement.clone()));
    Arc::new(Mutex::new(ChunkReplicator::new(
        config.replicator.clone(),
        state,
        placement,
    )))
}

/// Run a standalone replicator until Ctrl-C.
pub async fn run(config: ServiceConfig) -> Result<()> {
    config.validate()?;
    observability::init(&config.observability)?;
    info!(cell_tag = config.cell_tag, role = ?config.role, "Starting chunk replicator");

    if config.observability.metrics_enabled {
        observability::install_metrics_exporter(&config.observability)?;
    }

    let mut state = ClusterState::new(config.cell_tag);
    state.register_medium(Medium::new(DEFAULT_STORE_MEDIUM_INDEX, "default"))?;
    let replicator = build_replicator(&config, state);

    let health = Arc::new(LocalClusterHealth::new(Arc::clone(&replicator)));
    let gate = EnablementGate::new(config.role, health);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let executor = ReplicatorExecutor::new(replicator, gate, Arc::new(LocalCommitter), Some(shutdown_rx));
    let handle = tokio::spawn(executor.run());

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        let _ = shutdown_tx.send(());
    });

    handle
        .await
        .map_err(|e| ReplicatorError::Internal(format!("Replicator executor failed: {}", e)))?;
    info!("Chunk replicator shutdown complete");
    Ok(())
}
