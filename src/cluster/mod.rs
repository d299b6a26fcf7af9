//! Chunk replication controller.
//!
//! This module keeps every chunk at its configured redundancy:
//! - Status computation per chunk and medium
//! - Node work queues and heartbeat job scheduling
//! - Repair of erasure-coded chunks
//! - Properties update from the chunk ownership tree
//! - The enablement gate and the background control loop

mod chunk;
mod enablement;
mod executor;
mod job;
mod medium;
mod node;
mod placement;
mod replicator;
mod scanner;
mod scheduler;
mod state;
mod status;

pub use chunk::{
    Chunk, ChunkLayout, ChunkList, ChunkOwner, ChunkProperties, ChunkTreeRef, MediumReplicationPolicy,
    RepairQueueToken,
};
pub use enablement::{
    evaluate_primary, ClusterChunkStatistics, ClusterHealthSource, DisableReason, EnablementGate,
    EnablementInputs, EnablementVerdict, LocalClusterHealth, MasterRole,
};
pub use executor::{LocalCommitter, PropertiesCommitter, ReplicatorExecutor};
pub use job::{
    Job, JobKind, JobReport, JobState, RemoveReplicaReason, ScheduleJobsResult, UnregisterFlags,
};
pub use medium::{Medium, MediumCatalog};
pub use node::{Node, NodeResources, NodeState, RemovalQueue, ReplicationQueue, SealQueue};
pub use placement::{ChunkPlacement, PlacementEngine, PlacementStrategy, SessionKind};
pub use replicator::{
    ChunkPropertiesUpdate, ChunkReplicator, ChunkSets, RepairQueue, ScanPassStats,
    UpdateChunkPropertiesRequest,
};
pub use scanner::ChunkScanner;
pub use state::ClusterState;
pub use status::{ChunkStatistics, ChunkStatus, CrossMediumStatus, PerMediumStatistics, StatusEngine};
