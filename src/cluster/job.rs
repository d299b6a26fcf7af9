//! Replicator jobs and the node heartbeat boundary.

use super::node::NodeResources;
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a job asks a node to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ReplicateChunk,
    RemoveChunk,
    RepairChunk,
    SealChunk,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ReplicateChunk => "replicate",
            JobKind::RemoveChunk => "remove",
            JobKind::RepairChunk => "repair",
            JobKind::SealChunk => "seal",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job state as reported by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Aborted)
    }
}

/// One in-flight replicator action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub chunk: ChunkIdWithIndexes,
    /// Node executing the job.
    pub node: NodeId,
    /// Where new replicas go. Empty for removal and seal jobs.
    pub targets: Vec<ChunkReplica>,
    /// Resources reserved on `node` while the job runs.
    pub resource_usage: NodeResources,
    pub start_time: DateTime<Utc>,
    pub state: JobState,
    pub error: Option<String>,
}

impl Job {
    fn new(kind: JobKind, chunk: ChunkIdWithIndexes, node: NodeId, resource_usage: NodeResources) -> Self {
        Self {
            id: JobId::new(),
            kind,
            chunk,
            node,
            targets: Vec::new(),
            resource_usage,
            start_time: Utc::now(),
            state: JobState::Waiting,
            error: None,
        }
    }

    /// Copy `chunk` from `node` to `targets`.
    pub fn replicate(chunk: ChunkIdWithIndexes, node: NodeId, targets: Vec<ChunkReplica>, disk_size: u64) -> Self {
        let usage = NodeResources {
            replication_slots: 1,
            replication_data_size: disk_size,
            ..Default::default()
        };
        Self {
            targets,
            ..Self::new(JobKind::ReplicateChunk, chunk, node, usage)
        }
    }

    /// Drop the replica `chunk` from `node`.
    pub fn remove(chunk: ChunkIdWithIndexes, node: NodeId) -> Self {
        let usage = NodeResources {
            removal_slots: 1,
            ..Default::default()
        };
        Self::new(JobKind::RemoveChunk, chunk, node, usage)
    }

    /// Rebuild erased parts on `targets`, reading from the survivors.
    pub fn repair(
        chunk: ChunkIdWithIndexes,
        node: NodeId,
        targets: Vec<ChunkReplica>,
        disk_size: u64,
        memory_usage: u64,
    ) -> Self {
        let usage = NodeResources {
            repair_slots: 1,
            repair_data_size: disk_size.saturating_add(memory_usage),
            ..Default::default()
        };
        Self {
            targets,
            ..Self::new(JobKind::RepairChunk, chunk, node, usage)
        }
    }

    /// Seal the journal replica `chunk` on `node`.
    pub fn seal(chunk: ChunkIdWithIndexes, node: NodeId) -> Self {
        let usage = NodeResources {
            seal_slots: 1,
            ..Default::default()
        };
        Self::new(JobKind::SealChunk, chunk, node, usage)
    }

    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    /// Time since the job was issued.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.start_time
    }
}

/// A job as listed in a node heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub state: JobState,
    pub start_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl JobReport {
    pub fn new(job_id: JobId, state: JobState) -> Self {
        Self {
            job_id,
            state,
            start_time: None,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Heartbeat response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleJobsResult {
    pub jobs_to_start: Vec<Job>,
    pub jobs_to_abort: Vec<JobId>,
    pub jobs_to_remove: Vec<JobId>,
}

impl ScheduleJobsResult {
    pub fn is_empty(&self) -> bool {
        self.jobs_to_start.is_empty() && self.jobs_to_abort.is_empty() && self.jobs_to_remove.is_empty()
    }
}

/// How a job is torn down when it leaves the job map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnregisterFlags {
    pub unregister_from_node: bool,
    pub schedule_chunk_refresh: bool,
}

impl UnregisterFlags {
    pub const ALL: UnregisterFlags = UnregisterFlags {
        unregister_from_node: true,
        schedule_chunk_refresh: true,
    };

    /// Leave the chunk alone: it is about to be destroyed.
    pub const NODE_ONLY: UnregisterFlags = UnregisterFlags {
        unregister_from_node: true,
        schedule_chunk_refresh: false,
    };

    /// The node's job set is being discarded wholesale.
    pub const REFRESH_ONLY: UnregisterFlags = UnregisterFlags {
        unregister_from_node: false,
        schedule_chunk_refresh: true,
    };
}

impl Default for UnregisterFlags {
    fn default() -> Self {
        Self::ALL
    }
}

/// Why a replica disappeared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoveReplicaReason {
    /// The node reported it gone.
    NodeReported,
    /// The node went away.
    NodeDisposed,
    /// The chunk itself was destroyed.
    ChunkDestroyed,
}
