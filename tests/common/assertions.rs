// Replicator-specific assertions for integration tests

use chunk_replicator::cluster::{ChunkReplicator, ChunkStatus, JobKind, ScheduleJobsResult};
use chunk_replicator::types::*;

fn status_on(replicator: &ChunkReplicator, chunk_id: &ChunkId, medium: MediumIndex) -> ChunkStatus {
    match replicator.compute_chunk_statuses(chunk_id) {
        Ok(statuses) => statuses.get(&medium).copied().unwrap_or(ChunkStatus::NONE),
        Err(e) => panic!("status of chunk {} could not be computed: {}", chunk_id, e),
    }
}

/// Status of `chunk_id` on `medium` must contain every flag in `expected`.
#[track_caller]
pub fn assert_medium_status(
    replicator: &ChunkReplicator,
    chunk_id: &ChunkId,
    medium: MediumIndex,
    expected: ChunkStatus,
) {
    let actual = status_on(replicator, chunk_id, medium);
    assert!(
        actual.has(expected),
        "chunk {} on medium {}: expected {:?}, got {:?}",
        chunk_id,
        medium,
        expected,
        actual
    );
}

/// Chunk must be healthy on `medium`: no flags besides `SEALED`.
#[track_caller]
pub fn assert_healthy(replicator: &ChunkReplicator, chunk_id: &ChunkId, medium: MediumIndex) {
    let mut status = status_on(replicator, chunk_id, medium);
    status.remove(ChunkStatus::SEALED);
    assert!(
        status.is_none(),
        "chunk {} is not healthy on medium {}: {:?}",
        chunk_id,
        medium,
        status
    );
}

/// Node must hold no jobs and no queued work.
#[track_caller]
pub fn assert_node_idle(replicator: &ChunkReplicator, node_id: NodeId) {
    let node = replicator
        .state()
        .node(&node_id)
        .unwrap_or_else(|| panic!("node {} not found", node_id));
    assert!(
        node.is_idle(),
        "node {} is busy: jobs={} replication={} removal={} seal={}",
        node_id,
        node.jobs().len(),
        node.replication_queue_len(),
        node.removal_queue().len(),
        node.seal_queue().len()
    );
}

/// Heartbeat response must start exactly `count` jobs of `kind`.
#[track_caller]
pub fn assert_jobs_started(result: &ScheduleJobsResult, kind: JobKind, count: usize) {
    let started = result.jobs_to_start.iter().filter(|job| job.kind == kind).count();
    assert_eq!(started, count, "wrong number of {} jobs started", kind);
}
