//! The chunk replicator.
//!
//! [`ChunkReplicator`] is the single owner of replication state: the job
//! map, the global repair queue, the status index sets and the two scan
//! queues. Every mutation goes through its methods, which are expected to be
//! called from one logical thread of control (see
//! [`ReplicatorExecutor`](super::ReplicatorExecutor)).
//!
//! A refresh recomputes a chunk's [`ChunkStatistics`] and turns them into
//! per-node work: replication, removal and seal queue entries plus entries in
//! the global repair queue. The scheduler then drains that work into jobs
//! when nodes heartbeat.

use super::chunk::{Chunk, ChunkProperties, ChunkTreeRef, RepairQueueToken};
use super::job::{Job, RemoveReplicaReason, UnregisterFlags};
use super::node::NodeState;
use super::placement::{ChunkPlacement, SessionKind};
use super::scanner::ChunkScanner;
use super::state::ClusterState;
use super::status::{ChunkStatistics, ChunkStatus, CrossMediumStatus, StatusEngine};
use crate::config::ReplicatorConfig;
use crate::erasure::ErasureCodec;
use crate::error::{invariant_violation, ReplicatorError, Result};
use crate::ratelimit::JobThrottler;
use crate::types::*;
use metrics::gauge;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// FIFO of erasure chunks awaiting repair, one entry per (chunk, medium).
///
/// Entries are addressed by a [`RepairQueueToken`] kept on the chunk, so
/// removal and move-to-front are lookups rather than scans.
#[derive(Debug, Default)]
pub struct RepairQueue {
    entries: BTreeMap<RepairQueueToken, ChunkIdWithIndexes>,
    front: RepairQueueToken,
    back: RepairQueueToken,
}

impl RepairQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, entry: ChunkIdWithIndexes) -> RepairQueueToken {
        let token = self.back;
        self.back += 1;
        self.entries.insert(token, entry);
        token
    }

    pub fn push_front(&mut self, entry: ChunkIdWithIndexes) -> RepairQueueToken {
        self.front -= 1;
        let token = self.front;
        self.entries.insert(token, entry);
        token
    }

    pub fn remove(&mut self, token: RepairQueueToken) -> Option<ChunkIdWithIndexes> {
        self.entries.remove(&token)
    }

    /// First entry strictly after `cursor`, or the head when `cursor` is `None`.
    pub fn next_after(
        &self,
        cursor: Option<RepairQueueToken>,
    ) -> Option<(RepairQueueToken, ChunkIdWithIndexes)> {
        let next = match cursor {
            None => self.entries.iter().next(),
            Some(token) => self.entries.range((Excluded(token), Unbounded)).next(),
        };
        next.map(|(token, entry)| (*token, *entry))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChunkIdWithIndexes> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Index sets of chunks by status, rebuilt chunk by chunk on refresh.
#[derive(Debug, Default)]
pub struct ChunkSets {
    pub lost: HashSet<ChunkId>,
    pub lost_vital: HashSet<ChunkId>,
    pub overreplicated: HashSet<ChunkId>,
    pub underreplicated: HashSet<ChunkId>,
    pub unsafely_placed: HashSet<ChunkId>,
    pub quorum_missing: HashSet<ChunkId>,
    pub data_missing: HashSet<ChunkId>,
    pub parity_missing: HashSet<ChunkId>,
    pub precarious: HashSet<ChunkId>,
    pub precarious_vital: HashSet<ChunkId>,
}

impl ChunkSets {
    fn all_mut(&mut self) -> [&mut HashSet<ChunkId>; 10] {
        [
            &mut self.lost,
            &mut self.lost_vital,
            &mut self.overreplicated,
            &mut self.underreplicated,
            &mut self.unsafely_placed,
            &mut self.quorum_missing,
            &mut self.data_missing,
            &mut self.parity_missing,
            &mut self.precarious,
            &mut self.precarious_vital,
        ]
    }

    /// Drop `chunk_id` from every set.
    pub fn reset(&mut self, chunk_id: &ChunkId) {
        for set in self.all_mut() {
            set.remove(chunk_id);
        }
    }

    pub fn clear(&mut self) {
        for set in self.all_mut() {
            set.clear();
        }
    }

    pub fn contains_anywhere(&self, chunk_id: &ChunkId) -> bool {
        [
            &self.lost,
            &self.lost_vital,
            &self.overreplicated,
            &self.underreplicated,
            &self.unsafely_placed,
            &self.quorum_missing,
            &self.data_missing,
            &self.parity_missing,
            &self.precarious,
            &self.precarious_vital,
        ]
        .iter()
        .any(|set| set.contains(chunk_id))
    }
}

/// Inserts into a set the chunk was just reset from; a duplicate means the
/// reset was skipped.
fn insert_fresh(set: &mut HashSet<ChunkId>, chunk_id: ChunkId, set_name: &str) {
    crate::invariant!(
        set.insert(chunk_id),
        "chunk {} is already in the {} set",
        chunk_id,
        set_name
    );
}

/// New properties computed for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPropertiesUpdate {
    pub chunk_id: ChunkId,
    pub properties: ChunkProperties,
}

/// Batch of property changes committed as one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateChunkPropertiesRequest {
    pub cell_tag: CellTag,
    pub updates: Vec<ChunkPropertiesUpdate>,
}

impl UpdateChunkPropertiesRequest {
    pub fn new(cell_tag: CellTag) -> Self {
        Self {
            cell_tag,
            updates: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Counters of one bounded scan pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanPassStats {
    /// Chunks dequeued.
    pub total: usize,
    /// Dequeued chunks that were still alive.
    pub alive: usize,
}

/// Keeps every chunk at its configured redundancy.
pub struct ChunkReplicator {
    pub(super) config: ReplicatorConfig,
    pub(super) state: ClusterState,
    pub(super) placement: Arc<dyn ChunkPlacement>,
    pub(super) refresh_scanner: ChunkScanner,
    pub(super) properties_update_scanner: ChunkScanner,
    pub(super) throttler: JobThrottler,
    /// `None` until the first enablement check completes.
    enabled: Option<bool>,
    pub(super) jobs: HashMap<JobId, Job>,
    pub(super) repair_queue: RepairQueue,
    sets: ChunkSets,
}

impl ChunkReplicator {
    pub fn new(
        config: ReplicatorConfig,
        state: ClusterState,
        placement: Arc<dyn ChunkPlacement>,
    ) -> Self {
        let throttler = JobThrottler::from_config(&config.job_throttler);
        Self {
            config,
            state,
            placement,
            refresh_scanner: ChunkScanner::new(),
            properties_update_scanner: ChunkScanner::new(),
            throttler,
            enabled: None,
            jobs: HashMap::new(),
            repair_queue: RepairQueue::new(),
            sets: ChunkSets::default(),
        }
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    pub fn state(&self) -> &ClusterState {
        &self.state
    }

    /// Direct access to the cluster state. Replica and node changes should go
    /// through the replicator hooks so queues stay consistent.
    pub fn state_mut(&mut self) -> &mut ClusterState {
        &mut self.state
    }

    pub fn placement(&self) -> &dyn ChunkPlacement {
        self.placement.as_ref()
    }

    /// Whether replication, repair, removal and balancing jobs may be issued.
    /// Seal jobs ignore this.
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }

    /// The last enablement verdict, `None` before the first check.
    pub fn enabled(&self) -> Option<bool> {
        self.enabled
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = Some(enabled);
        gauge!("replicator_enabled").set(if enabled { 1.0 } else { 0.0 });
    }

    pub fn compute_statistics(&self, chunk: &Chunk) -> ChunkStatistics {
        StatusEngine::new(&self.state, self.placement.as_ref()).compute(chunk)
    }

    /// Per-medium status of a chunk on every store medium.
    pub fn compute_chunk_statuses(
        &self,
        chunk_id: &ChunkId,
    ) -> Result<BTreeMap<MediumIndex, ChunkStatus>> {
        let chunk = self
            .state
            .chunk(chunk_id)
            .ok_or_else(|| ReplicatorError::ChunkNotFound(chunk_id.to_string()))?;
        let statistics = self.compute_statistics(chunk);
        Ok(self
            .state
            .media()
            .store_media()
            .map(|medium| (medium.index, statistics.medium(medium.index).status))
            .collect())
    }

    /// Queue every chunk of this cell for refresh and properties update.
    /// Called when the replicator takes over.
    pub fn start(&mut self) {
        let chunks: Vec<ChunkId> = self
            .state
            .chunks()
            .map(|chunk| chunk.id())
            .filter(|id| !self.state.is_foreign(id))
            .collect();
        self.refresh_scanner.start(chunks.iter().copied());
        self.properties_update_scanner.start(chunks);
        info!(
            chunk_count = self.refresh_scanner.queue_size(),
            "Chunk replicator started"
        );
    }

    /// Drop all jobs and queued work, e.g. on leadership loss.
    pub fn stop(&mut self) {
        for node in self.state.nodes_mut() {
            node.jobs_mut().clear();
            node.set_resource_usage(Default::default());
        }
        let job_chunks: Vec<ChunkId> = self.jobs.values().map(|job| job.chunk.id).collect();
        for chunk_id in job_chunks {
            if let Some(chunk) = self.state.chunk_mut(&chunk_id) {
                chunk.set_job(None);
            }
        }
        self.jobs.clear();

        let repair_entries: Vec<ChunkIdWithIndexes> = self.repair_queue.iter().copied().collect();
        for entry in repair_entries {
            if let Some(chunk) = self.state.chunk_mut(&entry.id) {
                chunk.set_repair_queue_token(entry.medium, None);
            }
        }
        self.repair_queue.clear();

        self.refresh_scanner.clear();
        self.properties_update_scanner.clear();
        self.enabled = None;
        info!("Chunk replicator stopped");
    }

    // Jobs

    pub fn find_job(&self, job_id: &JobId) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Record a freshly created job: job map, the node's job set, the chunk's
    /// job pointer, the node's resource usage and one throttler unit.
    pub fn register_job(&mut self, job: Job) {
        let job_id = job.id;
        crate::invariant!(
            !self.jobs.contains_key(&job_id),
            "job {} is already registered",
            job_id
        );

        let Some(node) = self.state.node_mut(&job.node) else {
            invariant_violation(format!("job {} targets unknown node {}", job_id, job.node));
        };
        crate::invariant!(
            node.jobs_mut().insert(job_id),
            "job {} is already registered on node {}",
            job_id,
            job.node
        );
        *node.resource_usage_mut() += job.resource_usage;
        let address = node.address().to_string();

        if let Some(chunk) = self.state.chunk_mut(&job.chunk.id) {
            chunk.set_job(Some(job_id));
        }
        self.throttler.acquire(1);

        debug!(
            job_id = %job_id,
            job_kind = %job.kind,
            chunk_id = %job.chunk,
            address = %address,
            targets = ?job.targets,
            "Job scheduled"
        );
        self.jobs.insert(job_id, job);
    }

    /// Remove a job from the job map. Returns `None` if it was not registered.
    pub fn unregister_job(&mut self, job_id: &JobId, flags: UnregisterFlags) -> Option<Job> {
        let job = self.jobs.remove(job_id)?;

        if let Some(node) = self.state.node_mut(&job.node) {
            if flags.unregister_from_node {
                node.jobs_mut().remove(job_id);
            }
            node.resource_usage_mut().release(&job.resource_usage);
        }

        let chunk_id = job.chunk.id;
        let chunk_alive = match self.state.chunk_mut(&chunk_id) {
            Some(chunk) => {
                if chunk.job() == Some(*job_id) {
                    chunk.set_job(None);
                }
                true
            }
            None => false,
        };
        if chunk_alive && flags.schedule_chunk_refresh {
            self.schedule_chunk_refresh(&chunk_id);
        }
        Some(job)
    }

    fn cancel_chunk_jobs(&mut self, chunk_id: &ChunkId) {
        let Some(job_id) = self.state.chunk(chunk_id).and_then(|chunk| chunk.job()) else {
            return;
        };
        debug!(job_id = %job_id, chunk_id = %chunk_id, "Job canceled");
        self.unregister_job(&job_id, UnregisterFlags::NODE_ONLY);
    }

    // Job creation. Each returns whether the queue entry is done with, plus
    // the job to start if one was built.

    /// Replicate `replica` from `source` to `target_medium`.
    ///
    /// Returns `false` when placement found fewer targets than needed; any
    /// job built for the targets that were found is still returned.
    pub fn create_replication_job(
        &self,
        source: NodeId,
        replica: &ChunkIdWithIndexes,
        target_medium: MediumIndex,
    ) -> (bool, Option<Job>) {
        let Some(chunk) = self.state.chunk(&replica.id) else {
            return (true, None);
        };
        if self.refresh_scanner.contains(&replica.id) || chunk.is_job_scheduled() {
            return (true, None);
        }

        let replication_factor = chunk.replication_factor(target_medium);
        let statistics = self.compute_statistics(chunk);
        let medium_statistics = statistics.medium(target_medium);
        let replica_count = medium_statistics.replica_count[replica.replica_index];

        if statistics.status.has(CrossMediumStatus::LOST) || replica_count > replication_factor {
            return (true, None);
        }

        let mut replicas_needed =
            if medium_statistics.status.has(ChunkStatus::UNDERREPLICATED) {
                (replication_factor - replica_count) as usize
            } else if medium_statistics.status.has(ChunkStatus::UNSAFELY_PLACED) {
                1
            } else {
                return (true, None);
            };
        // Journal replication does not fan out.
        if chunk.is_journal() {
            replicas_needed = 1;
        }
        if replicas_needed == 0 {
            return (true, None);
        }

        let targets = self.placement.allocate_write_targets(
            &self.state,
            target_medium,
            chunk,
            replicas_needed,
            1,
            None,
            SessionKind::Replication,
        );
        if targets.is_empty() {
            return (false, None);
        }

        let satisfied = targets.len() == replicas_needed;
        let targets = targets
            .into_iter()
            .map(|node| ChunkReplica::new(node, replica.replica_index, target_medium))
            .collect();
        let job = Job::replicate(*replica, source, targets, chunk.disk_size());
        (satisfied, Some(job))
    }

    /// Move `replica` off `source` to a node filled below `max_fill_factor`.
    pub fn create_balancing_job(
        &self,
        source: NodeId,
        replica: &ChunkIdWithIndexes,
        max_fill_factor: f64,
    ) -> (bool, Option<Job>) {
        let Some(chunk) = self.state.chunk(&replica.id) else {
            return (true, None);
        };
        if self.refresh_scanner.contains(&replica.id) || chunk.is_job_scheduled() {
            return (true, None);
        }

        let Some(target) = self.placement.allocate_balancing_target(
            &self.state,
            replica.medium,
            chunk,
            max_fill_factor,
        ) else {
            return (false, None);
        };

        let targets = vec![ChunkReplica::new(target, replica.replica_index, replica.medium)];
        let job = Job::replicate(*replica, source, targets, chunk.disk_size());
        (true, Some(job))
    }

    /// Remove `replica` from `node`. Dead chunks may collect several removal
    /// jobs since their replicas must go regardless.
    pub fn create_removal_job(&self, node: NodeId, replica: &ChunkIdWithIndexes) -> (bool, Option<Job>) {
        if let Some(chunk) = self.state.chunk(&replica.id) {
            if self.refresh_scanner.contains(&replica.id) || chunk.is_job_scheduled() {
                return (true, None);
            }
        }
        (true, Some(Job::remove(*replica, node)))
    }

    /// Rebuild the parts of an erasure chunk erased on `entry.medium`,
    /// executed by `node`.
    pub fn create_repair_job(&self, node: NodeId, entry: &ChunkIdWithIndexes) -> (bool, Option<Job>) {
        crate::invariant!(
            entry.replica_index == GENERIC_REPLICA_INDEX,
            "repair queue entry {} carries a part index",
            entry
        );
        let Some(chunk) = self.state.chunk(&entry.id) else {
            return (true, None);
        };
        let Some(codec) = chunk.erasure_codec() else {
            invariant_violation(format!("repair requested for non-erasure chunk {}", entry.id));
        };
        if self.refresh_scanner.contains(&entry.id) || chunk.is_job_scheduled() {
            return (true, None);
        }

        let statistics = self.compute_statistics(chunk);
        let medium_statistics = statistics.medium(entry.medium);
        let erased: Vec<usize> = (0..codec.total_part_count())
            .filter(|&part| {
                medium_statistics.replica_count[part] == 0
                    && medium_statistics.decommissioned_replica_count[part] == 0
            })
            .collect();
        if erased.is_empty() {
            return (true, None);
        }

        let targets = self.placement.allocate_write_targets(
            &self.state,
            entry.medium,
            chunk,
            erased.len(),
            erased.len(),
            None,
            SessionKind::Repair,
        );
        if targets.is_empty() {
            return (false, None);
        }
        crate::invariant!(
            targets.len() == erased.len(),
            "placement returned {} repair targets for {} erased parts",
            targets.len(),
            erased.len()
        );

        let targets = targets
            .into_iter()
            .zip(erased)
            .map(|(target, part)| ChunkReplica::new(target, part, entry.medium))
            .collect();
        let job = Job::repair(
            *entry,
            node,
            targets,
            chunk.disk_size(),
            self.config.repair_job_memory_usage,
        );
        (true, Some(job))
    }

    /// Seal the journal chunk `entry` on `node`. Runs even while a refresh is
    /// pending.
    pub fn create_seal_job(&self, node: NodeId, entry: &ChunkIdWithIndexes) -> (bool, Option<Job>) {
        crate::invariant!(
            entry.replica_index == GENERIC_REPLICA_INDEX,
            "seal queue entry {} carries a replica index",
            entry
        );
        let Some(chunk) = self.state.chunk(&entry.id) else {
            return (true, None);
        };
        crate::invariant!(
            chunk.is_journal() && chunk.is_sealed(),
            "seal requested for chunk {} which is not a sealed journal",
            entry.id
        );
        if chunk.is_job_scheduled() {
            return (true, None);
        }
        if chunk.stored_replicas().len() < chunk.read_quorum() {
            return (true, None);
        }
        (true, Some(Job::seal(*entry, node)))
    }

    // Refresh

    /// Recompute the status of a chunk and rebuild the work derived from it.
    pub fn refresh_chunk(&mut self, chunk_id: &ChunkId) {
        let Some(chunk) = self.state.chunk(chunk_id) else {
            return;
        };
        if !chunk.is_confirmed() || self.state.is_foreign(chunk_id) {
            return;
        }

        self.sets.reset(chunk_id);

        let statistics = self.compute_statistics(chunk);
        let kind = chunk.kind();
        let vital = chunk.is_vital();
        let job_scheduled = chunk.is_job_scheduled();
        let stored: Vec<ChunkReplica> = chunk.stored_replicas().to_vec();
        let media: Vec<(MediumIndex, u32)> = self
            .state
            .media()
            .store_media()
            .map(|medium| (medium.index, chunk.replication_factor(medium.index)))
            .collect();

        let mut durability_required = false;
        for (medium, replication_factor) in media {
            self.remove_chunk_from_queues_on_refresh(chunk_id, kind, &stored, medium);

            let medium_statistics = statistics.medium(medium);
            let status = medium_statistics.status;
            if status.is_none() {
                continue;
            }

            durability_required |= vital && (kind == ChunkKind::Erasure || replication_factor > 1);

            if status.has(ChunkStatus::OVERREPLICATED) {
                self.sets.overreplicated.insert(*chunk_id);
            }
            if status.has(ChunkStatus::UNDERREPLICATED) {
                self.sets.underreplicated.insert(*chunk_id);
            }
            if status.has(ChunkStatus::QUORUM_MISSING) {
                self.sets.quorum_missing.insert(*chunk_id);
            }
            if status.has(ChunkStatus::UNSAFELY_PLACED) {
                self.sets.unsafely_placed.insert(*chunk_id);
            }

            if !job_scheduled {
                self.enqueue_chunk_work(chunk_id, kind, &stored, medium, &statistics);
            }
        }

        let cross_medium = statistics.status;
        if cross_medium.has(CrossMediumStatus::LOST) {
            insert_fresh(&mut self.sets.lost, *chunk_id, "lost");
            if durability_required {
                insert_fresh(&mut self.sets.lost_vital, *chunk_id, "lost vital");
            }
        }
        if cross_medium.has(CrossMediumStatus::DATA_MISSING) {
            insert_fresh(&mut self.sets.data_missing, *chunk_id, "data missing");
        }
        if cross_medium.has(CrossMediumStatus::PARITY_MISSING) {
            insert_fresh(&mut self.sets.parity_missing, *chunk_id, "parity missing");
        }
        if cross_medium.has(CrossMediumStatus::PRECARIOUS) {
            insert_fresh(&mut self.sets.precarious, *chunk_id, "precarious");
            if durability_required {
                insert_fresh(&mut self.sets.precarious_vital, *chunk_id, "precarious vital");
            }
        }
    }

    /// Turn the statistics of one medium into queue entries.
    fn enqueue_chunk_work(
        &mut self,
        chunk_id: &ChunkId,
        kind: ChunkKind,
        stored: &[ChunkReplica],
        medium: MediumIndex,
        statistics: &ChunkStatistics,
    ) {
        let medium_statistics = statistics.medium(medium);
        let status = medium_statistics.status;
        let medium_wise_lost = statistics.status.has(CrossMediumStatus::MEDIUM_WISE_LOST);

        if status.has(ChunkStatus::OVERREPLICATED) && !medium_wise_lost {
            for replica in &medium_statistics.decommissioned_removal_replicas {
                if let Some(node) = self.state.node_mut(&replica.node) {
                    if node.is_online() {
                        node.add_to_removal_queue(ChunkIdWithIndexes::new(
                            *chunk_id,
                            replica.replica_index,
                            replica.medium,
                        ));
                    }
                }
            }
            for &replica_index in &medium_statistics.balancing_removal_indexes {
                let key = ChunkIdWithIndexes::new(*chunk_id, replica_index, medium);
                let Some(target) = self.placement.removal_target(&self.state, &key) else {
                    continue;
                };
                if let Some(node) = self.state.node_mut(&target) {
                    node.add_to_removal_queue(key);
                }
            }
        }

        if status.has_any(ChunkStatus::UNDERREPLICATED | ChunkStatus::UNSAFELY_PLACED) {
            let priority_limit = self.config.replication_priority_count.max(1) - 1;
            for &replica_index in &medium_statistics.replication_indexes {
                let replica_count = medium_statistics.replica_count[replica_index] as usize;
                let priority = replica_count.saturating_sub(1).min(priority_limit);
                for replica in stored {
                    let donor = match kind {
                        ChunkKind::Regular => true,
                        ChunkKind::Erasure => replica.replica_index == replica_index,
                        ChunkKind::Journal => replica.replica_index == SEALED_REPLICA_INDEX,
                    };
                    if !donor || !(medium_wise_lost || replica.medium == medium) {
                        continue;
                    }
                    if let Some(node) = self.state.node_mut(&replica.node) {
                        if node.is_online() {
                            node.add_to_replication_queue(
                                ChunkIdWithIndexes::new(*chunk_id, replica.replica_index, replica.medium),
                                medium,
                                priority,
                            );
                        }
                    }
                }
            }
        }

        if status.has(ChunkStatus::SEALED) {
            for replica in stored {
                if replica.medium != medium || replica.replica_index != UNSEALED_REPLICA_INDEX {
                    continue;
                }
                if let Some(node) = self.state.node_mut(&replica.node) {
                    if node.is_online() {
                        node.add_to_seal_queue(*chunk_id, medium);
                    }
                }
            }
        }

        if status.has_any(ChunkStatus::DATA_MISSING | ChunkStatus::PARITY_MISSING)
            && !status.has(ChunkStatus::LOST)
        {
            self.add_to_repair_queue(ChunkIdWithIndexes::new(*chunk_id, GENERIC_REPLICA_INDEX, medium));
        }
    }

    fn remove_chunk_from_queues_on_refresh(
        &mut self,
        chunk_id: &ChunkId,
        kind: ChunkKind,
        stored: &[ChunkReplica],
        medium: MediumIndex,
    ) {
        for replica in stored {
            let key = ChunkIdWithIndexes::new(*chunk_id, replica.replica_index, replica.medium);
            if let Some(node) = self.state.node_mut(&replica.node) {
                node.remove_from_replication_queues(&key, Some(medium));
                node.remove_from_removal_queue(&key);
            }
        }
        if kind == ChunkKind::Erasure {
            self.remove_from_repair_queue(chunk_id, medium);
        }
    }

    fn remove_chunk_from_queues_on_destroy(&mut self, chunk_id: &ChunkId) {
        let Some(chunk) = self.state.chunk(chunk_id) else {
            return;
        };
        let is_erasure = chunk.is_erasure();
        let stored = chunk.stored_replicas().to_vec();
        // Removal requests stay: the replicas must still be deleted.
        for replica in stored {
            let key = ChunkIdWithIndexes::new(*chunk_id, replica.replica_index, replica.medium);
            if let Some(node) = self.state.node_mut(&replica.node) {
                node.remove_from_replication_queues(&key, None);
                node.remove_from_seal_queue(*chunk_id, replica.medium);
            }
        }
        if is_erasure {
            for medium in 0..MAX_MEDIUM_COUNT {
                self.remove_from_repair_queue(chunk_id, medium);
            }
        }
    }

    // Repair queue

    fn add_to_repair_queue(&mut self, entry: ChunkIdWithIndexes) {
        let Some(chunk) = self.state.chunk(&entry.id) else {
            return;
        };
        crate::invariant!(
            chunk.repair_queue_token(entry.medium).is_none(),
            "chunk {} is already queued for repair on medium {}",
            entry.id,
            entry.medium
        );
        let token = self.repair_queue.push_back(entry);
        if let Some(chunk) = self.state.chunk_mut(&entry.id) {
            chunk.set_repair_queue_token(entry.medium, Some(token));
        }
    }

    fn remove_from_repair_queue(&mut self, chunk_id: &ChunkId, medium: MediumIndex) {
        let Some(chunk) = self.state.chunk_mut(chunk_id) else {
            return;
        };
        if let Some(token) = chunk.repair_queue_token(medium) {
            chunk.set_repair_queue_token(medium, None);
            self.repair_queue.remove(token);
        }
    }

    pub fn repair_queue(&self) -> &RepairQueue {
        &self.repair_queue
    }

    /// Move every repair entry of a chunk to the front of the queue: the
    /// chunk was just read, so repairing it is urgent.
    pub fn touch_chunk(&mut self, chunk_id: &ChunkId) {
        for medium in 0..MAX_MEDIUM_COUNT {
            let Some(token) = self
                .state
                .chunk(chunk_id)
                .and_then(|chunk| chunk.repair_queue_token(medium))
            else {
                continue;
            };
            let Some(entry) = self.repair_queue.remove(token) else {
                continue;
            };
            let token = self.repair_queue.push_front(entry);
            if let Some(chunk) = self.state.chunk_mut(chunk_id) {
                chunk.set_repair_queue_token(medium, Some(token));
            }
        }
    }

    // Scheduling hooks

    /// Queue a chunk for refresh. Dead and foreign chunks are ignored.
    pub fn schedule_chunk_refresh(&mut self, chunk_id: &ChunkId) {
        if !self.state.is_chunk_alive(chunk_id) || self.state.is_foreign(chunk_id) {
            return;
        }
        self.refresh_scanner.enqueue(*chunk_id, Instant::now());
    }

    /// Queue a refresh for every chunk with a stored replica on the node.
    pub fn schedule_node_refresh(&mut self, node_id: NodeId) {
        let Some(node) = self.state.node(&node_id) else {
            return;
        };
        let chunks: Vec<ChunkId> = node
            .replicas()
            .iter()
            .filter(|replica| !self.state.media().is_cache(replica.medium))
            .map(|replica| replica.id)
            .collect();
        for chunk_id in chunks {
            self.schedule_chunk_refresh(&chunk_id);
        }
    }

    pub fn schedule_properties_update(&mut self, chunk_id: &ChunkId) {
        if !self.state.is_chunk_alive(chunk_id) || self.state.is_foreign(chunk_id) {
            return;
        }
        self.properties_update_scanner.enqueue(*chunk_id, Instant::now());
    }

    /// Queue a properties update for every chunk under a chunk list. A
    /// missing list is ignored.
    pub fn schedule_properties_update_for_list(&mut self, list_id: ChunkListId) {
        for chunk_id in self.state.collect_subtree_chunks(list_id) {
            self.schedule_properties_update(&chunk_id);
        }
    }

    /// Ask `node` to delete a replica the master has no record of.
    pub fn schedule_unknown_replica_removal(&mut self, node_id: NodeId, replica: ChunkIdWithIndexes) {
        if let Some(node) = self.state.node_mut(&node_id) {
            node.add_to_removal_queue(replica);
        }
    }

    pub fn schedule_replica_removal(&mut self, node_id: NodeId, replica: ChunkIdWithIndexes) {
        if let Some(node) = self.state.node_mut(&node_id) {
            node.add_to_removal_queue(replica);
        }
    }

    pub fn refresh_queue_size(&self) -> usize {
        self.refresh_scanner.queue_size()
    }

    pub fn properties_update_queue_size(&self) -> usize {
        self.properties_update_scanner.queue_size()
    }

    /// One bounded refresh pass over chunks whose settle delay has elapsed.
    pub fn on_refresh(&mut self) -> ScanPassStats {
        let started = Instant::now();
        let delay = self.config.chunk_refresh_delay;
        let mut stats = ScanPassStats::default();
        debug!("Incremental chunk refresh iteration started");

        while stats.total < self.config.max_chunks_per_refresh
            && self.refresh_scanner.has_unscanned_chunk(Instant::now(), delay)
        {
            if started.elapsed() > self.config.max_time_per_refresh {
                break;
            }
            stats.total += 1;
            let Some(chunk_id) = self.refresh_scanner.dequeue_chunk() else {
                break;
            };
            if !self.state.is_chunk_alive(&chunk_id) {
                continue;
            }
            self.refresh_chunk(&chunk_id);
            stats.alive += 1;
        }

        debug!(
            total_count = stats.total,
            alive_count = stats.alive,
            "Incremental chunk refresh iteration completed"
        );
        self.publish_metrics();
        stats
    }

    // Properties

    /// Effective properties of a chunk, folded from every owner reachable
    /// through its chunk lists. Chunks without owners keep their local
    /// properties.
    pub fn compute_chunk_properties(&self, chunk_id: &ChunkId) -> Option<ChunkProperties> {
        let chunk = self.state.chunk(chunk_id)?;

        let mut properties = ChunkProperties::combine_identity();
        let mut found = false;
        self.state.walk_owning_lists(chunk_id, |list| {
            for owner_id in &list.owners {
                if let Some(owner) = self.state.owner(owner_id) {
                    properties.combine(&owner.properties);
                    found = true;
                }
            }
        });

        if !found {
            return Some(chunk.local_properties().clone());
        }

        // Inactive media carry no policy.
        for (_, policy) in properties.media.iter_mut() {
            if !policy.is_active() {
                *policy = Default::default();
            }
        }
        if chunk.is_erasure() {
            properties.clamp_for_erasure();
        }
        Some(properties)
    }

    /// One bounded properties pass. Returns the changed chunks; nothing is
    /// applied until [`ChunkReplicator::apply_properties_update`].
    pub fn build_properties_update(&mut self) -> UpdateChunkPropertiesRequest {
        let started = Instant::now();
        let mut request = UpdateChunkPropertiesRequest::new(self.state.cell_tag());
        let mut stats = ScanPassStats::default();
        debug!("Chunk properties update iteration started");

        while stats.total < self.config.max_chunks_per_properties_update
            && self
                .properties_update_scanner
                .has_unscanned_chunk(Instant::now(), Duration::ZERO)
        {
            if started.elapsed() > self.config.max_time_per_properties_update {
                break;
            }
            stats.total += 1;
            let Some(chunk_id) = self.properties_update_scanner.dequeue_chunk() else {
                break;
            };
            let Some(chunk) = self.state.chunk(&chunk_id) else {
                continue;
            };
            stats.alive += 1;
            let Some(properties) = self.compute_chunk_properties(&chunk_id) else {
                continue;
            };
            if properties != *chunk.local_properties() {
                request.updates.push(ChunkPropertiesUpdate {
                    chunk_id,
                    properties,
                });
            }
        }

        debug!(
            total_count = stats.total,
            alive_count = stats.alive,
            update_count = request.updates.len(),
            "Chunk properties update iteration completed"
        );
        request
    }

    /// Apply a committed properties update and refresh the changed chunks.
    /// Returns the number of chunks whose properties changed.
    pub fn apply_properties_update(&mut self, request: &UpdateChunkPropertiesRequest) -> Result<usize> {
        if request.cell_tag != self.state.cell_tag() {
            return Err(ReplicatorError::InvalidArgument(format!(
                "properties update for cell {} applied to cell {}",
                request.cell_tag,
                self.state.cell_tag()
            )));
        }

        let mut applied = 0;
        for update in &request.updates {
            let Some(chunk) = self.state.chunk_mut(&update.chunk_id) else {
                continue;
            };
            if *chunk.local_properties() == update.properties {
                continue;
            }
            chunk.set_local_properties(update.properties.clone());
            applied += 1;
            self.schedule_chunk_refresh(&update.chunk_id);
        }
        Ok(applied)
    }

    // Lifecycle hooks

    pub fn on_node_registered(&mut self, _node_id: NodeId) {}

    /// Add a node and notify the replicator.
    pub fn register_node(&mut self, node: super::node::Node) -> Result<()> {
        let node_id = node.id();
        self.state.insert_node(node)?;
        self.on_node_registered(node_id);
        Ok(())
    }

    /// Cancel every job of a departed node and discard its queues. Returns
    /// the canceled jobs.
    pub fn on_node_unregistered(&mut self, node_id: NodeId) -> Vec<JobId> {
        let Some(node) = self.state.node(&node_id) else {
            return Vec::new();
        };
        let job_ids: Vec<JobId> = node.jobs().iter().copied().collect();
        for job_id in &job_ids {
            debug!(job_id = %job_id, node_id, "Job canceled");
            self.unregister_job(job_id, UnregisterFlags::REFRESH_ONLY);
        }
        if let Some(node) = self.state.node_mut(&node_id) {
            node.reset();
        }
        job_ids
    }

    /// Mark a node unregistered and cancel its jobs.
    pub fn unregister_node(&mut self, node_id: NodeId) -> Result<Vec<JobId>> {
        let node = self
            .state
            .node_mut(&node_id)
            .ok_or(ReplicatorError::NodeNotFound(node_id))?;
        node.set_state(NodeState::Unregistered);
        let canceled = self.on_node_unregistered(node_id);
        info!(node_id, canceled_jobs = canceled.len(), "Node unregistered");
        Ok(canceled)
    }

    /// A disposed node must hold no jobs and no queued work.
    pub fn on_node_disposed(&self, node_id: NodeId) {
        let Some(node) = self.state.node(&node_id) else {
            return;
        };
        crate::invariant!(node.jobs().is_empty(), "disposed node {} has jobs", node_id);
        crate::invariant!(
            node.seal_queue().is_empty(),
            "disposed node {} has queued seals",
            node_id
        );
        crate::invariant!(
            node.removal_queue().is_empty(),
            "disposed node {} has queued removals",
            node_id
        );
        crate::invariant!(
            node.replication_queues().iter().all(|queue| queue.is_empty()),
            "disposed node {} has queued replications",
            node_id
        );
    }

    /// Drop a node for good: unregister it if needed, forget its replicas,
    /// then remove it from the cluster.
    pub fn dispose_node(&mut self, node_id: NodeId) -> Result<()> {
        let node = self
            .state
            .node(&node_id)
            .ok_or(ReplicatorError::NodeNotFound(node_id))?;
        if node.state() != NodeState::Unregistered {
            self.unregister_node(node_id)?;
        }

        let replicas: Vec<ChunkIdWithIndexes> = self
            .state
            .node(&node_id)
            .map(|node| node.replicas().iter().copied().collect())
            .unwrap_or_default();
        for key in replicas {
            let replica = ChunkReplica::new(node_id, key.replica_index, key.medium);
            let cached = self.state.media().is_cache(key.medium);
            self.remove_replica(&key.id, replica, cached, RemoveReplicaReason::NodeDisposed)?;
        }

        self.on_node_disposed(node_id);
        self.state.remove_node(&node_id);
        info!(node_id, "Node disposed");
        Ok(())
    }

    pub fn on_chunk_destroyed(&mut self, chunk_id: &ChunkId) {
        self.refresh_scanner.on_chunk_destroyed(chunk_id);
        self.properties_update_scanner.on_chunk_destroyed(chunk_id);
        self.sets.reset(chunk_id);
        self.remove_chunk_from_queues_on_destroy(chunk_id);
        self.cancel_chunk_jobs(chunk_id);
    }

    /// Destroy a chunk. Its replicas are queued for removal on their nodes.
    pub fn destroy_chunk(&mut self, chunk_id: &ChunkId) -> Result<()> {
        let chunk = self
            .state
            .chunk(chunk_id)
            .ok_or_else(|| ReplicatorError::ChunkNotFound(chunk_id.to_string()))?;
        let stored = chunk.stored_replicas().to_vec();

        self.on_chunk_destroyed(chunk_id);
        for replica in stored {
            let key = ChunkIdWithIndexes::new(*chunk_id, replica.replica_index, replica.medium);
            self.on_replica_removed(replica.node, key, RemoveReplicaReason::ChunkDestroyed);
            if self.state.node(&replica.node).map_or(false, |node| node.is_online()) {
                self.schedule_replica_removal(replica.node, key);
            }
        }
        self.state.remove_chunk(chunk_id);
        debug!(chunk_id = %chunk_id, "Chunk destroyed");
        Ok(())
    }

    /// Record a new replica and refresh the chunk if it is stored.
    pub fn add_replica(&mut self, chunk_id: &ChunkId, replica: ChunkReplica, cached: bool) -> Result<bool> {
        if !self.state.add_replica(chunk_id, replica, cached)? {
            return Ok(false);
        }
        if !cached {
            self.on_replica_added(replica.node, ChunkIdWithIndexes::new(*chunk_id, replica.replica_index, replica.medium));
            self.schedule_chunk_refresh(chunk_id);
        }
        Ok(true)
    }

    /// A new copy makes queued replication of the same replica stale.
    pub fn on_replica_added(&mut self, node_id: NodeId, replica: ChunkIdWithIndexes) {
        if let Some(node) = self.state.node_mut(&node_id) {
            node.remove_from_replication_queues(&replica, None);
        }
    }

    /// Forget a replica and refresh the chunk.
    pub fn remove_replica(
        &mut self,
        chunk_id: &ChunkId,
        replica: ChunkReplica,
        cached: bool,
        reason: RemoveReplicaReason,
    ) -> Result<bool> {
        if !self.state.remove_replica(chunk_id, &replica, cached)? {
            return Ok(false);
        }
        if !cached {
            self.on_replica_removed(
                replica.node,
                ChunkIdWithIndexes::new(*chunk_id, replica.replica_index, replica.medium),
                reason,
            );
            self.schedule_chunk_refresh(chunk_id);
        }
        Ok(true)
    }

    pub fn on_replica_removed(
        &mut self,
        node_id: NodeId,
        replica: ChunkIdWithIndexes,
        reason: RemoveReplicaReason,
    ) {
        let Some(node) = self.state.node_mut(&node_id) else {
            return;
        };
        node.remove_from_replication_queues(&replica, None);
        if reason != RemoveReplicaReason::ChunkDestroyed {
            node.remove_from_removal_queue(&replica);
        }
        if replica.id.kind() == Some(ChunkKind::Journal) {
            node.remove_from_seal_queue(replica.id, replica.medium);
        }
    }

    /// Attach a chunk to a chunk list and queue its properties update.
    pub fn attach_chunk(&mut self, list_id: ChunkListId, chunk_id: ChunkId) -> Result<()> {
        self.state.attach_child(list_id, ChunkTreeRef::Chunk(chunk_id))?;
        self.schedule_properties_update(&chunk_id);
        Ok(())
    }

    // Index sets

    pub fn chunk_sets(&self) -> &ChunkSets {
        &self.sets
    }

    pub fn lost_chunks(&self) -> &HashSet<ChunkId> {
        &self.sets.lost
    }

    pub fn lost_vital_chunks(&self) -> &HashSet<ChunkId> {
        &self.sets.lost_vital
    }

    pub fn overreplicated_chunks(&self) -> &HashSet<ChunkId> {
        &self.sets.overreplicated
    }

    pub fn underreplicated_chunks(&self) -> &HashSet<ChunkId> {
        &self.sets.underreplicated
    }

    pub fn unsafely_placed_chunks(&self) -> &HashSet<ChunkId> {
        &self.sets.unsafely_placed
    }

    pub fn quorum_missing_chunks(&self) -> &HashSet<ChunkId> {
        &self.sets.quorum_missing
    }

    pub fn data_missing_chunks(&self) -> &HashSet<ChunkId> {
        &self.sets.data_missing
    }

    pub fn parity_missing_chunks(&self) -> &HashSet<ChunkId> {
        &self.sets.parity_missing
    }

    pub fn precarious_chunks(&self) -> &HashSet<ChunkId> {
        &self.sets.precarious
    }

    pub fn precarious_vital_chunks(&self) -> &HashSet<ChunkId> {
        &self.sets.precarious_vital
    }

    /// Publish set and queue sizes as gauges.
    pub fn publish_metrics(&self) {
        let sets = &self.sets;
        gauge!("replicator_lost_chunks").set(sets.lost.len() as f64);
        gauge!("replicator_lost_vital_chunks").set(sets.lost_vital.len() as f64);
        gauge!("replicator_overreplicated_chunks").set(sets.overreplicated.len() as f64);
        gauge!("replicator_underreplicated_chunks").set(sets.underreplicated.len() as f64);
        gauge!("replicator_unsafely_placed_chunks").set(sets.unsafely_placed.len() as f64);
        gauge!("replicator_quorum_missing_chunks").set(sets.quorum_missing.len() as f64);
        gauge!("replicator_data_missing_chunks").set(sets.data_missing.len() as f64);
        gauge!("replicator_parity_missing_chunks").set(sets.parity_missing.len() as f64);
        gauge!("replicator_precarious_chunks").set(sets.precarious.len() as f64);
        gauge!("replicator_precarious_vital_chunks").set(sets.precarious_vital.len() as f64);
        gauge!("replicator_refresh_queue_size").set(self.refresh_scanner.queue_size() as f64);
        gauge!("replicator_properties_update_queue_size")
            .set(self.properties_update_scanner.queue_size() as f64);
        gauge!("replicator_repair_queue_size").set(self.repair_queue.len() as f64);
        gauge!("replicator_jobs").set(self.jobs.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::chunk::{ChunkList, ChunkOwner};
    use crate::cluster::medium::Medium;
    use crate::cluster::node::Node;
    use crate::cluster::placement::PlacementEngine;
    use crate::erasure::ErasureCodingConfig;

    const DEFAULT: MediumIndex = 0;
    const SSD: MediumIndex = 1;

    /// Replicator over nodes `1..=node_count`, one rack each.
    fn replicator(node_count: u64) -> ChunkReplicator {
        let mut state = ClusterState::new(1);
        state.register_medium(Medium::new(DEFAULT, "default")).unwrap();
        state.register_medium(Medium::new(SSD, "ssd")).unwrap();
        for id in 1..=node_count {
            state
                .insert_node(
                    Node::new(id, format!("n{}:9012", id))
                        .with_rack(id as RackId)
                        .with_fill_factor(DEFAULT, 0.1 + id as f64 * 0.01)
                        .with_fill_factor(SSD, 0.1),
                )
                .unwrap();
        }
        let config = ReplicatorConfig::default().with_chunk_refresh_delay(Duration::ZERO);
        ChunkReplicator::new(config, state, Arc::new(PlacementEngine::default()))
    }

    fn regular_chunk(replicator: &mut ChunkReplicator, rf: u32, nodes: &[NodeId]) -> ChunkId {
        let id = replicator
            .state_mut()
            .insert_chunk(
                Chunk::regular(1)
                    .with_properties(ChunkProperties::with_replication(DEFAULT, rf))
                    .with_disk_size(1024),
            )
            .unwrap();
        for &node in nodes {
            replicator
                .add_replica(&id, ChunkReplica::new(node, GENERIC_REPLICA_INDEX, DEFAULT), false)
                .unwrap();
        }
        id
    }

    fn generic(id: ChunkId, medium: MediumIndex) -> ChunkIdWithIndexes {
        ChunkIdWithIndexes::new(id, GENERIC_REPLICA_INDEX, medium)
    }

    #[test]
    fn test_repair_queue_order() {
        let chunk = ChunkId::from_parts(ChunkKind::Erasure, 1, 1);
        let mut queue = RepairQueue::new();
        let a = queue.push_back(generic(chunk, 0));
        let b = queue.push_back(generic(chunk, 1));
        let c = queue.push_front(generic(chunk, 2));

        let order: Vec<_> = queue.iter().map(|entry| entry.medium).collect();
        assert_eq!(order, vec![2, 0, 1]);
        assert_eq!(queue.next_after(None).map(|(t, _)| t), Some(c));
        assert_eq!(queue.next_after(Some(a)).map(|(t, _)| t), Some(b));
        assert_eq!(queue.remove(a).map(|e| e.medium), Some(0));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_refresh_underreplicated_queues_replication() {
        let mut replicator = replicator(4);
        let id = regular_chunk(&mut replicator, 3, &[1]);
        replicator.refresh_chunk(&id);

        assert!(replicator.underreplicated_chunks().contains(&id));
        let node = replicator.state().node(&1).unwrap();
        let entry = node.replication_queues()[0].get(&generic(id, DEFAULT)).copied();
        assert_eq!(entry, Some(MediumSet::single(DEFAULT)));
        assert_eq!(node.replication_queue_len(), 1);
    }

    #[test]
    fn test_replication_priority_follows_replica_count() {
        let mut replicator = replicator(5);
        let id = regular_chunk(&mut replicator, 4, &[1, 2, 3]);
        replicator.refresh_chunk(&id);

        // Three live copies cap at the lowest priority.
        let node = replicator.state().node(&1).unwrap();
        assert!(node.replication_queues()[2].contains_key(&generic(id, DEFAULT)));
        assert!(node.replication_queues()[0].is_empty());
    }

    #[test]
    fn test_refresh_overreplicated_queues_removal() {
        let mut replicator = replicator(4);
        let id = regular_chunk(&mut replicator, 2, &[1, 2, 3]);
        replicator.refresh_chunk(&id);

        assert!(replicator.overreplicated_chunks().contains(&id));
        let queued: usize = replicator
            .state()
            .nodes()
            .map(|node| node.removal_queue().len())
            .sum();
        assert_eq!(queued, 1);
    }

    #[test]
    fn test_refresh_is_idempotent_on_queues() {
        let mut replicator = replicator(4);
        let id = regular_chunk(&mut replicator, 3, &[1]);
        replicator.refresh_chunk(&id);
        replicator.refresh_chunk(&id);

        assert_eq!(replicator.state().node(&1).unwrap().replication_queue_len(), 1);
        assert_eq!(replicator.underreplicated_chunks().len(), 1);
    }

    #[test]
    fn test_lost_vital_chunk() {
        let mut replicator = replicator(3);
        let id = replicator
            .state_mut()
            .insert_chunk(
                Chunk::regular(1).with_properties(ChunkProperties::with_replication(DEFAULT, 3).with_vital(true)),
            )
            .unwrap();
        replicator.refresh_chunk(&id);

        assert!(replicator.lost_chunks().contains(&id));
        assert!(replicator.lost_vital_chunks().contains(&id));
    }

    #[test]
    fn test_unconfirmed_and_foreign_chunks_are_skipped() {
        let mut replicator = replicator(3);
        let unconfirmed = replicator
            .state_mut()
            .insert_chunk(
                Chunk::regular(1)
                    .with_properties(ChunkProperties::with_replication(DEFAULT, 3))
                    .with_confirmed(false),
            )
            .unwrap();
        let foreign = replicator
            .state_mut()
            .insert_chunk(Chunk::regular(7).with_properties(ChunkProperties::with_replication(DEFAULT, 3)))
            .unwrap();

        replicator.refresh_chunk(&unconfirmed);
        replicator.refresh_chunk(&foreign);
        assert!(replicator.lost_chunks().is_empty());

        replicator.schedule_chunk_refresh(&foreign);
        assert_eq!(replicator.refresh_queue_size(), 0);
    }

    #[test]
    fn test_register_and_unregister_job() {
        let mut replicator = replicator(3);
        let id = regular_chunk(&mut replicator, 2, &[1]);
        replicator.refresh_scanner.clear();

        let job = Job::replicate(generic(id, DEFAULT), 1, vec![ChunkReplica::new(2, GENERIC_REPLICA_INDEX, DEFAULT)], 1024);
        let job_id = job.id;
        replicator.register_job(job);

        assert!(replicator.find_job(&job_id).is_some());
        assert!(replicator.state().node(&1).unwrap().jobs().contains(&job_id));
        assert_eq!(replicator.state().chunk(&id).unwrap().job(), Some(job_id));
        assert_eq!(replicator.state().node(&1).unwrap().resource_usage().replication_slots, 1);

        let removed = replicator.unregister_job(&job_id, UnregisterFlags::ALL);
        assert!(removed.is_some());
        assert!(replicator.find_job(&job_id).is_none());
        assert!(replicator.state().node(&1).unwrap().jobs().is_empty());
        assert_eq!(replicator.state().chunk(&id).unwrap().job(), None);
        assert_eq!(replicator.state().node(&1).unwrap().resource_usage().replication_slots, 0);
        assert_eq!(replicator.refresh_queue_size(), 1);

        assert!(replicator.unregister_job(&job_id, UnregisterFlags::ALL).is_none());
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_double_registration_panics() {
        let mut replicator = replicator(2);
        let id = regular_chunk(&mut replicator, 1, &[1]);
        let job = Job::remove(generic(id, DEFAULT), 1);
        replicator.register_job(job.clone());
        replicator.register_job(job);
    }

    #[test]
    fn test_create_replication_job() {
        let mut replicator = replicator(4);
        let id = regular_chunk(&mut replicator, 3, &[1]);

        // A pending refresh makes the entry a no-op.
        let (done, job) = replicator.create_replication_job(1, &generic(id, DEFAULT), DEFAULT);
        assert!(done);
        assert!(job.is_none());

        replicator.refresh_scanner.clear();
        let (done, job) = replicator.create_replication_job(1, &generic(id, DEFAULT), DEFAULT);
        assert!(done);
        let job = job.unwrap();
        assert_eq!(job.targets.len(), 2);
        assert!(job.targets.iter().all(|t| t.node != 1 && t.medium == DEFAULT));
        assert_eq!(job.resource_usage.replication_data_size, 1024);
    }

    #[test]
    fn test_create_replication_job_partial_targets() {
        let mut replicator = replicator(2);
        let id = regular_chunk(&mut replicator, 3, &[1]);
        replicator.refresh_scanner.clear();

        let (done, job) = replicator.create_replication_job(1, &generic(id, DEFAULT), DEFAULT);
        assert!(!done);
        assert_eq!(job.unwrap().targets.len(), 1);
    }

    #[test]
    fn test_create_removal_job_for_dead_chunk() {
        let replicator = replicator(2);
        let dead = ChunkId::from_parts(ChunkKind::Regular, 1, 999);
        let (done, job) = replicator.create_removal_job(1, &generic(dead, DEFAULT));
        assert!(done);
        assert_eq!(job.unwrap().resource_usage.removal_slots, 1);
    }

    #[test]
    fn test_erasure_chunk_enters_repair_queue() {
        let mut replicator = replicator(12);
        let id = replicator
            .state_mut()
            .insert_chunk(
                Chunk::erasure(1, ErasureCodingConfig::REED_SOLOMON_6_3)
                    .with_properties(ChunkProperties::with_replication(DEFAULT, 1)),
            )
            .unwrap();
        for part in 0..6 {
            replicator
                .add_replica(&id, ChunkReplica::new(part as NodeId + 1, part, DEFAULT), false)
                .unwrap();
        }
        replicator.refresh_chunk(&id);

        assert!(replicator.parity_missing_chunks().contains(&id));
        assert!(!replicator.lost_chunks().contains(&id));
        assert_eq!(replicator.repair_queue().len(), 1);
        assert!(replicator.state().chunk(&id).unwrap().repair_queue_token(DEFAULT).is_some());

        replicator.refresh_scanner.clear();
        let (done, job) = replicator.create_repair_job(9, &generic(id, DEFAULT));
        assert!(done);
        let job = job.unwrap();
        let parts: Vec<_> = job.targets.iter().map(|t| t.replica_index).collect();
        assert_eq!(parts, vec![6, 7, 8]);
        assert_eq!(
            job.resource_usage.repair_data_size,
            replicator.config().repair_job_memory_usage
        );
    }

    #[test]
    fn test_touch_chunk_moves_repair_entry_to_front() {
        let mut replicator = replicator(12);
        let mut ids = Vec::new();
        for _ in 0..2 {
            let id = replicator
                .state_mut()
                .insert_chunk(
                    Chunk::erasure(1, ErasureCodingConfig::REED_SOLOMON_3_3)
                        .with_properties(ChunkProperties::with_replication(DEFAULT, 1)),
                )
                .unwrap();
            for part in 0..3 {
                replicator
                    .add_replica(&id, ChunkReplica::new(part as NodeId + 1, part, DEFAULT), false)
                    .unwrap();
            }
            replicator.refresh_chunk(&id);
            ids.push(id);
        }
        assert_eq!(replicator.repair_queue().iter().next().map(|e| e.id), Some(ids[0]));

        replicator.touch_chunk(&ids[1]);
        assert_eq!(replicator.repair_queue().iter().next().map(|e| e.id), Some(ids[1]));
        assert_eq!(replicator.repair_queue().len(), 2);
    }

    #[test]
    fn test_destroy_chunk_cancels_job_and_keeps_removals() {
        let mut replicator = replicator(3);
        let id = regular_chunk(&mut replicator, 3, &[1]);
        replicator.refresh_chunk(&id);
        let job = Job::replicate(generic(id, DEFAULT), 1, vec![], 1024);
        let job_id = job.id;
        replicator.register_job(job);

        replicator.destroy_chunk(&id).unwrap();

        assert!(replicator.find_job(&job_id).is_none());
        assert!(!replicator.state().is_chunk_alive(&id));
        assert!(!replicator.chunk_sets().contains_anywhere(&id));
        let node = replicator.state().node(&1).unwrap();
        assert_eq!(node.replication_queue_len(), 0);
        assert!(node.removal_queue().contains_key(&generic(id, DEFAULT).without_medium()));
        assert!(node.jobs().is_empty());
    }

    #[test]
    fn test_unregister_node_cancels_jobs() {
        let mut replicator = replicator(3);
        let a = regular_chunk(&mut replicator, 3, &[1]);
        let b = regular_chunk(&mut replicator, 3, &[1]);
        replicator.refresh_chunk(&a);
        for id in [a, b] {
            replicator.register_job(Job::replicate(generic(id, DEFAULT), 1, vec![], 1024));
        }

        let canceled = replicator.unregister_node(1).unwrap();
        assert_eq!(canceled.len(), 2);
        assert_eq!(replicator.job_count(), 0);
        assert!(replicator.state().node(&1).unwrap().is_idle());
        assert_eq!(replicator.state().chunk(&a).unwrap().job(), None);
        replicator.on_node_disposed(1);
    }

    #[test]
    fn test_dispose_node_forgets_replicas() {
        let mut replicator = replicator(3);
        let id = regular_chunk(&mut replicator, 2, &[1, 2]);
        replicator.dispose_node(1).unwrap();

        assert!(replicator.state().node(&1).is_none());
        assert_eq!(replicator.state().chunk(&id).unwrap().stored_replicas().len(), 1);
    }

    #[test]
    fn test_compute_chunk_properties_from_owners() {
        let mut replicator = replicator(1);
        let id = regular_chunk(&mut replicator, 1, &[]);
        let state = replicator.state_mut();
        state.insert_chunk_list(ChunkList::new(10)).unwrap();
        state.insert_owner(ChunkOwner::new(100, "//home/a", ChunkProperties::with_replication(DEFAULT, 3)));
        state.insert_owner(ChunkOwner::new(
            101,
            "//home/b",
            ChunkProperties::with_replication(DEFAULT, 2).with_vital(true),
        ));
        state.attach_owner(10, 100).unwrap();
        state.attach_owner(10, 101).unwrap();
        replicator.attach_chunk(10, id).unwrap();

        let properties = replicator.compute_chunk_properties(&id).unwrap();
        assert_eq!(properties, ChunkProperties::with_replication(DEFAULT, 3).with_vital(true));

        let request = replicator.build_properties_update();
        assert_eq!(request.updates.len(), 1);
        assert_eq!(replicator.apply_properties_update(&request).unwrap(), 1);
        assert_eq!(replicator.state().chunk(&id).unwrap().replication_factor(DEFAULT), 3);
        assert!(replicator.build_properties_update().is_empty());
    }

    #[test]
    fn test_apply_properties_update_rejects_other_cell() {
        let mut replicator = replicator(1);
        let request = UpdateChunkPropertiesRequest::new(9);
        assert!(matches!(
            replicator.apply_properties_update(&request),
            Err(ReplicatorError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_on_refresh_respects_count_cap() {
        let mut replicator = replicator(3);
        replicator.config.max_chunks_per_refresh = 2;
        for _ in 0..3 {
            regular_chunk(&mut replicator, 3, &[1]);
        }
        let stats = replicator.on_refresh();
        assert_eq!(stats, ScanPassStats { total: 2, alive: 2 });
        assert_eq!(replicator.refresh_queue_size(), 1);
    }

    #[test]
    fn test_stop_clears_jobs() {
        let mut replicator = replicator(3);
        let id = regular_chunk(&mut replicator, 3, &[1]);
        replicator.register_job(Job::replicate(generic(id, DEFAULT), 1, vec![], 1024));
        replicator.set_enabled(true);

        replicator.stop();
        assert_eq!(replicator.job_count(), 0);
        assert!(replicator.state().node(&1).unwrap().jobs().is_empty());
        assert_eq!(replicator.state().chunk(&id).unwrap().job(), None);
        assert!(!replicator.is_enabled());
    }
}
