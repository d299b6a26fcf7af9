//! The master's view of a storage node.
//!
//! Besides topology and load, a node carries the pending work the refresh
//! pass derived for it: replication queues split by priority, a removal
//! queue and a seal queue. The scheduler drains these queues when the node
//! heartbeats.

use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ops::AddAssign;

/// Node lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Offline,
    Registered,
    Online,
    Unregistered,
}

/// Job resource counters: slots plus data-size budgets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResources {
    pub replication_slots: u32,
    pub replication_data_size: u64,
    pub repair_slots: u32,
    pub repair_data_size: u64,
    pub removal_slots: u32,
    pub seal_slots: u32,
}

impl NodeResources {
    /// Limits typical for a data node.
    pub fn default_limits() -> Self {
        Self {
            replication_slots: 4,
            replication_data_size: 1024 * 1024 * 1024,
            repair_slots: 4,
            repair_data_size: 4 * 1024 * 1024 * 1024,
            removal_slots: 16,
            seal_slots: 16,
        }
    }

    /// Subtract a released footprint, clamping at zero.
    pub fn release(&mut self, other: &NodeResources) {
        self.replication_slots = self.replication_slots.saturating_sub(other.replication_slots);
        self.replication_data_size = self
            .replication_data_size
            .saturating_sub(other.replication_data_size);
        self.repair_slots = self.repair_slots.saturating_sub(other.repair_slots);
        self.repair_data_size = self.repair_data_size.saturating_sub(other.repair_data_size);
        self.removal_slots = self.removal_slots.saturating_sub(other.removal_slots);
        self.seal_slots = self.seal_slots.saturating_sub(other.seal_slots);
    }
}

impl AddAssign for NodeResources {
    fn add_assign(&mut self, other: NodeResources) {
        self.replication_slots += other.replication_slots;
        self.replication_data_size += other.replication_data_size;
        self.repair_slots += other.repair_slots;
        self.repair_data_size += other.repair_data_size;
        self.removal_slots += other.removal_slots;
        self.seal_slots += other.seal_slots;
    }
}

/// Pending replication work: source replica -> target media.
pub type ReplicationQueue = BTreeMap<ChunkIdWithIndexes, MediumSet>;

/// Pending removals: replica -> media to remove it from.
pub type RemovalQueue = BTreeMap<ChunkIdWithIndex, MediumSet>;

/// Pending seals: journal chunk -> media.
pub type SealQueue = BTreeMap<ChunkId, MediumSet>;

/// A storage node as seen by the replicator.
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    address: String,
    state: NodeState,
    decommissioned: bool,
    rack: Option<RackId>,
    data_center: Option<String>,
    fill_factors: PerMedium<Option<f64>>,
    resource_usage: NodeResources,
    resource_limits: NodeResources,
    jobs: HashSet<JobId>,
    replicas: BTreeSet<ChunkIdWithIndexes>,
    replication_queues: Vec<ReplicationQueue>,
    removal_queue: RemovalQueue,
    seal_queue: SealQueue,
}

impl Node {
    /// Create an online node with default resource limits.
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            state: NodeState::Online,
            decommissioned: false,
            rack: None,
            data_center: None,
            fill_factors: PerMedium::default(),
            resource_usage: NodeResources::default(),
            resource_limits: NodeResources::default_limits(),
            jobs: HashSet::new(),
            replicas: BTreeSet::new(),
            replication_queues: Vec::new(),
            removal_queue: RemovalQueue::new(),
            seal_queue: SealQueue::new(),
        }
    }

    pub fn with_rack(mut self, rack: RackId) -> Self {
        self.rack = Some(rack);
        self
    }

    pub fn with_data_center(mut self, data_center: impl Into<String>) -> Self {
        self.data_center = Some(data_center.into());
        self
    }

    pub fn with_fill_factor(mut self, medium: MediumIndex, fill_factor: f64) -> Self {
        self.set_fill_factor(medium, Some(fill_factor));
        self
    }

    pub fn with_resource_limits(mut self, limits: NodeResources) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn with_state(mut self, state: NodeState) -> Self {
        self.state = state;
        self
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn set_state(&mut self, state: NodeState) {
        self.state = state;
    }

    pub fn is_online(&self) -> bool {
        self.state == NodeState::Online
    }

    pub fn is_decommissioned(&self) -> bool {
        self.decommissioned
    }

    pub fn set_decommissioned(&mut self, decommissioned: bool) {
        self.decommissioned = decommissioned;
    }

    pub fn rack(&self) -> Option<RackId> {
        self.rack
    }

    pub fn data_center(&self) -> Option<&str> {
        self.data_center.as_deref()
    }

    /// Fill factor on `medium`, or `None` if the node has no such storage.
    pub fn fill_factor(&self, medium: MediumIndex) -> Option<f64> {
        self.fill_factors.get(medium).copied().flatten()
    }

    /// Record the fill factor on `medium`. Unknown medium indexes are ignored.
    pub fn set_fill_factor(&mut self, medium: MediumIndex, fill_factor: Option<f64>) {
        if let Some(slot) = self.fill_factors.get_mut(medium) {
            *slot = fill_factor;
        }
    }

    pub fn resource_usage(&self) -> &NodeResources {
        &self.resource_usage
    }

    /// Overwrite usage with the counters reported by the node itself.
    pub fn set_resource_usage(&mut self, usage: NodeResources) {
        self.resource_usage = usage;
    }

    pub(crate) fn resource_usage_mut(&mut self) -> &mut NodeResources {
        &mut self.resource_usage
    }

    pub fn resource_limits(&self) -> &NodeResources {
        &self.resource_limits
    }

    pub fn set_resource_limits(&mut self, limits: NodeResources) {
        self.resource_limits = limits;
    }

    pub fn jobs(&self) -> &HashSet<JobId> {
        &self.jobs
    }

    pub(crate) fn jobs_mut(&mut self) -> &mut HashSet<JobId> {
        &mut self.jobs
    }

    /// Replicas known to be on this node.
    pub fn replicas(&self) -> &BTreeSet<ChunkIdWithIndexes> {
        &self.replicas
    }

    pub(crate) fn replicas_mut(&mut self) -> &mut BTreeSet<ChunkIdWithIndexes> {
        &mut self.replicas
    }

    pub fn replication_queues(&self) -> &[ReplicationQueue] {
        &self.replication_queues
    }

    pub(crate) fn replication_queue_mut(&mut self, priority: usize) -> Option<&mut ReplicationQueue> {
        self.replication_queues.get_mut(priority)
    }

    pub fn removal_queue(&self) -> &RemovalQueue {
        &self.removal_queue
    }

    pub(crate) fn removal_queue_mut(&mut self) -> &mut RemovalQueue {
        &mut self.removal_queue
    }

    pub fn seal_queue(&self) -> &SealQueue {
        &self.seal_queue
    }

    pub(crate) fn seal_queue_mut(&mut self) -> &mut SealQueue {
        &mut self.seal_queue
    }

    /// Request replication of `replica` to `target_medium` at `priority`.
    pub fn add_to_replication_queue(
        &mut self,
        replica: ChunkIdWithIndexes,
        target_medium: MediumIndex,
        priority: usize,
    ) {
        if self.replication_queues.len() <= priority {
            self.replication_queues.resize_with(priority + 1, ReplicationQueue::new);
        }
        self.replication_queues[priority]
            .entry(replica)
            .or_default()
            .insert(target_medium);
    }

    /// Drop replication requests for `replica`. With `target_medium == None`
    /// the whole entry goes, in every priority.
    pub fn remove_from_replication_queues(
        &mut self,
        replica: &ChunkIdWithIndexes,
        target_medium: Option<MediumIndex>,
    ) {
        for queue in &mut self.replication_queues {
            let Some(media) = queue.get_mut(replica) else {
                continue;
            };
            match target_medium {
                Some(medium) => {
                    media.remove(medium);
                    if media.is_empty() {
                        queue.remove(replica);
                    }
                }
                None => {
                    queue.remove(replica);
                }
            }
        }
    }

    pub fn add_to_removal_queue(&mut self, replica: ChunkIdWithIndexes) {
        self.removal_queue
            .entry(replica.without_medium())
            .or_default()
            .insert(replica.medium);
    }

    pub fn remove_from_removal_queue(&mut self, replica: &ChunkIdWithIndexes) {
        let key = replica.without_medium();
        if let Some(media) = self.removal_queue.get_mut(&key) {
            media.remove(replica.medium);
            if media.is_empty() {
                self.removal_queue.remove(&key);
            }
        }
    }

    pub fn add_to_seal_queue(&mut self, chunk_id: ChunkId, medium: MediumIndex) {
        self.seal_queue.entry(chunk_id).or_default().insert(medium);
    }

    pub fn remove_from_seal_queue(&mut self, chunk_id: ChunkId, medium: MediumIndex) {
        if let Some(media) = self.seal_queue.get_mut(&chunk_id) {
            media.remove(medium);
            if media.is_empty() {
                self.seal_queue.remove(&chunk_id);
            }
        }
    }

    /// Number of queued replication entries across priorities.
    pub fn replication_queue_len(&self) -> usize {
        self.replication_queues.iter().map(|q| q.len()).sum()
    }

    /// Whether all job and queue state is empty.
    pub fn is_idle(&self) -> bool {
        self.jobs.is_empty()
            && self.removal_queue.is_empty()
            && self.seal_queue.is_empty()
            && self.replication_queues.iter().all(|q| q.is_empty())
    }

    /// Discard every job and queue. Used when the node leaves the cluster.
    pub(crate) fn reset(&mut self) {
        self.jobs.clear();
        self.replication_queues.clear();
        self.removal_queue.clear();
        self.seal_queue.clear();
        self.resource_usage = NodeResources::default();
    }
}
