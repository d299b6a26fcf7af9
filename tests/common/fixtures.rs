// Fleet fixtures for integration tests

use chunk_replicator::cluster::{
    Chunk, ChunkPlacement, ChunkProperties, ChunkReplicator, ClusterState, EnablementVerdict,
    Medium, Node, PlacementEngine, SessionKind,
};
use chunk_replicator::config::{ReplicatorConfig, ThrottlerConfig};
use chunk_replicator::erasure::ErasureCodingConfig;
use chunk_replicator::types::*;
use std::sync::Arc;
use std::time::Duration;

pub const CELL: CellTag = 1;
pub const DEFAULT: MediumIndex = 0;
pub const SSD: MediumIndex = 1;

/// Config with no refresh delay and no throttling.
pub fn test_config() -> ReplicatorConfig {
    ReplicatorConfig {
        job_throttler: ThrottlerConfig::unlimited(),
        ..ReplicatorConfig::default().with_chunk_refresh_delay(Duration::ZERO)
    }
}

/// Builds a replicator over a simulated fleet.
///
/// Nodes are numbered from 1. Node `n` sits in rack `n % racks` and is
/// filled to `0.3` on every medium unless overridden.
pub struct FleetBuilder {
    node_count: u64,
    racks: Option<u32>,
    ssd: bool,
    config: ReplicatorConfig,
    placement: Option<Arc<dyn ChunkPlacement>>,
    fill_factors: Vec<(NodeId, MediumIndex, f64)>,
}

impl FleetBuilder {
    pub fn new(node_count: u64) -> Self {
        Self {
            node_count,
            racks: None,
            ssd: false,
            config: test_config(),
            placement: None,
            fill_factors: Vec::new(),
        }
    }

    /// Spread nodes over `racks` racks instead of one rack per node.
    pub fn racks(mut self, racks: u32) -> Self {
        self.racks = Some(racks);
        self
    }

    pub fn with_ssd(mut self) -> Self {
        self.ssd = true;
        self
    }

    pub fn config(mut self, config: ReplicatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn placement(mut self, placement: Arc<dyn ChunkPlacement>) -> Self {
        self.placement = Some(placement);
        self
    }

    pub fn fill_factor(mut self, node: NodeId, medium: MediumIndex, fill_factor: f64) -> Self {
        self.fill_factors.push((node, medium, fill_factor));
        self
    }

    pub fn build(self) -> ChunkReplicator {
        let mut state = ClusterState::new(CELL);
        state
            .register_medium(Medium::new(DEFAULT, "default"))
            .expect("register default medium");
        if self.ssd {
            state
                .register_medium(Medium::new(SSD, "ssd"))
                .expect("register ssd medium");
        }

        for id in 1..=self.node_count {
            let rack = match self.racks {
                Some(racks) => (id as u32) % racks,
                None => id as u32,
            };
            let mut node = Node::new(id, format!("10.0.0.{}:9012", id))
                .with_rack(rack)
                .with_fill_factor(DEFAULT, 0.3)
                .with_fill_factor(SSD, 0.3);
            for (node_id, medium, fill_factor) in &self.fill_factors {
                if *node_id == id {
                    node.set_fill_factor(*medium, Some(*fill_factor));
                }
            }
            state.insert_node(node).expect("insert node");
        }

        let placement = self
            .placement
            .unwrap_or_else(|| Arc::new(PlacementEngine::default()));
        ChunkReplicator::new(self.config, state, placement)
    }
}

pub fn enable(replicator: &mut ChunkReplicator) {
    replicator.apply_enablement(&EnablementVerdict::Enabled);
}

fn insert(replicator: &mut ChunkReplicator, chunk: Chunk, replicas: &[ChunkReplica]) -> ChunkId {
    let id = replicator.state_mut().insert_chunk(chunk).expect("insert chunk");
    for replica in replicas {
        replicator.add_replica(&id, *replica, false).expect("add replica");
    }
    id
}

/// Regular chunk with replicas on `nodes` in the default medium.
pub fn add_regular_chunk(replicator: &mut ChunkReplicator, rf: u32, nodes: &[NodeId]) -> ChunkId {
    let chunk = Chunk::regular(CELL)
        .with_properties(ChunkProperties::with_replication(DEFAULT, rf))
        .with_disk_size(64 * 1024 * 1024);
    let replicas: Vec<_> = nodes
        .iter()
        .map(|&node| ChunkReplica::new(node, GENERIC_REPLICA_INDEX, DEFAULT))
        .collect();
    insert(replicator, chunk, &replicas)
}

/// Erasure chunk with `(node, part)` replicas in the default medium.
pub fn add_erasure_chunk(
    replicator: &mut ChunkReplicator,
    codec: ErasureCodingConfig,
    parts: &[(NodeId, ReplicaIndex)],
) -> ChunkId {
    let chunk = Chunk::erasure(CELL, codec)
        .with_properties(ChunkProperties::with_replication(DEFAULT, 1).with_vital(true))
        .with_disk_size(16 * 1024 * 1024);
    let replicas: Vec<_> = parts
        .iter()
        .map(|&(node, part)| ChunkReplica::new(node, part, DEFAULT))
        .collect();
    insert(replicator, chunk, &replicas)
}

/// Sealed journal chunk with sealed and unsealed replicas.
pub fn add_sealed_journal(
    replicator: &mut ChunkReplicator,
    rf: u32,
    read_quorum: usize,
    sealed: &[NodeId],
    unsealed: &[NodeId],
) -> ChunkId {
    let mut chunk =
        Chunk::journal(CELL, read_quorum).with_properties(ChunkProperties::with_replication(DEFAULT, rf));
    chunk.seal();
    let replicas: Vec<_> = sealed
        .iter()
        .map(|&node| ChunkReplica::new(node, SEALED_REPLICA_INDEX, DEFAULT))
        .chain(
            unsealed
                .iter()
                .map(|&node| ChunkReplica::new(node, UNSEALED_REPLICA_INDEX, DEFAULT)),
        )
        .collect();
    insert(replicator, chunk, &replicas)
}

/// Placement that hands out at most `max_targets` write targets per request.
pub struct CappedPlacement {
    inner: PlacementEngine,
    max_targets: usize,
}

impl CappedPlacement {
    pub fn new(max_targets: usize) -> Self {
        Self {
            inner: PlacementEngine::default(),
            max_targets,
        }
    }
}

impl ChunkPlacement for CappedPlacement {
    fn allocate_write_targets(
        &self,
        state: &ClusterState,
        medium: MediumIndex,
        chunk: &Chunk,
        desired_count: usize,
        min_count: usize,
        replication_factor_override: Option<u32>,
        session: SessionKind,
    ) -> Vec<NodeId> {
        let mut targets = self.inner.allocate_write_targets(
            state,
            medium,
            chunk,
            desired_count,
            min_count,
            replication_factor_override,
            session,
        );
        targets.truncate(self.max_targets);
        targets
    }

    fn allocate_balancing_target(
        &self,
        state: &ClusterState,
        medium: MediumIndex,
        chunk: &Chunk,
        max_fill_factor: f64,
    ) -> Option<NodeId> {
        self.inner
            .allocate_balancing_target(state, medium, chunk, max_fill_factor)
    }

    fn max_replicas_per_rack(
        &self,
        chunk: &Chunk,
        medium: MediumIndex,
        replication_factor_override: Option<u32>,
    ) -> usize {
        self.inner
            .max_replicas_per_rack(chunk, medium, replication_factor_override)
    }

    fn has_balancing_targets(&self, state: &ClusterState, medium: MediumIndex, max_fill_factor: f64) -> bool {
        self.inner.has_balancing_targets(state, medium, max_fill_factor)
    }

    fn balancing_chunks(
        &self,
        state: &ClusterState,
        medium: MediumIndex,
        node: NodeId,
        max_count: usize,
    ) -> Vec<ChunkIdWithIndexes> {
        self.inner.balancing_chunks(state, medium, node, max_count)
    }

    fn removal_target(&self, state: &ClusterState, replica: &ChunkIdWithIndexes) -> Option<NodeId> {
        self.inner.removal_target(state, replica)
    }
}
