//! Placement: deciding which nodes receive, give up or balance replicas.
//!
//! The replicator only talks to placement through the [`ChunkPlacement`]
//! trait. [`PlacementEngine`] is the default rack- and fill-factor-aware
//! implementation.

use super::chunk::{Chunk, ChunkLayout};
use super::node::Node;
use super::state::ClusterState;
use crate::config::PlacementConfig;
use crate::erasure::ErasureCodec;
use crate::types::*;
use rand::seq::SliceRandom;
use rand::thread_rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Why write targets are being allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    User,
    Replication,
    Repair,
}

/// Placement capability consumed by the replicator.
pub trait ChunkPlacement: Send + Sync {
    /// Pick up to `desired_count` nodes to receive new replicas of `chunk` on
    /// `medium`. Returns an empty list if fewer than `min_count` qualify.
    #[allow(clippy::too_many_arguments)]
    fn allocate_write_targets(
        &self,
        state: &ClusterState,
        medium: MediumIndex,
        chunk: &Chunk,
        desired_count: usize,
        min_count: usize,
        replication_factor_override: Option<u32>,
        session: SessionKind,
    ) -> Vec<NodeId>;

    /// Pick a node filled below `max_fill_factor` to receive a balancing copy.
    fn allocate_balancing_target(
        &self,
        state: &ClusterState,
        medium: MediumIndex,
        chunk: &Chunk,
        max_fill_factor: f64,
    ) -> Option<NodeId>;

    /// Upper bound on replicas of `chunk` sharing one rack on `medium`.
    fn max_replicas_per_rack(
        &self,
        chunk: &Chunk,
        medium: MediumIndex,
        replication_factor_override: Option<u32>,
    ) -> usize;

    /// Whether any node on `medium` is filled below `max_fill_factor`.
    fn has_balancing_targets(&self, state: &ClusterState, medium: MediumIndex, max_fill_factor: f64) -> bool;

    /// Replicas on `node` that may be moved off it.
    fn balancing_chunks(
        &self,
        state: &ClusterState,
        medium: MediumIndex,
        node: NodeId,
        max_count: usize,
    ) -> Vec<ChunkIdWithIndexes>;

    /// Which holder of `replica` should drop its copy.
    fn removal_target(&self, state: &ClusterState, replica: &ChunkIdWithIndexes) -> Option<NodeId>;
}

/// Ordering of candidate nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStrategy {
    /// Shuffle candidates.
    Random,
    /// Prefer racks holding the fewest replicas of the chunk.
    SpreadDomains,
    /// Prefer the emptiest nodes.
    LeastLoaded,
}

/// Default placement engine.
#[derive(Debug, Clone)]
pub struct PlacementEngine {
    config: PlacementConfig,
}

impl PlacementEngine {
    pub fn new(config: PlacementConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    /// Replicas of `chunk` already on `medium`, per rack.
    fn rack_usage(state: &ClusterState, chunk: &Chunk, medium: MediumIndex) -> HashMap<RackId, usize> {
        let mut usage = HashMap::new();
        for replica in chunk.stored_replicas().iter().filter(|r| r.medium == medium) {
            if let Some(rack) = state.node(&replica.node).and_then(Node::rack) {
                *usage.entry(rack).or_insert(0) += 1;
            }
        }
        usage
    }

    fn is_valid_target(&self, node: &Node, medium: MediumIndex, holders: &HashSet<NodeId>, max_fill_factor: f64) -> bool {
        node.is_online()
            && !node.is_decommissioned()
            && !holders.contains(&node.id())
            && node.fill_factor(medium).map_or(false, |f| f < max_fill_factor)
    }

    /// Candidates ordered by strategy.
    fn order_candidates<'a>(&self, mut candidates: Vec<&'a Node>, medium: MediumIndex, rack_usage: &HashMap<RackId, usize>) -> Vec<&'a Node> {
        let fill = |node: &&Node| node.fill_factor(medium).unwrap_or(1.0);
        match self.config.strategy {
            PlacementStrategy::Random => {
                candidates.shuffle(&mut thread_rng());
            }
            PlacementStrategy::SpreadDomains => {
                candidates.sort_by(|a, b| {
                    let used_a = a.rack().map_or(0, |r| rack_usage.get(&r).copied().unwrap_or(0));
                    let used_b = b.rack().map_or(0, |r| rack_usage.get(&r).copied().unwrap_or(0));
                    used_a
                        .cmp(&used_b)
                        .then(fill(a).partial_cmp(&fill(b)).unwrap_or(std::cmp::Ordering::Equal))
                        .then(a.id().cmp(&b.id()))
                });
            }
            PlacementStrategy::LeastLoaded => {
                candidates.sort_by(|a, b| {
                    fill(a)
                        .partial_cmp(&fill(b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.id().cmp(&b.id()))
                });
            }
        }
        candidates
    }

    fn holders(chunk: &Chunk, medium: MediumIndex) -> HashSet<NodeId> {
        chunk
            .stored_replicas()
            .iter()
            .filter(|r| r.medium == medium)
            .map(|r| r.node)
            .collect()
    }

    /// Greedily pick up to `count` candidates without exceeding the rack cap.
    fn pick(
        &self,
        state: &ClusterState,
        chunk: &Chunk,
        medium: MediumIndex,
        count: usize,
        max_fill_factor: f64,
        replication_factor_override: Option<u32>,
    ) -> Vec<NodeId> {
        let holders = Self::holders(chunk, medium);
        let mut rack_usage = Self::rack_usage(state, chunk, medium);
        let max_per_rack = self.max_replicas_per_rack(chunk, medium, replication_factor_override);

        let candidates: Vec<&Node> = state
            .nodes()
            .filter(|node| self.is_valid_target(node, medium, &holders, max_fill_factor))
            .collect();
        let ordered = self.order_candidates(candidates, medium, &rack_usage);

        let mut result = Vec::with_capacity(count);
        for node in ordered {
            if result.len() >= count {
                break;
            }
            if let Some(rack) = node.rack() {
                let used = rack_usage.entry(rack).or_insert(0);
                if *used >= max_per_rack {
                    continue;
                }
                *used += 1;
            }
            result.push(node.id());
        }
        result
    }
}

impl Default for PlacementEngine {
    fn default() -> Self {
        Self::new(PlacementConfig::default())
    }
}

impl ChunkPlacement for PlacementEngine {
    fn allocate_write_targets(
        &self,
        state: &ClusterState,
        medium: MediumIndex,
        chunk: &Chunk,
        desired_count: usize,
        min_count: usize,
        replication_factor_override: Option<u32>,
        _session: SessionKind,
    ) -> Vec<NodeId> {
        let targets = self.pick(
            state,
            chunk,
            medium,
            desired_count,
            self.config.max_fill_factor,
            replication_factor_override,
        );
        if targets.len() < min_count {
            return Vec::new();
        }
        targets
    }

    fn allocate_balancing_target(
        &self,
        state: &ClusterState,
        medium: MediumIndex,
        chunk: &Chunk,
        max_fill_factor: f64,
    ) -> Option<NodeId> {
        let ceiling = max_fill_factor.min(self.config.max_fill_factor);
        self.pick(state, chunk, medium, 1, ceiling, None).into_iter().next()
    }

    fn max_replicas_per_rack(
        &self,
        chunk: &Chunk,
        medium: MediumIndex,
        replication_factor_override: Option<u32>,
    ) -> usize {
        let replication_factor =
            replication_factor_override.unwrap_or_else(|| chunk.replication_factor(medium)) as usize;
        let per_chunk = match chunk.layout() {
            ChunkLayout::Regular => replication_factor.saturating_sub(1).max(1),
            ChunkLayout::Erasure { codec } => codec.guaranteed_repairable_part_count().max(1),
            ChunkLayout::Journal { read_quorum, .. } => {
                replication_factor.saturating_sub(*read_quorum).max(1)
            }
        };
        per_chunk.min(self.config.max_replicas_per_rack)
    }

    fn has_balancing_targets(&self, state: &ClusterState, medium: MediumIndex, max_fill_factor: f64) -> bool {
        state.nodes().any(|node| {
            node.is_online()
                && !node.is_decommissioned()
                && node.fill_factor(medium).map_or(false, |f| f < max_fill_factor)
        })
    }

    fn balancing_chunks(
        &self,
        state: &ClusterState,
        medium: MediumIndex,
        node: NodeId,
        max_count: usize,
    ) -> Vec<ChunkIdWithIndexes> {
        let Some(node) = state.node(&node) else {
            return Vec::new();
        };
        node.replicas()
            .iter()
            .filter(|replica| replica.medium == medium)
            .filter(|replica| {
                state.chunk(&replica.id).map_or(false, |chunk| {
                    chunk.is_confirmed()
                        && !chunk.is_job_scheduled()
                        && !chunk.is_journal()
                        && chunk
                            .stored_replicas()
                            .iter()
                            .any(|r| r.node == node.id() && r.medium == medium)
                })
            })
            .take(max_count)
            .copied()
            .collect()
    }

    fn removal_target(&self, state: &ClusterState, replica: &ChunkIdWithIndexes) -> Option<NodeId> {
        let chunk = state.chunk(&replica.id)?;
        let rack_usage = Self::rack_usage(state, chunk, replica.medium);
        chunk
            .stored_replicas()
            .iter()
            .filter(|r| r.medium == replica.medium && r.replica_index == replica.replica_index)
            .filter_map(|r| state.node(&r.node))
            .filter(|node| node.is_online())
            .max_by(|a, b| {
                let crowd_a = a.rack().map_or(0, |r| rack_usage.get(&r).copied().unwrap_or(0));
                let crowd_b = b.rack().map_or(0, |r| rack_usage.get(&r).copied().unwrap_or(0));
                crowd_a
                    .cmp(&crowd_b)
                    .then(
                        a.fill_factor(replica.medium)
                            .unwrap_or(0.0)
                            .partial_cmp(&b.fill_factor(replica.medium).unwrap_or(0.0))
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
                    .then(b.id().cmp(&a.id()))
            })
            .map(Node::id)
    }
}
