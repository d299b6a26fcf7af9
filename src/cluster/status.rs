//! Chunk status computation.
//!
//! [`StatusEngine::compute`] derives per-medium and cross-medium status flags
//! from a chunk's stored replicas. It never mutates anything, so calling it
//! twice on an unchanged chunk yields identical statistics.
//!
//! Per medium a chunk may be:
//!
//! | flag | meaning |
//! |------|---------|
//! | `LOST` | no replica at all |
//! | `UNDERREPLICATED` | fewer live replicas than the replication factor |
//! | `OVERREPLICATED` | decommissioned copies to drop or more live copies than needed |
//! | `UNSAFELY_PLACED` | too many replicas share a rack |
//! | `DATA_MISSING` / `PARITY_MISSING` | erasure parts absent everywhere on the medium |
//! | `QUORUM_MISSING` | journal chunk below its read quorum |
//! | `SEALED` | journal chunk is sealed |

use super::chunk::{Chunk, ChunkLayout};
use super::placement::ChunkPlacement;
use super::state::ClusterState;
use crate::erasure::{ErasureCodec, ErasureCodingConfig, PartIndexSet};
use crate::types::*;
use std::collections::{HashMap, HashSet};
use std::fmt;

macro_rules! status_flags {
    ($name:ident, $repr:ty, { $($flag:ident = $bit:expr,)+ }) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name($repr);

        impl $name {
            pub const NONE: $name = $name(0);
            $(pub const $flag: $name = $name(1 << $bit);)+

            /// Whether every bit of `flag` is set.
            pub fn has(self, flag: $name) -> bool {
                flag.0 != 0 && self.0 & flag.0 == flag.0
            }

            /// Whether any bit of `flags` is set.
            pub fn has_any(self, flags: $name) -> bool {
                self.0 & flags.0 != 0
            }

            pub fn insert(&mut self, flag: $name) {
                self.0 |= flag.0;
            }

            pub fn remove(&mut self, flag: $name) {
                self.0 &= !flag.0;
            }

            pub fn is_none(self) -> bool {
                self.0 == 0
            }

            pub fn bits(self) -> $repr {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_none() {
                    return write!(f, "None");
                }
                let names: Vec<&str> = [$((stringify!($flag), $name::$flag)),+]
                    .iter()
                    .filter(|(_, flag)| self.has(*flag))
                    .map(|(name, _)| *name)
                    .collect();
                write!(f, "{}", names.join("|"))
            }
        }
    };
}

status_flags!(ChunkStatus, u16, {
    LOST = 0,
    UNDERREPLICATED = 1,
    OVERREPLICATED = 2,
    UNSAFELY_PLACED = 3,
    DATA_MISSING = 4,
    PARITY_MISSING = 5,
    QUORUM_MISSING = 6,
    SEALED = 7,
});

status_flags!(CrossMediumStatus, u8, {
    LOST = 0,
    MEDIUM_WISE_LOST = 1,
    DATA_MISSING = 2,
    PARITY_MISSING = 3,
    PRECARIOUS = 4,
});

/// What the refresh pass needs to know about a chunk on one medium.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PerMediumStatistics {
    pub status: ChunkStatus,
    /// Live replicas per replica index.
    pub replica_count: [u32; REPLICA_INDEX_BOUND],
    /// Decommissioned replicas per replica index.
    pub decommissioned_replica_count: [u32; REPLICA_INDEX_BOUND],
    /// Decommissioned replicas to remove.
    pub decommissioned_removal_replicas: Vec<ChunkReplica>,
    /// Replica indexes with a surplus live copy.
    pub balancing_removal_indexes: Vec<ReplicaIndex>,
    /// Replica indexes that need another copy.
    pub replication_indexes: Vec<ReplicaIndex>,
}

/// Statistics of one chunk on every medium.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkStatistics {
    pub per_medium: PerMedium<PerMediumStatistics>,
    pub status: CrossMediumStatus,
}

impl ChunkStatistics {
    pub fn medium(&self, medium: MediumIndex) -> &PerMediumStatistics {
        &self.per_medium[medium]
    }

    /// Media with a non-empty status.
    pub fn statuses(&self) -> impl Iterator<Item = (MediumIndex, ChunkStatus)> + '_ {
        self.per_medium
            .iter()
            .filter(|(_, stats)| !stats.status.is_none())
            .map(|(medium, stats)| (medium, stats.status))
    }
}

/// Computes [`ChunkStatistics`] against the current cluster state.
pub struct StatusEngine<'a> {
    state: &'a ClusterState,
    placement: &'a dyn ChunkPlacement,
}

impl<'a> StatusEngine<'a> {
    pub fn new(state: &'a ClusterState, placement: &'a dyn ChunkPlacement) -> Self {
        Self { state, placement }
    }

    pub fn compute(&self, chunk: &Chunk) -> ChunkStatistics {
        match chunk.layout() {
            ChunkLayout::Regular => self.compute_regular(chunk),
            ChunkLayout::Erasure { codec } => self.compute_erasure(chunk, codec),
            ChunkLayout::Journal { .. } => self.compute_journal(chunk),
        }
    }

    fn is_transient(&self, medium: MediumIndex) -> bool {
        self.state.media().get(medium).map_or(false, |m| m.transient)
    }

    fn rack_of(&self, replica: &ChunkReplica) -> Option<RackId> {
        self.state.node(&replica.node).and_then(|node| node.rack())
    }

    fn compute_regular(&self, chunk: &Chunk) -> ChunkStatistics {
        let mut result = ChunkStatistics::default();

        let mut live: PerMedium<u32> = PerMedium::default();
        let mut decommissioned: PerMedium<u32> = PerMedium::default();
        let mut decommissioned_replicas: PerMedium<Vec<ChunkReplica>> = PerMedium::default();
        let mut has_unsafe_replica: PerMedium<bool> = PerMedium::default();
        let mut rack_counters: HashMap<(MediumIndex, RackId), usize> = HashMap::new();

        for replica in chunk.stored_replicas() {
            let medium = replica.medium;
            if self.state.is_replica_decommissioned(replica) {
                decommissioned[medium] += 1;
                decommissioned_replicas[medium].push(*replica);
            } else {
                live[medium] += 1;
            }
            // Every stored replica occupies its rack, decommissioned or not.
            if let Some(rack) = self.rack_of(replica) {
                let counter = rack_counters.entry((medium, rack)).or_insert(0);
                *counter += 1;
                if *counter > self.placement.max_replicas_per_rack(chunk, medium, None) {
                    has_unsafe_replica[medium] = true;
                }
            }
        }

        let mut present_in_any_medium = false;
        let mut precarious = true;
        let mut all_media_transient = true;
        let mut lost_media = Vec::new();

        for medium in self.state.media().store_media() {
            let index = medium.index;
            let replication_factor = chunk.replication_factor(index);
            let replica_count = live[index];
            let decommissioned_count = decommissioned[index];

            if replication_factor == 0 && replica_count == 0 && decommissioned_count == 0 {
                continue;
            }
            all_media_transient = all_media_transient && medium.transient;

            let stats = &mut result.per_medium[index];
            stats.replica_count[GENERIC_REPLICA_INDEX] = replica_count;
            stats.decommissioned_replica_count[GENERIC_REPLICA_INDEX] = decommissioned_count;
            let total = replica_count + decommissioned_count;

            if total == 0 {
                stats.status.insert(ChunkStatus::LOST);
            } else if replica_count < replication_factor {
                stats.status.insert(ChunkStatus::UNDERREPLICATED);
            }
            if replica_count == replication_factor && decommissioned_count > 0 {
                stats.status.insert(ChunkStatus::OVERREPLICATED);
                stats.decommissioned_removal_replicas = decommissioned_replicas[index].clone();
            }
            if replica_count > replication_factor {
                stats.status.insert(ChunkStatus::OVERREPLICATED);
                stats.balancing_removal_indexes.push(GENERIC_REPLICA_INDEX);
            }

            let overreplicated = stats.status.has(ChunkStatus::OVERREPLICATED);
            if replication_factor > 1 && has_unsafe_replica[index] && !overreplicated {
                stats.status.insert(ChunkStatus::UNSAFELY_PLACED);
            }

            if stats
                .status
                .has_any(ChunkStatus::UNDERREPLICATED | ChunkStatus::UNSAFELY_PLACED)
                && !overreplicated
                && total > 0
            {
                stats.replication_indexes.push(GENERIC_REPLICA_INDEX);
            }

            if stats.status.has(ChunkStatus::LOST) {
                crate::invariant!(
                    stats.replica_count[GENERIC_REPLICA_INDEX] == 0,
                    "chunk {} is lost on medium {} with live replicas",
                    chunk.id(),
                    index
                );
                lost_media.push(index);
            } else {
                present_in_any_medium = true;
                precarious = precarious && medium.transient;
            }
        }

        if !present_in_any_medium {
            result.status.insert(CrossMediumStatus::LOST);
        } else {
            if precarious && !all_media_transient {
                result.status.insert(CrossMediumStatus::PRECARIOUS);
            }
            if !lost_media.is_empty() {
                result.status.insert(CrossMediumStatus::MEDIUM_WISE_LOST);
                for index in lost_media {
                    let stats = &mut result.per_medium[index];
                    stats.status.insert(ChunkStatus::UNDERREPLICATED);
                    stats.replication_indexes.push(GENERIC_REPLICA_INDEX);
                }
            }
        }

        result
    }

    fn compute_erasure(&self, chunk: &Chunk, codec: &ErasureCodingConfig) -> ChunkStatistics {
        let mut result = ChunkStatistics::default();
        let total_part_count = codec.total_part_count();
        let data_part_count = codec.data_part_count();

        let mut live: PerMedium<[u32; REPLICA_INDEX_BOUND]> = PerMedium::default();
        let mut decommissioned: PerMedium<[u32; REPLICA_INDEX_BOUND]> = PerMedium::default();
        let mut decommissioned_replicas: PerMedium<Vec<ChunkReplica>> = PerMedium::default();
        let mut unsafe_index: PerMedium<Option<ReplicaIndex>> = PerMedium::default();
        let mut rack_counters: HashMap<(MediumIndex, RackId), usize> = HashMap::new();
        // A node holding two parts on one medium only counts once.
        let mut visited: HashSet<(NodeId, MediumIndex)> = HashSet::new();

        for replica in chunk.stored_replicas() {
            let medium = replica.medium;
            let part = replica.replica_index;
            let first_on_node = visited.insert((replica.node, medium));
            if !first_on_node || self.state.is_replica_decommissioned(replica) {
                decommissioned[medium][part] += 1;
                decommissioned_replicas[medium].push(*replica);
            } else {
                live[medium][part] += 1;
            }
            if let Some(rack) = self.rack_of(replica) {
                let counter = rack_counters.entry((medium, rack)).or_insert(0);
                *counter += 1;
                if *counter > self.placement.max_replicas_per_rack(chunk, medium, None) {
                    unsafe_index[medium] = Some(part);
                }
            }
        }

        let mut all_media_transient = true;
        let mut all_media_data_parts_only = true;
        let mut active_media = MediumSet::EMPTY;
        let mut erased_per_medium: PerMedium<PartIndexSet> = PerMedium::default();

        for medium in self.state.media().store_media() {
            let index = medium.index;
            let replication_factor = chunk.replication_factor(index);
            let data_parts_only = chunk.local_properties().data_parts_only(index);

            let total_replicas: u32 = live[index].iter().sum::<u32>() + decommissioned[index].iter().sum::<u32>();
            if replication_factor == 0 && total_replicas == 0 {
                continue;
            }
            all_media_transient = all_media_transient && medium.transient;
            all_media_data_parts_only = all_media_data_parts_only && data_parts_only;
            active_media.insert(index);

            let stats = &mut result.per_medium[index];
            let mut erased = PartIndexSet::EMPTY;

            for part in 0..total_part_count {
                let removal_advised =
                    replication_factor == 0 || (part >= data_part_count && data_parts_only);
                let target = if removal_advised { 0 } else { 1 };
                let replica_count = live[index][part];
                let decommissioned_count = decommissioned[index][part];
                stats.replica_count[part] = replica_count;
                stats.decommissioned_replica_count[part] = decommissioned_count;

                if replica_count >= target && decommissioned_count > 0 {
                    stats.status.insert(ChunkStatus::OVERREPLICATED);
                    stats.decommissioned_removal_replicas.extend(
                        decommissioned_replicas[index]
                            .iter()
                            .filter(|r| r.replica_index == part),
                    );
                } else if replica_count > target && decommissioned_count == 0 {
                    stats.status.insert(ChunkStatus::OVERREPLICATED);
                    stats.balancing_removal_indexes.push(part);
                } else if replica_count == 0 && decommissioned_count > 0 && !removal_advised {
                    stats.status.insert(ChunkStatus::UNDERREPLICATED);
                    stats.replication_indexes.push(part);
                } else if replica_count == 0 && decommissioned_count == 0 && !removal_advised {
                    erased.insert(part);
                    if part < data_part_count {
                        stats.status.insert(ChunkStatus::DATA_MISSING);
                    } else {
                        stats.status.insert(ChunkStatus::PARITY_MISSING);
                    }
                }
            }

            if !erased.is_empty() && !codec.can_repair(&erased) {
                stats.status.insert(ChunkStatus::LOST);
            }

            if let Some(part) = unsafe_index[index] {
                if !stats.status.has(ChunkStatus::OVERREPLICATED) {
                    stats.status.insert(ChunkStatus::UNSAFELY_PLACED);
                    if stats.replication_indexes.is_empty() {
                        stats.replication_indexes.push(part);
                    }
                }
            }

            erased_per_medium[index] = erased;
        }

        if active_media.is_empty() {
            result.status.insert(CrossMediumStatus::LOST);
            return result;
        }

        let mut crossmedium_erased = PartIndexSet::full();
        let mut non_transient_erased = PartIndexSet::full();
        for index in active_media.iter() {
            crossmedium_erased = crossmedium_erased.intersection(&erased_per_medium[index]);
            if all_media_transient || !self.is_transient(index) {
                non_transient_erased = non_transient_erased.intersection(&erased_per_medium[index]);
            }
        }

        if crossmedium_erased.any_in(0..data_part_count) {
            result.status.insert(CrossMediumStatus::DATA_MISSING);
        }
        if crossmedium_erased.any_in(data_part_count..total_part_count) && !all_media_data_parts_only {
            result.status.insert(CrossMediumStatus::PARITY_MISSING);
        }

        let lost = !crossmedium_erased.is_empty() && !codec.can_repair(&crossmedium_erased);
        if lost {
            result.status.insert(CrossMediumStatus::LOST);
        } else {
            if !non_transient_erased.is_empty()
                && !codec.can_repair(&non_transient_erased)
                && !all_media_transient
            {
                result.status.insert(CrossMediumStatus::PRECARIOUS);
            }
            if active_media
                .iter()
                .any(|index| result.per_medium[index].status.has(ChunkStatus::LOST))
            {
                result.status.insert(CrossMediumStatus::MEDIUM_WISE_LOST);
            }
        }

        // Parts missing here but present on another medium can be copied over.
        for index in active_media.iter() {
            let stats = &mut result.per_medium[index];
            for part in erased_per_medium[index].iter() {
                if !crossmedium_erased.contains(part) {
                    stats.status.insert(ChunkStatus::UNDERREPLICATED);
                    stats.replication_indexes.push(part);
                }
            }
        }

        result
    }

    fn compute_journal(&self, chunk: &Chunk) -> ChunkStatistics {
        let mut result = ChunkStatistics::default();
        let medium = DEFAULT_STORE_MEDIUM_INDEX;
        let replication_factor = chunk.replication_factor(medium);
        let max_per_rack = self.placement.max_replicas_per_rack(chunk, medium, None);

        let mut replica_count = 0u32;
        let mut decommissioned_count = 0u32;
        let mut sealed_count = 0u32;
        let mut unsealed_count = 0u32;
        let mut has_unsafe_replica = false;
        let mut decommissioned_replicas = Vec::new();
        let mut rack_counters: HashMap<RackId, usize> = HashMap::new();

        for replica in chunk.stored_replicas().iter().filter(|r| r.medium == medium) {
            if replica.replica_index == SEALED_REPLICA_INDEX {
                sealed_count += 1;
            } else {
                unsealed_count += 1;
            }
            if self.state.is_replica_decommissioned(replica) {
                decommissioned_count += 1;
                decommissioned_replicas.push(*replica);
            } else {
                replica_count += 1;
            }
            if let Some(rack) = self.rack_of(replica) {
                let counter = rack_counters.entry(rack).or_insert(0);
                *counter += 1;
                if *counter > max_per_rack {
                    has_unsafe_replica = true;
                }
            }
        }

        let stats = &mut result.per_medium[medium];
        stats.replica_count[GENERIC_REPLICA_INDEX] = replica_count;
        stats.decommissioned_replica_count[GENERIC_REPLICA_INDEX] = decommissioned_count;
        let total = replica_count + decommissioned_count;

        if total == 0 {
            stats.status.insert(ChunkStatus::LOST);
        }

        if chunk.is_sealed() {
            stats.status.insert(ChunkStatus::SEALED);
            if replica_count < replication_factor && sealed_count > 0 {
                stats.status.insert(ChunkStatus::UNDERREPLICATED);
            }
            if replica_count == replication_factor
                && decommissioned_count > 0
                && unsealed_count == 0
            {
                stats.status.insert(ChunkStatus::OVERREPLICATED);
                stats.decommissioned_removal_replicas = decommissioned_replicas;
            }
            if replica_count > replication_factor && unsealed_count == 0 {
                stats.status.insert(ChunkStatus::OVERREPLICATED);
                stats.balancing_removal_indexes.push(GENERIC_REPLICA_INDEX);
            }
        }

        if (total as usize) < chunk.read_quorum() && sealed_count == 0 {
            stats.status.insert(ChunkStatus::QUORUM_MISSING);
        }

        if has_unsafe_replica {
            stats.status.insert(ChunkStatus::UNSAFELY_PLACED);
        }

        if stats
            .status
            .has_any(ChunkStatus::UNDERREPLICATED | ChunkStatus::UNSAFELY_PLACED)
            && !stats.status.has(ChunkStatus::OVERREPLICATED)
            && sealed_count > 0
        {
            stats.replication_indexes.push(GENERIC_REPLICA_INDEX);
        }

        if stats.status.has(ChunkStatus::LOST) {
            crate::invariant!(
                replica_count == 0,
                "journal chunk {} is lost with live replicas",
                chunk.id()
            );
            result.status.insert(CrossMediumStatus::LOST);
        }

        result
    }
}

impl std::ops::BitOr for ChunkStatus {
    type Output = ChunkStatus;

    fn bitor(self, other: ChunkStatus) -> ChunkStatus {
        ChunkStatus(self.0 | other.0)
    }
}

impl std::ops::BitOr for CrossMediumStatus {
    type Output = CrossMediumStatus;

    fn bitor(self, other: CrossMediumStatus) -> CrossMediumStatus {
        CrossMediumStatus(self.0 | other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::chunk::ChunkProperties;
    use crate::cluster::medium::Medium;
    use crate::cluster::node::Node;
    use crate::cluster::placement::PlacementEngine;

    const DEFAULT: MediumIndex = 0;
    const SSD: MediumIndex = 1;
    const RAM: MediumIndex = 2;

    struct Fixture {
        state: ClusterState,
        placement: PlacementEngine,
    }

    impl Fixture {
        /// Nodes `1..=node_count`, each in its own rack.
        fn new(node_count: u64) -> Self {
            let mut state = ClusterState::new(1);
            state.register_medium(Medium::new(DEFAULT, "default")).unwrap();
            state.register_medium(Medium::new(SSD, "ssd")).unwrap();
            state
                .register_medium(Medium::new(RAM, "ram").with_transient(true))
                .unwrap();
            for id in 1..=node_count {
                state
                    .insert_node(Node::new(id, format!("n{}:9012", id)).with_rack(id as RackId))
                    .unwrap();
            }
            Self {
                state,
                placement: PlacementEngine::default(),
            }
        }

        fn add_chunk(&mut self, chunk: Chunk) -> ChunkId {
            self.state.insert_chunk(chunk).unwrap()
        }

        fn add_replica(&mut self, id: ChunkId, node: NodeId, index: ReplicaIndex, medium: MediumIndex) {
            self.state
                .add_replica(&id, ChunkReplica::new(node, index, medium), false)
                .unwrap();
        }

        fn regular(&mut self, rf: u32, nodes: &[NodeId]) -> ChunkId {
            let id = self.add_chunk(
                Chunk::regular(1).with_properties(ChunkProperties::with_replication(DEFAULT, rf)),
            );
            for &node in nodes {
                self.add_replica(id, node, GENERIC_REPLICA_INDEX, DEFAULT);
            }
            id
        }

        fn compute(&self, id: ChunkId) -> ChunkStatistics {
            let chunk = self.state.chunk(&id).unwrap();
            StatusEngine::new(&self.state, &self.placement).compute(chunk)
        }
    }

    #[test]
    fn test_status_flag_helpers() {
        let mut status = ChunkStatus::NONE;
        assert!(status.is_none());
        assert!(!status.has(ChunkStatus::NONE));

        status.insert(ChunkStatus::UNDERREPLICATED);
        status.insert(ChunkStatus::SEALED);
        assert!(status.has(ChunkStatus::SEALED));
        assert!(status.has_any(ChunkStatus::LOST | ChunkStatus::SEALED));
        assert!(!status.has(ChunkStatus::LOST | ChunkStatus::SEALED));
        assert_eq!(format!("{:?}", status), "UNDERREPLICATED|SEALED");

        status.remove(ChunkStatus::SEALED);
        assert_eq!(status, ChunkStatus::UNDERREPLICATED);
        assert_eq!(format!("{:?}", CrossMediumStatus::NONE), "None");
    }

    #[test]
    fn test_healthy_regular_chunk() {
        let mut fx = Fixture::new(3);
        let id = fx.regular(1, &[1]);
        let stats = fx.compute(id);
        assert!(stats.medium(DEFAULT).status.is_none());
        assert!(stats.status.is_none());
        assert!(stats.medium(DEFAULT).replication_indexes.is_empty());
    }

    #[test]
    fn test_no_replicas_is_lost() {
        let mut fx = Fixture::new(3);
        let id = fx.regular(3, &[]);
        let stats = fx.compute(id);
        assert!(stats.medium(DEFAULT).status.has(ChunkStatus::LOST));
        assert!(stats.status.has(CrossMediumStatus::LOST));
        assert!(stats.medium(DEFAULT).replication_indexes.is_empty());
    }

    #[test]
    fn test_computation_is_idempotent() {
        let mut fx = Fixture::new(4);
        let id = fx.regular(3, &[1, 2]);
        fx.state.node_mut(&2).unwrap().set_decommissioned(true);
        assert_eq!(fx.compute(id), fx.compute(id));
    }

    #[test]
    fn test_underreplicated_requests_generic_index() {
        let mut fx = Fixture::new(3);
        let id = fx.regular(3, &[1]);
        let stats = fx.compute(id);
        let medium = stats.medium(DEFAULT);
        assert_eq!(medium.status, ChunkStatus::UNDERREPLICATED);
        assert_eq!(medium.replica_count[GENERIC_REPLICA_INDEX], 1);
        assert_eq!(medium.replication_indexes, vec![GENERIC_REPLICA_INDEX]);
        assert!(stats.status.is_none());
    }

    #[test]
    fn test_overreplicated_requests_balancing_removal() {
        let mut fx = Fixture::new(3);
        let id = fx.regular(2, &[1, 2, 3]);
        let stats = fx.compute(id);
        let medium = stats.medium(DEFAULT);
        assert_eq!(medium.status, ChunkStatus::OVERREPLICATED);
        assert_eq!(medium.balancing_removal_indexes, vec![GENERIC_REPLICA_INDEX]);
        assert!(medium.decommissioned_removal_replicas.is_empty());
        assert!(medium.replication_indexes.is_empty());
    }

    #[test]
    fn test_decommissioned_replica_is_removed_once_rf_is_met() {
        let mut fx = Fixture::new(3);
        let id = fx.regular(2, &[1, 2, 3]);
        fx.state.node_mut(&3).unwrap().set_decommissioned(true);
        let stats = fx.compute(id);
        let medium = stats.medium(DEFAULT);
        assert_eq!(medium.status, ChunkStatus::OVERREPLICATED);
        assert_eq!(
            medium.decommissioned_removal_replicas,
            vec![ChunkReplica::new(3, GENERIC_REPLICA_INDEX, DEFAULT)]
        );
        assert!(medium.balancing_removal_indexes.is_empty());
    }

    #[test]
    fn test_excess_live_replicas_balance_despite_decommissioned_replica() {
        let mut fx = Fixture::new(4);
        let id = fx.regular(2, &[1, 2, 3, 4]);
        fx.state.node_mut(&4).unwrap().set_decommissioned(true);
        let stats = fx.compute(id);
        let medium = stats.medium(DEFAULT);
        assert_eq!(medium.status, ChunkStatus::OVERREPLICATED);
        assert_eq!(medium.replica_count[GENERIC_REPLICA_INDEX], 3);
        assert_eq!(medium.decommissioned_replica_count[GENERIC_REPLICA_INDEX], 1);
        assert_eq!(medium.balancing_removal_indexes, vec![GENERIC_REPLICA_INDEX]);
        // Removing the decommissioned copy waits until live replicas match the factor.
        assert!(medium.decommissioned_removal_replicas.is_empty());
        assert!(medium.replication_indexes.is_empty());
    }

    #[test]
    fn test_decommissioned_replica_counts_toward_rack_limit() {
        let mut fx = Fixture::new(3);
        for id in 1..=3 {
            fx.state.remove_node(&id);
            fx.state
                .insert_node(Node::new(id, format!("n{}:9012", id)).with_rack(7))
                .unwrap();
        }
        let id = fx.regular(3, &[1, 2, 3]);
        fx.state.node_mut(&3).unwrap().set_decommissioned(true);

        let stats = fx.compute(id);
        let medium = stats.medium(DEFAULT);
        assert_eq!(
            medium.status,
            ChunkStatus::UNDERREPLICATED | ChunkStatus::UNSAFELY_PLACED
        );
        assert_eq!(medium.replication_indexes, vec![GENERIC_REPLICA_INDEX]);
    }

    #[test]
    fn test_decommissioned_only_is_not_lost() {
        let mut fx = Fixture::new(2);
        let id = fx.regular(1, &[1]);
        fx.state.node_mut(&1).unwrap().set_decommissioned(true);
        let stats = fx.compute(id);
        let medium = stats.medium(DEFAULT);
        assert_eq!(medium.status, ChunkStatus::UNDERREPLICATED);
        assert_eq!(medium.decommissioned_replica_count[GENERIC_REPLICA_INDEX], 1);
        assert_eq!(medium.replication_indexes, vec![GENERIC_REPLICA_INDEX]);
        assert!(!stats.status.has(CrossMediumStatus::LOST));
    }

    #[test]
    fn test_unsafely_placed_regular_chunk() {
        let mut fx = Fixture::new(3);
        for id in 1..=3 {
            fx.state.remove_node(&id);
            fx.state
                .insert_node(Node::new(id, format!("n{}:9012", id)).with_rack(7))
                .unwrap();
        }
        let id = fx.regular(3, &[1, 2, 3]);
        let stats = fx.compute(id);
        let medium = stats.medium(DEFAULT);
        assert_eq!(medium.status, ChunkStatus::UNSAFELY_PLACED);
        assert_eq!(medium.replication_indexes, vec![GENERIC_REPLICA_INDEX]);
    }

    #[test]
    fn test_medium_wise_lost_and_precarious() {
        let mut fx = Fixture::new(3);
        let properties = ChunkProperties::new()
            .with_medium(DEFAULT, 1, false)
            .with_medium(RAM, 1, false);
        let id = fx.add_chunk(Chunk::regular(1).with_properties(properties));
        fx.add_replica(id, 1, GENERIC_REPLICA_INDEX, RAM);

        let stats = fx.compute(id);
        assert!(stats.status.has(CrossMediumStatus::MEDIUM_WISE_LOST));
        assert!(stats.status.has(CrossMediumStatus::PRECARIOUS));
        assert!(!stats.status.has(CrossMediumStatus::LOST));

        let lost = stats.medium(DEFAULT);
        assert!(lost.status.has(ChunkStatus::LOST | ChunkStatus::UNDERREPLICATED));
        assert_eq!(lost.replication_indexes, vec![GENERIC_REPLICA_INDEX]);
        assert!(stats.medium(RAM).status.is_none());
    }

    #[test]
    fn test_all_transient_is_not_precarious() {
        let mut fx = Fixture::new(3);
        let id = fx.add_chunk(
            Chunk::regular(1).with_properties(ChunkProperties::with_replication(RAM, 1)),
        );
        fx.add_replica(id, 1, GENERIC_REPLICA_INDEX, RAM);
        assert!(fx.compute(id).status.is_none());
    }

    #[test]
    fn test_medium_with_zero_rf_and_no_replicas_is_skipped() {
        let mut fx = Fixture::new(3);
        let id = fx.regular(1, &[1]);
        let stats = fx.compute(id);
        assert!(stats.medium(SSD).status.is_none());
        assert_eq!(stats.statuses().count(), 0);
    }

    fn erasure(fx: &mut Fixture, properties: ChunkProperties, parts: &[(NodeId, ReplicaIndex, MediumIndex)]) -> ChunkId {
        let id = fx.add_chunk(
            Chunk::erasure(1, ErasureCodingConfig::REED_SOLOMON_6_3).with_properties(properties),
        );
        for &(node, part, medium) in parts {
            fx.add_replica(id, node, part, medium);
        }
        id
    }

    #[test]
    fn test_erasure_missing_parity_is_repairable() {
        let mut fx = Fixture::new(9);
        let parts: Vec<_> = (0..6).map(|p| (p as NodeId + 1, p, DEFAULT)).collect();
        let id = erasure(&mut fx, ChunkProperties::with_replication(DEFAULT, 1), &parts);

        let stats = fx.compute(id);
        let medium = stats.medium(DEFAULT);
        assert!(medium.status.has(ChunkStatus::PARITY_MISSING));
        assert!(!medium.status.has(ChunkStatus::DATA_MISSING));
        assert!(!medium.status.has(ChunkStatus::LOST));
        assert!(stats.status.has(CrossMediumStatus::PARITY_MISSING));
        assert!(!stats.status.has(CrossMediumStatus::LOST));
    }

    #[test]
    fn test_erasure_too_many_erased_parts_is_lost() {
        let mut fx = Fixture::new(9);
        let parts: Vec<_> = (4..9).map(|p| (p as NodeId + 1, p, DEFAULT)).collect();
        let id = erasure(&mut fx, ChunkProperties::with_replication(DEFAULT, 1), &parts);

        let stats = fx.compute(id);
        assert!(stats.medium(DEFAULT).status.has(ChunkStatus::LOST | ChunkStatus::DATA_MISSING));
        assert!(stats.status.has(CrossMediumStatus::LOST));
        assert!(stats.status.has(CrossMediumStatus::DATA_MISSING));
    }

    #[test]
    fn test_erasure_data_parts_only_medium_ignores_parity() {
        let mut fx = Fixture::new(9);
        let parts: Vec<_> = (0..6).map(|p| (p as NodeId + 1, p, DEFAULT)).collect();
        let properties = ChunkProperties::new().with_medium(DEFAULT, 1, true);
        let id = erasure(&mut fx, properties, &parts);

        let stats = fx.compute(id);
        assert!(stats.medium(DEFAULT).status.is_none());
        assert!(stats.status.is_none());
    }

    #[test]
    fn test_erasure_duplicate_part_on_node_counts_as_decommissioned() {
        let mut fx = Fixture::new(9);
        let mut parts: Vec<_> = (0..9)
            .filter(|&p| p != 1)
            .map(|p| (p as NodeId + 1, p, DEFAULT))
            .collect();
        // Node 1 claims part 1 in addition to part 0.
        parts.insert(1, (1, 1, DEFAULT));
        let id = erasure(&mut fx, ChunkProperties::with_replication(DEFAULT, 1), &parts);

        let stats = fx.compute(id);
        let medium = stats.medium(DEFAULT);
        assert_eq!(medium.decommissioned_replica_count[1], 1);
        assert_eq!(medium.replica_count[1], 0);
        assert!(medium.status.has(ChunkStatus::UNDERREPLICATED));
        assert_eq!(medium.replication_indexes, vec![1]);
    }

    #[test]
    fn test_erasure_parts_copied_across_media() {
        let mut fx = Fixture::new(9);
        let properties = ChunkProperties::new()
            .with_medium(DEFAULT, 1, false)
            .with_medium(SSD, 1, false);
        let mut parts: Vec<_> = (1..9).map(|p| (p as NodeId + 1, p, DEFAULT)).collect();
        parts.extend((0..8).map(|p| (p as NodeId + 1, p, SSD)));
        let id = erasure(&mut fx, properties, &parts);

        let stats = fx.compute(id);
        assert!(stats.status.is_none());
        let default = stats.medium(DEFAULT);
        assert!(default.status.has(ChunkStatus::DATA_MISSING | ChunkStatus::UNDERREPLICATED));
        assert_eq!(default.replication_indexes, vec![0]);
        let ssd = stats.medium(SSD);
        assert!(ssd.status.has(ChunkStatus::PARITY_MISSING | ChunkStatus::UNDERREPLICATED));
        assert_eq!(ssd.replication_indexes, vec![8]);
    }

    #[test]
    fn test_journal_quorum_missing() {
        let mut fx = Fixture::new(3);
        let id = fx.add_chunk(
            Chunk::journal(1, 2).with_properties(ChunkProperties::with_replication(DEFAULT, 3)),
        );
        fx.add_replica(id, 1, UNSEALED_REPLICA_INDEX, DEFAULT);

        let stats = fx.compute(id);
        assert_eq!(stats.medium(DEFAULT).status, ChunkStatus::QUORUM_MISSING);
        assert!(stats.status.is_none());
    }

    #[test]
    fn test_sealed_journal_underreplicated() {
        let mut fx = Fixture::new(3);
        let mut chunk =
            Chunk::journal(1, 2).with_properties(ChunkProperties::with_replication(DEFAULT, 3));
        chunk.seal();
        let id = fx.add_chunk(chunk);
        fx.add_replica(id, 1, SEALED_REPLICA_INDEX, DEFAULT);
        fx.add_replica(id, 2, UNSEALED_REPLICA_INDEX, DEFAULT);

        let stats = fx.compute(id);
        let medium = stats.medium(DEFAULT);
        assert!(medium.status.has(ChunkStatus::SEALED | ChunkStatus::UNDERREPLICATED));
        assert!(!medium.status.has(ChunkStatus::QUORUM_MISSING));
        assert_eq!(medium.replication_indexes, vec![GENERIC_REPLICA_INDEX]);
    }

    fn sealed_journal(fx: &mut Fixture, rf: u32, nodes: &[NodeId]) -> ChunkId {
        let mut chunk =
            Chunk::journal(1, 1).with_properties(ChunkProperties::with_replication(DEFAULT, rf));
        chunk.seal();
        let id = fx.add_chunk(chunk);
        for &node in nodes {
            fx.add_replica(id, node, SEALED_REPLICA_INDEX, DEFAULT);
        }
        id
    }

    #[test]
    fn test_sealed_journal_overreplicated_with_decommissioned_replicas() {
        let mut fx = Fixture::new(4);
        fx.state.node_mut(&4).unwrap().set_decommissioned(true);

        // Live replicas match the factor: only the decommissioned copy goes.
        let exact = sealed_journal(&mut fx, 2, &[1, 2, 4]);
        let stats = fx.compute(exact);
        let medium = stats.medium(DEFAULT);
        assert_eq!(medium.status, ChunkStatus::SEALED | ChunkStatus::OVERREPLICATED);
        assert_eq!(
            medium.decommissioned_removal_replicas,
            vec![ChunkReplica::new(4, SEALED_REPLICA_INDEX, DEFAULT)]
        );
        assert!(medium.balancing_removal_indexes.is_empty());

        // Too many live replicas: balance, keep the decommissioned copy for now.
        let excess = sealed_journal(&mut fx, 2, &[1, 2, 3, 4]);
        let stats = fx.compute(excess);
        let medium = stats.medium(DEFAULT);
        assert_eq!(medium.status, ChunkStatus::SEALED | ChunkStatus::OVERREPLICATED);
        assert_eq!(medium.balancing_removal_indexes, vec![GENERIC_REPLICA_INDEX]);
        assert!(medium.decommissioned_removal_replicas.is_empty());
        assert!(medium.replication_indexes.is_empty());
    }

    #[test]
    fn test_journal_without_replicas_is_lost() {
        let mut fx = Fixture::new(1);
        let id = fx.add_chunk(
            Chunk::journal(1, 1).with_properties(ChunkProperties::with_replication(DEFAULT, 3)),
        );
        let stats = fx.compute(id);
        assert!(stats.medium(DEFAULT).status.has(ChunkStatus::LOST));
        assert!(stats.status.has(CrossMediumStatus::LOST));
    }
}
