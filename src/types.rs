//! Core identifiers and small value types shared by the replicator.
//!
//! # Identifiers
//!
//! - [`ChunkId`]: 128-bit id carrying the chunk kind and the owning cell tag
//! - [`JobId`]: random job id
//! - [`NodeId`], [`ChunkListId`], [`OwnerId`] = `u64`
//! - [`MediumIndex`] = `usize`, bounded by [`MAX_MEDIUM_COUNT`]
//!
//! # Replica indexes
//!
//! A replica index is the part index `0..total_parts` for erasure chunks,
//! [`GENERIC_REPLICA_INDEX`] for regular chunks, and
//! [`SEALED_REPLICA_INDEX`]/[`UNSEALED_REPLICA_INDEX`] for journal chunks.
//!
//! ```rust
//! use chunk_replicator::types::{ChunkId, ChunkKind};
//!
//! let id = ChunkId::new(ChunkKind::Erasure, 7);
//! assert_eq!(id.kind(), Some(ChunkKind::Erasure));
//! assert_eq!(id.cell_tag(), 7);
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};
use uuid::Uuid;

/// Unique identifier for a storage node.
pub type NodeId = u64;

/// Unique identifier for a chunk list.
pub type ChunkListId = u64;

/// Unique identifier for an owning object attached to a chunk list.
pub type OwnerId = u64;

/// Index of a storage medium in the medium catalog.
pub type MediumIndex = usize;

/// Identifier of a rack.
pub type RackId = u32;

/// Tag of the master cell that owns an object.
pub type CellTag = u16;

/// Replica index of a chunk replica.
pub type ReplicaIndex = usize;

/// Maximum number of media a cluster may register.
pub const MAX_MEDIUM_COUNT: usize = 8;

/// Medium every journal chunk lives on.
pub const DEFAULT_STORE_MEDIUM_INDEX: MediumIndex = 0;

/// Maximum number of erasure parts a codec may produce.
pub const MAX_TOTAL_PART_COUNT: usize = 16;

/// Replica index used by regular chunks.
pub const GENERIC_REPLICA_INDEX: ReplicaIndex = 16;

/// Replica index of a sealed journal replica.
pub const SEALED_REPLICA_INDEX: ReplicaIndex = GENERIC_REPLICA_INDEX;

/// Replica index of an unsealed journal replica.
pub const UNSEALED_REPLICA_INDEX: ReplicaIndex = 17;

/// Exclusive bound of all replica indexes.
pub const REPLICA_INDEX_BOUND: usize = 32;

/// Kind of a chunk, encoded into its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkKind {
    /// Plain replicated chunk.
    Regular,
    /// Erasure-coded chunk split into data and parity parts.
    Erasure,
    /// Append-only quorum-written chunk.
    Journal,
}

impl ChunkKind {
    fn code(self) -> u16 {
        match self {
            ChunkKind::Regular => 100,
            ChunkKind::Erasure => 102,
            ChunkKind::Journal => 103,
        }
    }

    fn from_code(code: u16) -> Option<Self> {
        match code {
            100 => Some(ChunkKind::Regular),
            102 => Some(ChunkKind::Erasure),
            103 => Some(ChunkKind::Journal),
            _ => None,
        }
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkKind::Regular => write!(f, "regular"),
            ChunkKind::Erasure => write!(f, "erasure"),
            ChunkKind::Journal => write!(f, "journal"),
        }
    }
}

/// Unique identifier for a chunk.
///
/// The lowest 16 bits hold the chunk kind, the next 16 bits hold the cell
/// tag and the remaining 96 bits are random.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub u128);

impl ChunkId {
    /// Generate a fresh id for a chunk of the given kind owned by `cell_tag`.
    pub fn new(kind: ChunkKind, cell_tag: CellTag) -> Self {
        let random: u128 = rand::thread_rng().gen::<u128>() >> 32;
        Self::from_parts(kind, cell_tag, random)
    }

    /// Build an id from explicit parts. Only the low 96 bits of `counter` are kept.
    pub fn from_parts(kind: ChunkKind, cell_tag: CellTag, counter: u128) -> Self {
        let counter = counter & ((1u128 << 96) - 1);
        Self((counter << 32) | ((cell_tag as u128) << 16) | kind.code() as u128)
    }

    /// Kind encoded in the id, if it is a chunk id at all.
    pub fn kind(&self) -> Option<ChunkKind> {
        ChunkKind::from_code((self.0 & 0xffff) as u16)
    }

    /// Cell tag encoded in the id.
    pub fn cell_tag(&self) -> CellTag {
        ((self.0 >> 16) & 0xffff) as CellTag
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = [
            (self.0 >> 96) as u32,
            (self.0 >> 64) as u32,
            (self.0 >> 32) as u32,
            self.0 as u32,
        ];
        write!(f, "{:x}-{:x}-{:x}-{:x}", parts[0], parts[1], parts[2], parts[3])
    }
}

/// Unique identifier for a replicator job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A chunk replica: which node holds which part on which medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkReplica {
    pub node: NodeId,
    pub replica_index: ReplicaIndex,
    pub medium: MediumIndex,
}

impl ChunkReplica {
    pub fn new(node: NodeId, replica_index: ReplicaIndex, medium: MediumIndex) -> Self {
        Self {
            node,
            replica_index,
            medium,
        }
    }
}

/// A chunk together with a replica index and a medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkIdWithIndexes {
    pub id: ChunkId,
    pub replica_index: ReplicaIndex,
    pub medium: MediumIndex,
}

impl ChunkIdWithIndexes {
    pub fn new(id: ChunkId, replica_index: ReplicaIndex, medium: MediumIndex) -> Self {
        Self {
            id,
            replica_index,
            medium,
        }
    }

    /// Key of the removal queue entry this replica belongs to.
    pub fn without_medium(&self) -> ChunkIdWithIndex {
        ChunkIdWithIndex {
            id: self.id,
            replica_index: self.replica_index,
        }
    }
}

impl fmt::Display for ChunkIdWithIndexes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.id, self.replica_index, self.medium)
    }
}

/// A chunk together with a replica index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkIdWithIndex {
    pub id: ChunkId,
    pub replica_index: ReplicaIndex,
}

impl ChunkIdWithIndex {
    pub fn with_medium(&self, medium: MediumIndex) -> ChunkIdWithIndexes {
        ChunkIdWithIndexes::new(self.id, self.replica_index, medium)
    }
}

/// Set of medium indexes packed into a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MediumSet(u32);

impl MediumSet {
    pub const EMPTY: MediumSet = MediumSet(0);

    /// Set containing every possible medium.
    pub fn all() -> Self {
        Self((1u32 << MAX_MEDIUM_COUNT) - 1)
    }

    pub fn single(medium: MediumIndex) -> Self {
        let mut set = Self::EMPTY;
        set.insert(medium);
        set
    }

    pub fn insert(&mut self, medium: MediumIndex) {
        debug_assert!(medium < MAX_MEDIUM_COUNT);
        self.0 |= 1 << medium;
    }

    pub fn remove(&mut self, medium: MediumIndex) {
        self.0 &= !(1 << medium);
    }

    /// Remove every medium in `other` from this set.
    pub fn remove_all(&mut self, other: MediumSet) {
        self.0 &= !other.0;
    }

    pub fn contains(&self, medium: MediumIndex) -> bool {
        medium < MAX_MEDIUM_COUNT && self.0 & (1 << medium) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterate member media in ascending index order.
    pub fn iter(&self) -> impl Iterator<Item = MediumIndex> + '_ {
        (0..MAX_MEDIUM_COUNT).filter(move |&medium| self.contains(medium))
    }
}

/// Dense per-medium array with O(1) lookup by medium index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerMedium<T>(Vec<T>);

impl<T: Default> Default for PerMedium<T> {
    fn default() -> Self {
        Self((0..MAX_MEDIUM_COUNT).map(|_| T::default()).collect())
    }
}

impl<T> PerMedium<T> {
    /// Build an array by evaluating `f` for every medium index.
    pub fn from_fn(f: impl FnMut(MediumIndex) -> T) -> Self {
        Self((0..MAX_MEDIUM_COUNT).map(f).collect())
    }

    pub fn get(&self, medium: MediumIndex) -> Option<&T> {
        self.0.get(medium)
    }

    pub fn get_mut(&mut self, medium: MediumIndex) -> Option<&mut T> {
        self.0.get_mut(medium)
    }

    pub fn iter(&self) -> impl Iterator<Item = (MediumIndex, &T)> {
        self.0.iter().enumerate()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (MediumIndex, &mut T)> {
        self.0.iter_mut().enumerate()
    }
}

impl<T> Index<MediumIndex> for PerMedium<T> {
    type Output = T;

    fn index(&self, medium: MediumIndex) -> &T {
        &self.0[medium]
    }
}

impl<T> IndexMut<MediumIndex> for PerMedium<T> {
    fn index_mut(&mut self, medium: MediumIndex) -> &mut T {
        &mut self.0[medium]
    }
}
