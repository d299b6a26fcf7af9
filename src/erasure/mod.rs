//! Erasure codec capability surface.
//!
//! The replicator never encodes or decodes data itself. It only needs to know
//! how many parts a codec produces, which of them are data parts, and whether
//! a chunk can still be reconstructed given a set of erased part indexes.

use crate::error::{ReplicatorError, Result};
use crate::types::MAX_TOTAL_PART_COUNT;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Set of erasure part indexes packed into a bitmask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PartIndexSet(u32);

impl PartIndexSet {
    pub const EMPTY: PartIndexSet = PartIndexSet(0);

    /// Set containing every representable part index.
    pub fn full() -> Self {
        Self((1u32 << MAX_TOTAL_PART_COUNT) - 1)
    }

    pub fn insert(&mut self, index: usize) {
        debug_assert!(index < MAX_TOTAL_PART_COUNT);
        self.0 |= 1 << index;
    }

    pub fn contains(&self, index: usize) -> bool {
        index < MAX_TOTAL_PART_COUNT && self.0 & (1 << index) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn intersection(&self, other: &PartIndexSet) -> PartIndexSet {
        PartIndexSet(self.0 & other.0)
    }

    /// Whether any index in `range` is a member.
    pub fn any_in(&self, range: std::ops::Range<usize>) -> bool {
        range.into_iter().any(|index| self.contains(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_TOTAL_PART_COUNT).filter(move |&index| self.contains(index))
    }
}

impl fmt::Debug for PartIndexSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<usize> for PartIndexSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = PartIndexSet::EMPTY;
        for index in iter {
            set.insert(index);
        }
        set
    }
}

/// What the replicator needs to know about an erasure codec.
pub trait ErasureCodec {
    /// Total number of parts (data + parity).
    fn total_part_count(&self) -> usize;

    /// Number of data parts. Parts `0..data_part_count` are data parts.
    fn data_part_count(&self) -> usize;

    /// Whether the chunk can be reconstructed when the given parts are gone.
    fn can_repair(&self, erased: &PartIndexSet) -> bool;

    /// Number of parts that may be lost without losing the chunk.
    fn guaranteed_repairable_part_count(&self) -> usize {
        self.total_part_count() - self.data_part_count()
    }
}

/// Reed-Solomon coding parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErasureCodingConfig {
    /// Number of data parts (k).
    pub data_shards: usize,
    /// Number of parity parts (m).
    pub parity_shards: usize,
}

impl ErasureCodingConfig {
    /// 3+3, tolerates any three lost parts.
    pub const REED_SOLOMON_3_3: Self = Self {
        data_shards: 3,
        parity_shards: 3,
    };

    /// 6+3, the usual cold storage layout.
    pub const REED_SOLOMON_6_3: Self = Self {
        data_shards: 6,
        parity_shards: 3,
    };

    /// 10+4 for cost-optimized storage (1.4x overhead).
    pub const COST_OPTIMIZED: Self = Self {
        data_shards: 10,
        parity_shards: 4,
    };

    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        let config = Self {
            data_shards,
            parity_shards,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    pub fn storage_overhead(&self) -> f64 {
        self.total_shards() as f64 / self.data_shards as f64
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_shards == 0 {
            return Err(ReplicatorError::InvalidConfig {
                field: "erasure.data_shards".to_string(),
                reason: "Data shards must be non-zero".to_string(),
            });
        }
        if self.total_shards() > MAX_TOTAL_PART_COUNT {
            return Err(ReplicatorError::InvalidConfig {
                field: "erasure.parity_shards".to_string(),
                reason: format!("At most {} parts are supported", MAX_TOTAL_PART_COUNT),
            });
        }
        Ok(())
    }
}

impl Default for ErasureCodingConfig {
    fn default() -> Self {
        Self::REED_SOLOMON_6_3
    }
}

impl ErasureCodec for ErasureCodingConfig {
    fn total_part_count(&self) -> usize {
        self.total_shards()
    }

    fn data_part_count(&self) -> usize {
        self.data_shards
    }

    fn can_repair(&self, erased: &PartIndexSet) -> bool {
        erased.len() <= self.parity_shards
    }
}

impl fmt::Display for ErasureCodingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reed_solomon_{}_{}", self.data_shards, self.parity_shards)
    }
}
