//! Chunk, chunk list and owner model.
//!
//! Chunks form the leaves of chunk trees. Chunk lists point up to their
//! parents and may carry owners (the objects that declared a replication
//! policy). A chunk's effective policy is derived from the nearest owners
//! found by walking parent links.

use crate::erasure::ErasureCodingConfig;
use crate::types::*;
use serde::{Deserialize, Serialize};

/// Replication policy of a chunk on one medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediumReplicationPolicy {
    /// Target number of live copies. Zero means the medium is not used.
    pub replication_factor: u32,
    /// Erasure chunks keep only data parts on this medium.
    pub data_parts_only: bool,
}

impl MediumReplicationPolicy {
    pub fn new(replication_factor: u32, data_parts_only: bool) -> Self {
        Self {
            replication_factor,
            data_parts_only,
        }
    }

    /// Whether the chunk should be stored on this medium at all.
    pub fn is_active(&self) -> bool {
        self.replication_factor > 0
    }
}

/// Per-medium replication policies plus the vital flag.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChunkProperties {
    pub media: PerMedium<MediumReplicationPolicy>,
    pub vital: bool,
}

impl ChunkProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Properties with a single active medium.
    pub fn with_replication(medium: MediumIndex, replication_factor: u32) -> Self {
        Self::new().with_medium(medium, replication_factor, false)
    }

    pub fn with_medium(
        mut self,
        medium: MediumIndex,
        replication_factor: u32,
        data_parts_only: bool,
    ) -> Self {
        self.media[medium] = MediumReplicationPolicy::new(replication_factor, data_parts_only);
        self
    }

    pub fn with_vital(mut self, vital: bool) -> Self {
        self.vital = vital;
        self
    }

    pub fn replication_factor(&self, medium: MediumIndex) -> u32 {
        self.media[medium].replication_factor
    }

    pub fn data_parts_only(&self, medium: MediumIndex) -> bool {
        self.media[medium].data_parts_only
    }

    /// Neutral starting point for [`ChunkProperties::combine`]:
    /// data-parts-only flags are ANDed so they start out set.
    pub fn combine_identity() -> Self {
        let mut properties = Self::default();
        for (_, policy) in properties.media.iter_mut() {
            policy.data_parts_only = true;
        }
        properties
    }

    /// Fold another owner's properties in: max of replication factors,
    /// AND of data-parts-only, OR of vitality.
    pub fn combine(&mut self, other: &ChunkProperties) {
        for (medium, policy) in self.media.iter_mut() {
            let theirs = &other.media[medium];
            policy.replication_factor = policy.replication_factor.max(theirs.replication_factor);
            policy.data_parts_only = policy.data_parts_only && theirs.data_parts_only;
        }
        self.vital = self.vital || other.vital;
    }

    /// Erasure chunks store each part once per medium.
    pub fn clamp_for_erasure(&mut self) {
        for (_, policy) in self.media.iter_mut() {
            if policy.is_active() {
                policy.replication_factor = 1;
            }
        }
    }

    /// Media with a non-zero replication factor.
    pub fn active_media(&self) -> impl Iterator<Item = MediumIndex> + '_ {
        self.media
            .iter()
            .filter(|(_, policy)| policy.is_active())
            .map(|(medium, _)| medium)
    }
}

/// Kind-specific part of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ChunkLayout {
    Regular,
    Erasure { codec: ErasureCodingConfig },
    Journal { read_quorum: usize, sealed: bool },
}

impl ChunkLayout {
    pub fn kind(&self) -> ChunkKind {
        match self {
            ChunkLayout::Regular => ChunkKind::Regular,
            ChunkLayout::Erasure { .. } => ChunkKind::Erasure,
            ChunkLayout::Journal { .. } => ChunkKind::Journal,
        }
    }
}

/// Token locating a chunk's entry in the repair queue.
pub type RepairQueueToken = i64;

/// A stored data unit and its replication state.
#[derive(Debug, Clone)]
pub struct Chunk {
    id: ChunkId,
    layout: ChunkLayout,
    confirmed: bool,
    disk_size: u64,
    local_properties: ChunkProperties,
    parents: Vec<ChunkListId>,
    stored_replicas: Vec<ChunkReplica>,
    cached_replicas: Vec<ChunkReplica>,
    job: Option<JobId>,
    repair_queue_tokens: PerMedium<Option<RepairQueueToken>>,
}

impl Chunk {
    /// Create a confirmed chunk with the given id and layout.
    pub fn new(id: ChunkId, layout: ChunkLayout) -> Self {
        Self {
            id,
            layout,
            confirmed: true,
            disk_size: 0,
            local_properties: ChunkProperties::default(),
            parents: Vec::new(),
            stored_replicas: Vec::new(),
            cached_replicas: Vec::new(),
            job: None,
            repair_queue_tokens: PerMedium::default(),
        }
    }

    pub fn regular(cell_tag: CellTag) -> Self {
        Self::new(ChunkId::new(ChunkKind::Regular, cell_tag), ChunkLayout::Regular)
    }

    pub fn erasure(cell_tag: CellTag, codec: ErasureCodingConfig) -> Self {
        Self::new(
            ChunkId::new(ChunkKind::Erasure, cell_tag),
            ChunkLayout::Erasure { codec },
        )
    }

    pub fn journal(cell_tag: CellTag, read_quorum: usize) -> Self {
        Self::new(
            ChunkId::new(ChunkKind::Journal, cell_tag),
            ChunkLayout::Journal {
                read_quorum,
                sealed: false,
            },
        )
    }

    pub fn with_properties(mut self, properties: ChunkProperties) -> Self {
        self.local_properties = properties;
        self
    }

    pub fn with_disk_size(mut self, disk_size: u64) -> Self {
        self.disk_size = disk_size;
        self
    }

    pub fn with_confirmed(mut self, confirmed: bool) -> Self {
        self.confirmed = confirmed;
        self
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn kind(&self) -> ChunkKind {
        self.layout.kind()
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    pub fn is_regular(&self) -> bool {
        matches!(self.layout, ChunkLayout::Regular)
    }

    pub fn is_erasure(&self) -> bool {
        matches!(self.layout, ChunkLayout::Erasure { .. })
    }

    pub fn is_journal(&self) -> bool {
        matches!(self.layout, ChunkLayout::Journal { .. })
    }

    pub fn erasure_codec(&self) -> Option<&ErasureCodingConfig> {
        match &self.layout {
            ChunkLayout::Erasure { codec } => Some(codec),
            _ => None,
        }
    }

    /// Read quorum of a journal chunk; zero for other kinds.
    pub fn read_quorum(&self) -> usize {
        match self.layout {
            ChunkLayout::Journal { read_quorum, .. } => read_quorum,
            _ => 0,
        }
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self.layout, ChunkLayout::Journal { sealed: true, .. })
    }

    /// Mark a journal chunk sealed. No-op for other kinds.
    pub fn seal(&mut self) {
        if let ChunkLayout::Journal { sealed, .. } = &mut self.layout {
            *sealed = true;
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn confirm(&mut self, disk_size: u64) {
        self.confirmed = true;
        self.disk_size = disk_size;
    }

    pub fn disk_size(&self) -> u64 {
        self.disk_size
    }

    pub fn local_properties(&self) -> &ChunkProperties {
        &self.local_properties
    }

    pub fn set_local_properties(&mut self, properties: ChunkProperties) {
        self.local_properties = properties;
    }

    /// Effective replication factor on `medium`. Erasure chunks never need
    /// more than one copy of each part.
    pub fn replication_factor(&self, medium: MediumIndex) -> u32 {
        let factor = self.local_properties.replication_factor(medium);
        if self.is_erasure() {
            factor.min(1)
        } else {
            factor
        }
    }

    pub fn is_vital(&self) -> bool {
        self.local_properties.vital
    }

    pub fn parents(&self) -> &[ChunkListId] {
        &self.parents
    }

    pub(crate) fn add_parent(&mut self, parent: ChunkListId) {
        self.parents.push(parent);
    }

    pub(crate) fn remove_parent(&mut self, parent: ChunkListId) {
        if let Some(pos) = self.parents.iter().position(|p| *p == parent) {
            self.parents.swap_remove(pos);
        }
    }

    /// Replicas on persistent media. Only these count toward redundancy.
    pub fn stored_replicas(&self) -> &[ChunkReplica] {
        &self.stored_replicas
    }

    pub fn cached_replicas(&self) -> &[ChunkReplica] {
        &self.cached_replicas
    }

    /// Returns false if the replica was already present.
    pub(crate) fn add_replica(&mut self, replica: ChunkReplica, cached: bool) -> bool {
        let replicas = if cached {
            &mut self.cached_replicas
        } else {
            &mut self.stored_replicas
        };
        if replicas.contains(&replica) {
            return false;
        }
        replicas.push(replica);
        true
    }

    /// Returns false if the replica was not present.
    pub(crate) fn remove_replica(&mut self, replica: &ChunkReplica, cached: bool) -> bool {
        let replicas = if cached {
            &mut self.cached_replicas
        } else {
            &mut self.stored_replicas
        };
        match replicas.iter().position(|r| r == replica) {
            Some(pos) => {
                replicas.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn job(&self) -> Option<JobId> {
        self.job
    }

    pub fn is_job_scheduled(&self) -> bool {
        self.job.is_some()
    }

    pub(crate) fn set_job(&mut self, job: Option<JobId>) {
        self.job = job;
    }

    pub fn repair_queue_token(&self, medium: MediumIndex) -> Option<RepairQueueToken> {
        self.repair_queue_tokens[medium]
    }

    pub(crate) fn set_repair_queue_token(
        &mut self,
        medium: MediumIndex,
        token: Option<RepairQueueToken>,
    ) {
        self.repair_queue_tokens[medium] = token;
    }
}

/// Reference to a node of a chunk tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkTreeRef {
    Chunk(ChunkId),
    ChunkList(ChunkListId),
}

/// Inner node of a chunk tree.
#[derive(Debug, Clone, Default)]
pub struct ChunkList {
    pub id: ChunkListId,
    pub parents: Vec<ChunkListId>,
    pub children: Vec<ChunkTreeRef>,
    /// Objects that own this list directly.
    pub owners: Vec<OwnerId>,
}

impl ChunkList {
    pub fn new(id: ChunkListId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

/// An owning object (a file or table) declaring a replication policy.
#[derive(Debug, Clone)]
pub struct ChunkOwner {
    pub id: OwnerId,
    pub path: String,
    pub properties: ChunkProperties,
}

impl ChunkOwner {
    pub fn new(id: OwnerId, path: impl Into<String>, properties: ChunkProperties) -> Self {
        Self {
            id,
            path: path.into(),
            properties,
        }
    }
}
