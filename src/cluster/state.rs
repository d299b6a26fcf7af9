//! Id-indexed arena holding the cluster's chunks, chunk trees and nodes.

use super::chunk::{Chunk, ChunkList, ChunkOwner, ChunkTreeRef};
use super::medium::{Medium, MediumCatalog};
use super::node::{Node, NodeState};
use crate::error::{ReplicatorError, Result};
use crate::types::*;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// In-memory snapshot of everything the replicator reasons about.
///
/// All cross references are ids; lookups go through this arena.
#[derive(Debug, Default)]
pub struct ClusterState {
    cell_tag: CellTag,
    media: MediumCatalog,
    chunks: HashMap<ChunkId, Chunk>,
    chunk_lists: HashMap<ChunkListId, ChunkList>,
    owners: HashMap<OwnerId, ChunkOwner>,
    nodes: BTreeMap<NodeId, Node>,
}

impl ClusterState {
    pub fn new(cell_tag: CellTag) -> Self {
        Self {
            cell_tag,
            ..Default::default()
        }
    }

    pub fn cell_tag(&self) -> CellTag {
        self.cell_tag
    }

    pub fn media(&self) -> &MediumCatalog {
        &self.media
    }

    pub fn register_medium(&mut self, medium: Medium) -> Result<()> {
        self.media.register(medium)
    }

    // Chunks

    pub fn chunk(&self, id: &ChunkId) -> Option<&Chunk> {
        self.chunks.get(id)
    }

    pub fn chunk_mut(&mut self, id: &ChunkId) -> Option<&mut Chunk> {
        self.chunks.get_mut(id)
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the chunk exists and has not been destroyed.
    pub fn is_chunk_alive(&self, id: &ChunkId) -> bool {
        self.chunks.contains_key(id)
    }

    /// Whether the chunk belongs to another cell.
    pub fn is_foreign(&self, id: &ChunkId) -> bool {
        id.cell_tag() != self.cell_tag
    }

    pub fn insert_chunk(&mut self, chunk: Chunk) -> Result<ChunkId> {
        let id = chunk.id();
        if self.chunks.contains_key(&id) {
            return Err(ReplicatorError::AlreadyExists(format!("chunk {}", id)));
        }
        self.chunks.insert(id, chunk);
        Ok(id)
    }

    /// Remove a chunk together with its replica back references and parent links.
    pub(crate) fn remove_chunk(&mut self, id: &ChunkId) -> Option<Chunk> {
        let chunk = self.chunks.remove(id)?;
        for replica in chunk.stored_replicas().iter().chain(chunk.cached_replicas()) {
            if let Some(node) = self.nodes.get_mut(&replica.node) {
                node.replicas_mut().remove(&ChunkIdWithIndexes::new(
                    *id,
                    replica.replica_index,
                    replica.medium,
                ));
            }
        }
        for parent in chunk.parents() {
            if let Some(list) = self.chunk_lists.get_mut(parent) {
                list.children.retain(|child| *child != ChunkTreeRef::Chunk(*id));
            }
        }
        Some(chunk)
    }

    // Replicas

    /// Record a replica. Returns false if it was already known.
    pub fn add_replica(&mut self, chunk_id: &ChunkId, replica: ChunkReplica, cached: bool) -> Result<bool> {
        if self.media.get(replica.medium).is_none() {
            return Err(ReplicatorError::MediumNotFound(replica.medium.to_string()));
        }
        if replica.replica_index >= REPLICA_INDEX_BOUND {
            return Err(ReplicatorError::InvalidArgument(format!(
                "replica index {} out of range",
                replica.replica_index
            )));
        }
        let node = self
            .nodes
            .get_mut(&replica.node)
            .ok_or(ReplicatorError::NodeNotFound(replica.node))?;
        let chunk = self
            .chunks
            .get_mut(chunk_id)
            .ok_or_else(|| ReplicatorError::ChunkNotFound(chunk_id.to_string()))?;
        if !chunk.add_replica(replica, cached) {
            return Ok(false);
        }
        node.replicas_mut().insert(ChunkIdWithIndexes::new(
            *chunk_id,
            replica.replica_index,
            replica.medium,
        ));
        Ok(true)
    }

    /// Forget a replica. Returns false if it was not known.
    pub fn remove_replica(&mut self, chunk_id: &ChunkId, replica: &ChunkReplica, cached: bool) -> Result<bool> {
        let chunk = self
            .chunks
            .get_mut(chunk_id)
            .ok_or_else(|| ReplicatorError::ChunkNotFound(chunk_id.to_string()))?;
        if !chunk.remove_replica(replica, cached) {
            return Ok(false);
        }
        if let Some(node) = self.nodes.get_mut(&replica.node) {
            node.replicas_mut().remove(&ChunkIdWithIndexes::new(
                *chunk_id,
                replica.replica_index,
                replica.medium,
            ));
        }
        Ok(true)
    }

    // Chunk trees

    pub fn chunk_list(&self, id: &ChunkListId) -> Option<&ChunkList> {
        self.chunk_lists.get(id)
    }

    pub fn insert_chunk_list(&mut self, list: ChunkList) -> Result<()> {
        if self.chunk_lists.contains_key(&list.id) {
            return Err(ReplicatorError::AlreadyExists(format!("chunk list {}", list.id)));
        }
        self.chunk_lists.insert(list.id, list);
        Ok(())
    }

    pub fn owner(&self, id: &OwnerId) -> Option<&ChunkOwner> {
        self.owners.get(id)
    }

    pub fn insert_owner(&mut self, owner: ChunkOwner) {
        self.owners.insert(owner.id, owner);
    }

    /// Attach an owner to a chunk list.
    pub fn attach_owner(&mut self, list_id: ChunkListId, owner_id: OwnerId) -> Result<()> {
        if !self.owners.contains_key(&owner_id) {
            return Err(ReplicatorError::InvalidArgument(format!("unknown owner {}", owner_id)));
        }
        let list = self
            .chunk_lists
            .get_mut(&list_id)
            .ok_or(ReplicatorError::ChunkListNotFound(list_id))?;
        if !list.owners.contains(&owner_id) {
            list.owners.push(owner_id);
        }
        Ok(())
    }

    /// Attach a child (chunk or chunk list) under `parent`, maintaining both directions.
    pub fn attach_child(&mut self, parent: ChunkListId, child: ChunkTreeRef) -> Result<()> {
        if !self.chunk_lists.contains_key(&parent) {
            return Err(ReplicatorError::ChunkListNotFound(parent));
        }
        match child {
            ChunkTreeRef::Chunk(id) => self
                .chunks
                .get_mut(&id)
                .ok_or_else(|| ReplicatorError::ChunkNotFound(id.to_string()))?
                .add_parent(parent),
            ChunkTreeRef::ChunkList(id) => self
                .chunk_lists
                .get_mut(&id)
                .ok_or(ReplicatorError::ChunkListNotFound(id))?
                .parents
                .push(parent),
        }
        if let Some(list) = self.chunk_lists.get_mut(&parent) {
            list.children.push(child);
        }
        Ok(())
    }

    /// Detach a chunk from `parent`.
    pub fn detach_chunk(&mut self, parent: ChunkListId, chunk_id: &ChunkId) -> Result<()> {
        let chunk = self
            .chunks
            .get_mut(chunk_id)
            .ok_or_else(|| ReplicatorError::ChunkNotFound(chunk_id.to_string()))?;
        chunk.remove_parent(parent);
        if let Some(list) = self.chunk_lists.get_mut(&parent) {
            list.children.retain(|child| *child != ChunkTreeRef::Chunk(*chunk_id));
        }
        Ok(())
    }

    /// Starting at `list`, climb single-parent links while the list has no owners.
    ///
    /// Returns `None` when a list without owners has no parents at all.
    pub fn follow_parent_links(&self, mut list_id: ChunkListId) -> Option<ChunkListId> {
        loop {
            let list = self.chunk_lists.get(&list_id)?;
            if !list.owners.is_empty() {
                return Some(list_id);
            }
            match list.parents.as_slice() {
                [] => return None,
                [single] => list_id = *single,
                _ => return Some(list_id),
            }
        }
    }

    /// Breadth-first walk over the chunk lists owning `chunk_id`, calling
    /// `visit` once per list. Lists are deduplicated.
    pub fn walk_owning_lists(&self, chunk_id: &ChunkId, mut visit: impl FnMut(&ChunkList)) {
        let Some(chunk) = self.chunks.get(chunk_id) else {
            return;
        };

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        let mut enqueue = |id: ChunkListId, queue: &mut VecDeque<ChunkListId>| {
            if let Some(adjusted) = self.follow_parent_links(id) {
                if visited.insert(adjusted) {
                    queue.push_back(adjusted);
                }
            }
        };

        for parent in chunk.parents() {
            enqueue(*parent, &mut queue);
        }

        while let Some(list_id) = queue.pop_front() {
            let Some(list) = self.chunk_lists.get(&list_id) else {
                continue;
            };
            visit(list);
            for parent in &list.parents {
                enqueue(*parent, &mut queue);
            }
        }
    }

    /// All chunks in the subtree rooted at `root`, found with an explicit worklist.
    pub fn collect_subtree_chunks(&self, root: ChunkListId) -> Vec<ChunkId> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![root];
        while let Some(list_id) = stack.pop() {
            if !visited.insert(list_id) {
                continue;
            }
            let Some(list) = self.chunk_lists.get(&list_id) else {
                continue;
            };
            for child in &list.children {
                match child {
                    ChunkTreeRef::Chunk(id) => result.push(*id),
                    ChunkTreeRef::ChunkList(id) => stack.push(*id),
                }
            }
        }
        result
    }

    // Nodes

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    /// Nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub(crate) fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    pub fn insert_node(&mut self, node: Node) -> Result<()> {
        if self.nodes.contains_key(&node.id()) {
            return Err(ReplicatorError::AlreadyExists(format!("node {}", node.id())));
        }
        self.nodes.insert(node.id(), node);
        Ok(())
    }

    pub(crate) fn remove_node(&mut self, id: &NodeId) -> Option<Node> {
        self.nodes.remove(id)
    }

    pub fn online_node_count(&self) -> usize {
        self.nodes.values().filter(|n| n.state() == NodeState::Online).count()
    }

    /// Whether the replica's node is being drained. Unknown nodes count as
    /// live so a dangling replica never hides a loss.
    pub fn is_replica_decommissioned(&self, replica: &ChunkReplica) -> bool {
        self.nodes
            .get(&replica.node)
            .map_or(false, |node| node.is_decommissioned())
    }
}
