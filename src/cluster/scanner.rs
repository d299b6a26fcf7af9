//! Deduplicated scan queues feeding the refresh and properties update passes.

use crate::types::ChunkId;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Entry {
    chunk_id: ChunkId,
    sequence: u64,
    /// `None` makes the entry eligible immediately.
    enqueued_at: Option<Instant>,
}

/// Insertion-ordered queue of chunks, holding each chunk at most once.
///
/// Removal is lazy: a destroyed chunk is forgotten in the pending index and
/// its queue slot is skipped when it reaches the front.
#[derive(Debug, Default)]
pub struct ChunkScanner {
    queue: VecDeque<Entry>,
    pending: HashMap<ChunkId, u64>,
    next_sequence: u64,
}

impl ChunkScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `chunk_id` stamped with `now`. Returns false if it is already queued.
    pub fn enqueue(&mut self, chunk_id: ChunkId, now: Instant) -> bool {
        self.push(chunk_id, Some(now))
    }

    /// Queue every chunk for an immediate scan, e.g. right after leadership
    /// is acquired.
    pub fn start(&mut self, chunks: impl IntoIterator<Item = ChunkId>) {
        for chunk_id in chunks {
            self.push(chunk_id, None);
        }
    }

    fn push(&mut self, chunk_id: ChunkId, enqueued_at: Option<Instant>) -> bool {
        if self.pending.contains_key(&chunk_id) {
            return false;
        }
        self.next_sequence += 1;
        self.pending.insert(chunk_id, self.next_sequence);
        self.queue.push_back(Entry {
            chunk_id,
            sequence: self.next_sequence,
            enqueued_at,
        });
        true
    }

    /// Drop stale entries from the front of the queue.
    fn purge(&mut self) {
        while let Some(front) = self.queue.front() {
            if self.pending.get(&front.chunk_id) == Some(&front.sequence) {
                break;
            }
            self.queue.pop_front();
        }
    }

    /// Whether the head of the queue has waited at least `delay` by `now`.
    pub fn has_unscanned_chunk(&mut self, now: Instant, delay: Duration) -> bool {
        self.purge();
        match self.queue.front() {
            None => false,
            Some(entry) => entry
                .enqueued_at
                .map_or(true, |enqueued_at| enqueued_at + delay <= now),
        }
    }

    /// Pop the head of the queue. Callers check eligibility with
    /// [`ChunkScanner::has_unscanned_chunk`] first.
    pub fn dequeue_chunk(&mut self) -> Option<ChunkId> {
        self.purge();
        let entry = self.queue.pop_front()?;
        self.pending.remove(&entry.chunk_id);
        Some(entry.chunk_id)
    }

    pub fn on_chunk_destroyed(&mut self, chunk_id: &ChunkId) {
        self.pending.remove(chunk_id);
    }

    pub fn contains(&self, chunk_id: &ChunkId) -> bool {
        self.pending.contains_key(chunk_id)
    }

    /// Number of chunks awaiting a scan.
    pub fn queue_size(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.pending.clear();
    }
}
