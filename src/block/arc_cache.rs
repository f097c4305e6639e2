//! Adaptive Replacement Cache (ARC) for blocks
//!
//! ARC keeps two LRU lists of cached blocks:
//! - T1: blocks seen once recently
//! - T2: blocks seen at least twice
//!
//! and two ghost lists of ids only:
//! - B1: ids recently evicted from T1
//! - B2: ids recently evicted from T2
//!
//! A miss that hits a ghost list moves the target size `p` of T1, so the cache
//! self-tunes between recency and frequency.

use super::{Block, BlockId};
use lru::LruCache;
use std::sync::Arc;

/// ARC statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArcStats {
    pub hits: u64,
    pub misses: u64,
    pub t1_size: usize,
    pub t2_size: usize,
    pub b1_size: usize,
    pub b2_size: usize,
    /// Current target size for T1
    pub p: usize,
    pub capacity: usize,
}

impl ArcStats {
    /// Hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

pub struct ArcCache {
    t1: LruCache<BlockId, Arc<Block>>,
    t2: LruCache<BlockId, Arc<Block>>,
    b1: LruCache<BlockId, ()>,
    b2: LruCache<BlockId, ()>,
    p: usize,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl ArcCache {
    pub fn new(capacity: usize) -> Self {
        ArcCache {
            t1: LruCache::unbounded(),
            t2: LruCache::unbounded(),
            b1: LruCache::unbounded(),
            b2: LruCache::unbounded(),
            p: 0,
            capacity: capacity.max(1),
            hits: 0,
            misses: 0,
        }
    }

    /// Look up a cached block. A hit in T1 promotes the block to T2.
    pub fn get(&mut self, id: BlockId) -> Option<Arc<Block>> {
        if let Some(block) = self.t1.pop(&id) {
            self.hits += 1;
            self.t2.put(id, Arc::clone(&block));
            return Some(block);
        }
        if let Some(block) = self.t2.get(&id) {
            self.hits += 1;
            return Some(Arc::clone(block));
        }
        self.misses += 1;
        None
    }

    /// Cache a block just loaded from the store (or just written).
    pub fn put(&mut self, id: BlockId, block: Arc<Block>) {
        // Refresh an entry already cached
        if self.t1.contains(&id) {
            self.t1.put(id, block);
            return;
        }
        if self.t2.contains(&id) {
            self.t2.put(id, block);
            return;
        }

        if self.b1.contains(&id) {
            // Recency is paying off: grow T1's target
            let delta = if self.b1.len() >= self.b2.len() {
                1
            } else {
                self.b2.len() / self.b1.len()
            };
            self.p = (self.p + delta).min(self.capacity);
            self.b1.pop(&id);
            self.replace(false);
            self.t2.put(id, block);
            return;
        }

        if self.b2.contains(&id) {
            // Frequency is paying off: shrink T1's target
            let delta = if self.b2.len() >= self.b1.len() {
                1
            } else {
                self.b1.len() / self.b2.len()
            };
            self.p = self.p.saturating_sub(delta);
            self.b2.pop(&id);
            self.replace(true);
            self.t2.put(id, block);
            return;
        }

        // Complete miss
        let l1 = self.t1.len() + self.b1.len();
        let total = l1 + self.t2.len() + self.b2.len();
        if l1 >= self.capacity {
            if self.t1.len() < self.capacity {
                self.b1.pop_lru();
                self.replace(false);
            } else if let Some((evicted, _)) = self.t1.pop_lru() {
                tracing::trace!(block = evicted, "ARC dropped T1 block");
            }
        } else if total >= self.capacity {
            if total >= 2 * self.capacity {
                self.b2.pop_lru();
            }
            self.replace(false);
        }
        self.t1.put(id, block);
    }

    /// Evict one cached block into its ghost list, if the cache is full.
    fn replace(&mut self, hit_in_b2: bool) {
        if self.t1.len() + self.t2.len() < self.capacity {
            return;
        }
        let from_t1 = !self.t1.is_empty()
            && (self.t1.len() > self.p || (hit_in_b2 && self.t1.len() == self.p));
        if from_t1 {
            if let Some((evicted, _)) = self.t1.pop_lru() {
                tracing::trace!(block = evicted, "ARC evicted T1 block to B1");
                self.b1.put(evicted, ());
            }
        } else if let Some((evicted, _)) = self.t2.pop_lru() {
            tracing::trace!(block = evicted, "ARC evicted T2 block to B2");
            self.b2.put(evicted, ());
        } else if let Some((evicted, _)) = self.t1.pop_lru() {
            self.b1.put(evicted, ());
        }
    }

    /// Forget a block entirely, ghosts included.
    pub fn remove(&mut self, id: BlockId) {
        self.t1.pop(&id);
        self.t2.pop(&id);
        self.b1.pop(&id);
        self.b2.pop(&id);
    }

    /// Forget every block with id at or above `limit`.
    pub fn remove_from(&mut self, limit: BlockId) {
        let doomed: Vec<BlockId> = self
            .t1
            .iter()
            .map(|(id, _)| *id)
            .chain(self.t2.iter().map(|(id, _)| *id))
            .chain(self.b1.iter().map(|(id, _)| *id))
            .chain(self.b2.iter().map(|(id, _)| *id))
            .filter(|id| *id >= limit)
            .collect();
        for id in doomed {
            self.remove(id);
        }
    }

    pub fn stats(&self) -> ArcStats {
        ArcStats {
            hits: self.hits,
            misses: self.misses,
            t1_size: self.t1.len(),
            t2_size: self.t2.len(),
            b1_size: self.b1.len(),
            b2_size: self.b2.len(),
            p: self.p,
            capacity: self.capacity,
        }
    }

    pub fn clear(&mut self) {
        self.t1.clear();
        self.t2.clear();
        self.b1.clear();
        self.b2.clear();
        self.p = 0;
    }

    /// Number of cached blocks (ghosts excluded)
    pub fn len(&self) -> usize {
        self.t1.len() + self.t2.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
