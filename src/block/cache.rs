//! Block caches used by the block manager
//!
//! The read cache hands out shared `Arc<Block>` snapshots. The write-back
//! cache owns dirty blocks until they are flushed to the store.

use super::arc_cache::ArcCache;
use super::{Block, BlockId};
use crate::config::CachePolicy;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;

fn bounded<V>(capacity: usize) -> LruCache<BlockId, V> {
    match NonZeroUsize::new(capacity) {
        Some(cap) => LruCache::new(cap),
        None => LruCache::unbounded(),
    }
}

/// Read-side cache, chosen by [`CachePolicy`].
pub enum ReadCache {
    None,
    Lru {
        cache: LruCache<BlockId, Arc<Block>>,
        hits: u64,
        misses: u64,
    },
    Adaptive(ArcCache),
}

impl ReadCache {
    pub fn for_policy(policy: &CachePolicy) -> Self {
        match *policy {
            CachePolicy::None => ReadCache::None,
            CachePolicy::Read { capacity }
            | CachePolicy::WriteBack {
                read_capacity: capacity,
                ..
            } => ReadCache::Lru {
                cache: bounded(capacity),
                hits: 0,
                misses: 0,
            },
            CachePolicy::Adaptive { capacity } => ReadCache::Adaptive(ArcCache::new(capacity)),
        }
    }

    pub fn get(&mut self, id: BlockId) -> Option<Arc<Block>> {
        match self {
            ReadCache::None => None,
            ReadCache::Lru {
                cache,
                hits,
                misses,
            } => match cache.get(&id) {
                Some(block) => {
                    *hits += 1;
                    Some(Arc::clone(block))
                }
                None => {
                    *misses += 1;
                    None
                }
            },
            ReadCache::Adaptive(arc) => arc.get(id),
        }
    }

    pub fn put(&mut self, block: Arc<Block>) {
        match self {
            ReadCache::None => {}
            ReadCache::Lru { cache, .. } => {
                cache.put(block.id(), block);
            }
            ReadCache::Adaptive(arc) => arc.put(block.id(), block),
        }
    }

    pub fn remove(&mut self, id: BlockId) {
        match self {
            ReadCache::None => {}
            ReadCache::Lru { cache, .. } => {
                cache.pop(&id);
            }
            ReadCache::Adaptive(arc) => arc.remove(id),
        }
    }

    /// Drop every entry with id at or above `limit`.
    pub fn remove_from(&mut self, limit: BlockId) {
        match self {
            ReadCache::None => {}
            ReadCache::Lru { cache, .. } => {
                let doomed: Vec<BlockId> = cache
                    .iter()
                    .map(|(id, _)| *id)
                    .filter(|id| *id >= limit)
                    .collect();
                for id in doomed {
                    cache.pop(&id);
                }
            }
            ReadCache::Adaptive(arc) => arc.remove_from(limit),
        }
    }

    pub fn clear(&mut self) {
        match self {
            ReadCache::None => {}
            ReadCache::Lru { cache, .. } => cache.clear(),
            ReadCache::Adaptive(arc) => arc.clear(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ReadCache::None => 0,
            ReadCache::Lru { cache, .. } => cache.len(),
            ReadCache::Adaptive(arc) => arc.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses)
    pub fn counters(&self) -> (u64, u64) {
        match self {
            ReadCache::None => (0, 0),
            ReadCache::Lru { hits, misses, .. } => (*hits, *misses),
            ReadCache::Adaptive(arc) => {
                let stats = arc.stats();
                (stats.hits, stats.misses)
            }
        }
    }
}

/// Dirty blocks waiting to be written to the store.
///
/// Bounded: inserting past capacity evicts the least recently written block,
/// which the caller must flush.
pub struct WriteBackCache {
    dirty: LruCache<BlockId, Block>,
}

impl WriteBackCache {
    pub fn for_policy(policy: &CachePolicy) -> Option<Self> {
        match *policy {
            CachePolicy::WriteBack { write_capacity, .. } => Some(WriteBackCache {
                dirty: bounded(write_capacity),
            }),
            _ => None,
        }
    }

    /// Stage a dirty block. Returns a different block pushed out to make
    /// room, which must be written to the store now.
    pub fn put(&mut self, block: Block) -> Option<Block> {
        let id = block.id();
        match self.dirty.push(id, block) {
            // Same id: the older version is simply superseded
            Some((evicted_id, _)) if evicted_id == id => None,
            Some((_, evicted)) => Some(evicted),
            None => None,
        }
    }

    pub fn get(&self, id: BlockId) -> Option<&Block> {
        self.dirty.peek(&id)
    }

    pub fn remove(&mut self, id: BlockId) -> Option<Block> {
        self.dirty.pop(&id)
    }

    pub fn remove_from(&mut self, limit: BlockId) {
        let doomed: Vec<BlockId> = self
            .dirty
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| *id >= limit)
            .collect();
        for id in doomed {
            self.dirty.pop(&id);
        }
    }

    /// Take every dirty block, in block id order.
    pub fn drain(&mut self) -> Vec<Block> {
        let mut blocks = Vec::with_capacity(self.dirty.len());
        while let Some((_, block)) = self.dirty.pop_lru() {
            blocks.push(block);
        }
        blocks.sort_by_key(|b| b.id());
        blocks
    }

    pub fn len(&self) -> usize {
        self.dirty.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty()
    }
}
