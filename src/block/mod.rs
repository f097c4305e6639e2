//! Blocks and block managers
//!
//! A block manager owns one logical file of fixed-size blocks. It hands out
//! blocks by id, tracks which are checked out for write, recycles freed ids
//! and sits a cache between callers and the backing [`BlockStore`].
//!
//! ```text
//! caller ──get_read──▶ read cache ──miss──▶ store
//!        ──get_write─▶ checkout (exclusive) ──write──▶ write-back ──▶ store
//! ```

pub mod arc_cache;
pub mod cache;
pub mod mapped;
pub mod store;

use crate::config::{BlockMgrConfig, FileMode};
use crate::error::{Result, VaultError};
use crate::location::Location;
use ahash::AHashSet;
use cache::{ReadCache, WriteBackCache};
use mapped::MappedFile;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use store::{BlockStore, DirectFile, MemStore};

pub use store::DeleteOutcome;

/// Block identifier: the block's offset in its file, in block units.
pub type BlockId = u64;

/// Highest usable block id. Nodes store child ids as u32.
pub const MAX_BLOCK_ID: BlockId = u32::MAX as BlockId - 1;

/// A block id and its bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Block {
    id: BlockId,
    data: Vec<u8>,
}

impl Block {
    pub fn new(id: BlockId, data: Vec<u8>) -> Self {
        Block { id, data }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Same bytes under another id. Used for copy-on-write.
    pub fn with_id(mut self, id: BlockId) -> Self {
        self.id = id;
        self
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Counters reported by [`BlockMgr::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BlockMgrStats {
    pub block_size: usize,
    pub allocation_limit: u64,
    pub free_blocks: usize,
    pub cached_blocks: usize,
    pub dirty_blocks: usize,
    pub checked_out: usize,
    pub allocations: u64,
    pub frees: u64,
    pub store_reads: u64,
    pub store_writes: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Cached, checked-out access to the blocks of one file.
///
/// Blocks returned by [`get_read`](BlockMgr::get_read) are immutable
/// snapshots. Blocks returned by [`allocate`](BlockMgr::allocate) and
/// [`get_write`](BlockMgr::get_write) are checked out: no one else can check
/// out the same id until it is handed back via `write` or `release`.
pub trait BlockMgr: Send + Sync {
    fn block_size(&self) -> usize;

    /// New zeroed block, checked out to the caller.
    fn allocate(&self) -> Result<Block>;

    fn get_read(&self, id: BlockId) -> Result<Arc<Block>>;

    /// Check out a block for modification, waiting if someone else holds it.
    fn get_write(&self, id: BlockId) -> Result<Block>;

    /// Like `get_write` but fails with `BlockInUse` instead of waiting.
    fn try_get_write(&self, id: BlockId) -> Result<Block>;

    /// Store a block's new contents and end its checkout.
    fn write(&self, block: Block) -> Result<()>;

    /// End a checkout without changing the block.
    fn release(&self, block: Block);

    /// Return a block id to the free list.
    fn free(&self, id: BlockId) -> Result<()>;

    /// Flush cached writes and fsync the store.
    fn sync(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    /// One past the highest id ever allocated.
    fn allocation_limit(&self) -> u64;

    /// Forget every block at or above `limit` and resume allocating from
    /// there. This is how an aborted transaction gives back its blocks.
    fn reset_allocation(&self, limit: u64);

    /// Raise the allocation limit to at least `limit`.
    fn ensure_limit(&self, limit: u64);

    /// Whether `id` names an allocated, unfreed block.
    fn valid(&self, id: BlockId) -> bool;

    fn stats(&self) -> BlockMgrStats;

    /// Short name for logs.
    fn label(&self) -> &str;
}

struct Inner {
    store: Box<dyn BlockStore>,
    limit: u64,
    free_list: Vec<BlockId>,
    freed: AHashSet<BlockId>,
    checked_out: AHashSet<BlockId>,
    read_cache: ReadCache,
    write_back: Option<WriteBackCache>,
    stats: BlockMgrStats,
    stale: Vec<PathBuf>,
    closed: bool,
}

impl Inner {
    fn check_id(&self, id: BlockId) -> Result<()> {
        if self.closed {
            return Err(VaultError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "block manager is closed",
            )));
        }
        if id >= self.limit || self.freed.contains(&id) {
            return Err(VaultError::InvalidBlockId(id));
        }
        Ok(())
    }

    fn load(&mut self, id: BlockId) -> Result<Arc<Block>> {
        if let Some(dirty) = self.write_back.as_ref().and_then(|wb| wb.get(id)) {
            return Ok(Arc::new(dirty.clone()));
        }
        if let Some(block) = self.read_cache.get(id) {
            return Ok(block);
        }

        let mut data = vec![0u8; self.stats.block_size];
        self.store.read(id, &mut data)?;
        self.stats.store_reads += 1;
        let block = Arc::new(Block::new(id, data));
        self.read_cache.put(Arc::clone(&block));
        Ok(block)
    }

    fn flush_dirty(&mut self) -> Result<()> {
        if let Some(wb) = self.write_back.as_mut() {
            let dirty = wb.drain();
            if !dirty.is_empty() {
                tracing::trace!(count = dirty.len(), "Flushing write-back cache");
            }
            for block in dirty {
                self.store.write(block.id(), block.data())?;
                self.stats.store_writes += 1;
            }
        }
        Ok(())
    }
}

/// Block manager over any [`BlockStore`].
pub struct BlockMgrFile {
    label: String,
    block_size: usize,
    inner: Mutex<Inner>,
    released: Condvar,
}

impl BlockMgrFile {
    pub fn new(
        label: impl Into<String>,
        store: Box<dyn BlockStore>,
        config: &BlockMgrConfig,
    ) -> Result<Self> {
        let block_size = store.block_size();
        if block_size != config.block_size {
            return Err(VaultError::Config(format!(
                "Store block size {} does not match configured {}",
                block_size, config.block_size
            )));
        }

        let limit = store.num_blocks()?;
        let label = label.into();
        tracing::debug!(label = %label, block_size, limit, "Opened block manager");

        Ok(BlockMgrFile {
            label,
            block_size,
            inner: Mutex::new(Inner {
                store,
                limit,
                free_list: Vec::new(),
                freed: AHashSet::new(),
                checked_out: AHashSet::new(),
                read_cache: ReadCache::for_policy(&config.cache),
                write_back: WriteBackCache::for_policy(&config.cache),
                stats: BlockMgrStats {
                    block_size,
                    ..BlockMgrStats::default()
                },
                stale: Vec::new(),
                closed: false,
            }),
            released: Condvar::new(),
        })
    }

    /// In-memory block manager.
    pub fn mem(label: impl Into<String>, config: &BlockMgrConfig) -> Result<Self> {
        Self::new(label, Box::new(MemStore::new(config.block_size)), config)
    }

    /// Close and delete the backing file.
    pub fn delete(&self) -> Result<DeleteOutcome> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let outcome = inner.store.delete()?;
        if let DeleteOutcome::Deferred(path) = &outcome {
            tracing::warn!(path = %path.display(), "Backing file could not be removed yet");
            inner.stale.push(path.clone());
        }
        Ok(outcome)
    }

    /// Files left behind by deferred deletes.
    pub fn stale_files(&self) -> Vec<PathBuf> {
        self.inner.lock().stale.clone()
    }

    fn checkout(&self, id: BlockId, wait: bool) -> Result<Block> {
        let mut inner = self.inner.lock();
        inner.check_id(id)?;
        while inner.checked_out.contains(&id) {
            if !wait {
                return Err(VaultError::BlockInUse(id));
            }
            self.released.wait(&mut inner);
            inner.check_id(id)?;
        }
        let block = inner.load(id)?;
        inner.checked_out.insert(id);
        Ok(Block::clone(&block))
    }
}

impl BlockMgr for BlockMgrFile {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate(&self) -> Result<Block> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(VaultError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "block manager is closed",
            )));
        }

        let id = match inner.free_list.pop() {
            Some(id) => {
                inner.freed.remove(&id);
                id
            }
            None => {
                let id = inner.limit;
                if id > MAX_BLOCK_ID {
                    return Err(VaultError::OutOfSpace);
                }
                inner.limit += 1;
                id
            }
        };

        inner.checked_out.insert(id);
        inner.stats.allocations += 1;
        Ok(Block::new(id, vec![0u8; self.block_size]))
    }

    fn get_read(&self, id: BlockId) -> Result<Arc<Block>> {
        let mut inner = self.inner.lock();
        inner.check_id(id)?;
        inner.load(id)
    }

    fn get_write(&self, id: BlockId) -> Result<Block> {
        self.checkout(id, true)
    }

    fn try_get_write(&self, id: BlockId) -> Result<Block> {
        self.checkout(id, false)
    }

    fn write(&self, block: Block) -> Result<()> {
        if block.data().len() != self.block_size {
            return Err(VaultError::corrupt(format!(
                "Block {} has {} bytes, expected {}",
                block.id(),
                block.data().len(),
                self.block_size
            )));
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let id = block.id();
        let result = inner.check_id(id).and_then(|_| {
            let snapshot = Arc::new(block.clone());
            match inner.write_back.as_mut() {
                Some(wb) => {
                    if let Some(evicted) = wb.put(block) {
                        inner.store.write(evicted.id(), evicted.data())?;
                        inner.stats.store_writes += 1;
                    }
                }
                None => {
                    inner.store.write(id, block.data())?;
                    inner.stats.store_writes += 1;
                }
            }
            inner.read_cache.put(snapshot);
            Ok(())
        });

        if inner.checked_out.remove(&id) {
            self.released.notify_all();
        }
        result
    }

    fn release(&self, block: Block) {
        let mut inner = self.inner.lock();
        if inner.checked_out.remove(&block.id()) {
            self.released.notify_all();
        }
    }

    fn free(&self, id: BlockId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_id(id)?;
        inner.read_cache.remove(id);
        if let Some(wb) = inner.write_back.as_mut() {
            wb.remove(id);
        }
        inner.free_list.push(id);
        inner.freed.insert(id);
        inner.stats.frees += 1;
        if inner.checked_out.remove(&id) {
            self.released.notify_all();
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.flush_dirty()?;
        inner.store.sync()
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.flush_dirty()?;
        inner.store.close()?;
        inner.read_cache.clear();
        inner.closed = true;
        tracing::debug!(label = %self.label, "Closed block manager");
        Ok(())
    }

    fn allocation_limit(&self) -> u64 {
        self.inner.lock().limit
    }

    fn reset_allocation(&self, limit: u64) {
        let mut inner = self.inner.lock();
        tracing::debug!(label = %self.label, from = inner.limit, to = limit, "Reset allocation limit");
        inner.free_list.retain(|&id| id < limit);
        inner.freed.retain(|&id| id < limit);
        inner.checked_out.retain(|&id| id < limit);
        inner.read_cache.remove_from(limit);
        if let Some(wb) = inner.write_back.as_mut() {
            wb.remove_from(limit);
        }
        inner.limit = limit;
        self.released.notify_all();
    }

    fn ensure_limit(&self, limit: u64) {
        let mut inner = self.inner.lock();
        if inner.limit < limit {
            inner.limit = limit;
        }
    }

    fn valid(&self, id: BlockId) -> bool {
        self.inner.lock().check_id(id).is_ok()
    }

    fn stats(&self) -> BlockMgrStats {
        let inner = self.inner.lock();
        let (hits, misses) = inner.read_cache.counters();
        BlockMgrStats {
            allocation_limit: inner.limit,
            free_blocks: inner.free_list.len(),
            cached_blocks: inner.read_cache.len(),
            dirty_blocks: inner.write_back.as_ref().map(|wb| wb.len()).unwrap_or(0),
            checked_out: inner.checked_out.len(),
            cache_hits: hits,
            cache_misses: misses,
            ..inner.stats
        }
    }

    fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for BlockMgrFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockMgrFile")
            .field("label", &self.label)
            .field("block_size", &self.block_size)
            .finish()
    }
}

/// Open the block manager for `<name>.<ext>` in `location`.
///
/// Memory locations, and [`FileMode::Memory`], always get an in-memory store.
pub fn open_block_mgr(
    config: &BlockMgrConfig,
    location: &Location,
    name: &str,
    ext: &str,
) -> Result<Arc<BlockMgrFile>> {
    let label = format!("{}.{}", name, ext);
    let path = match (location.path(name, ext), config.file_mode) {
        (Some(path), FileMode::Direct | FileMode::Mapped) => path,
        _ => return Ok(Arc::new(BlockMgrFile::mem(label, config)?)),
    };

    let store: Box<dyn BlockStore> = match config.file_mode {
        FileMode::Mapped => Box::new(MappedFile::open(
            &path,
            config.block_size,
            config.segment_size,
            config.mapped_delete,
        )?),
        _ => Box::new(DirectFile::open(&path, config.block_size)?),
    };
    Ok(Arc::new(BlockMgrFile::new(label, store, config)?))
}
