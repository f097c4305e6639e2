//! Store configuration
//!
//! Everything that varies between deployments is carried explicitly in a
//! [`StoreConfig`] passed to constructors; there is no process-wide registry.
//! Configurations can be built in code or loaded from TOML:
//!
//! ```toml
//! block_size = 4096
//! file_mode = "mapped"
//! segment_size = 4194304
//!
//! [node_cache]
//! kind = "read"
//! capacity = 500
//!
//! [record_cache]
//! kind = "write-back"
//! read_capacity = 1000
//! write_capacity = 200
//! ```

use crate::error::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_BLOCK_SIZE: usize = 8192;
pub const MIN_BLOCK_SIZE: usize = 64;
pub const DEFAULT_SEGMENT_SIZE: usize = 8 * 1024 * 1024;
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// How blocks reach the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileMode {
    /// Explicit seek + read/write calls on the file.
    Direct,
    /// Memory-mapped segments.
    Mapped,
    /// No file at all; blocks live in memory.
    Memory,
}

/// What deleting a memory-mapped file does.
///
/// Some platforms refuse to delete a file that is still mapped. Rather than
/// leave files behind silently, the choice is explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MappedDeletePolicy {
    /// Unmap, then remove the file immediately.
    Remove,
    /// Unmap, keep the file, and report it as stale.
    Defer,
}

/// Block cache policy for one block manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CachePolicy {
    /// Every read goes to the store.
    None,
    /// Bounded LRU read cache; writes go straight through.
    Read { capacity: usize },
    /// LRU read cache plus a bounded set of dirty blocks flushed on
    /// eviction and on `sync()`.
    WriteBack {
        read_capacity: usize,
        write_capacity: usize,
    },
    /// Adaptive replacement (ARC) read cache.
    Adaptive { capacity: usize },
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::Read {
            capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl CachePolicy {
    fn validate(&self, what: &str) -> Result<()> {
        let zero = match *self {
            CachePolicy::None => false,
            CachePolicy::Read { capacity } | CachePolicy::Adaptive { capacity } => capacity == 0,
            CachePolicy::WriteBack {
                read_capacity,
                write_capacity,
            } => read_capacity == 0 || write_capacity == 0,
        };
        if zero {
            return Err(VaultError::Config(format!(
                "{} cache capacity must be non-zero (use kind = \"none\" to disable)",
                what
            )));
        }
        Ok(())
    }
}

/// Configuration for a store's block managers and files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Block size in bytes, a power of two.
    pub block_size: usize,

    pub file_mode: FileMode,

    /// Size of each mapped segment (mapped mode only).
    pub segment_size: usize,

    pub mapped_delete: MappedDeletePolicy,

    /// Cache for B+Tree node blocks.
    pub node_cache: CachePolicy,

    /// Cache for record page blocks.
    pub record_cache: CachePolicy,

    /// fsync block files during commit preparation.
    pub sync_on_commit: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            file_mode: FileMode::Direct,
            segment_size: DEFAULT_SEGMENT_SIZE,
            mapped_delete: MappedDeletePolicy::Remove,
            node_cache: CachePolicy::default(),
            record_cache: CachePolicy::default(),
            sync_on_commit: true,
        }
    }
}

impl StoreConfig {
    /// In-memory configuration with the given block size. Handy for tests.
    pub fn memory(block_size: usize) -> Self {
        StoreConfig {
            block_size,
            file_mode: FileMode::Memory,
            ..StoreConfig::default()
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_file_mode(mut self, file_mode: FileMode) -> Self {
        self.file_mode = file_mode;
        self
    }

    pub fn with_caches(mut self, node_cache: CachePolicy, record_cache: CachePolicy) -> Self {
        self.node_cache = node_cache;
        self.record_cache = record_cache;
        self
    }

    /// Settings for the node-block manager of an index.
    pub fn node_mgr(&self) -> BlockMgrConfig {
        self.block_mgr(self.node_cache)
    }

    /// Settings for the record-page manager of an index.
    pub fn record_mgr(&self) -> BlockMgrConfig {
        self.block_mgr(self.record_cache)
    }

    fn block_mgr(&self, cache: CachePolicy) -> BlockMgrConfig {
        BlockMgrConfig {
            block_size: self.block_size,
            file_mode: self.file_mode,
            segment_size: self.segment_size,
            mapped_delete: self.mapped_delete,
            cache,
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: StoreConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.block_size < MIN_BLOCK_SIZE || !self.block_size.is_power_of_two() {
            return Err(VaultError::InvalidBlockSize(self.block_size));
        }

        // Node pointers are stored as u32 block ids; a block must also be
        // addressable by a u16 record count.
        if self.block_size > u16::MAX as usize + 1 {
            return Err(VaultError::InvalidBlockSize(self.block_size));
        }

        if self.file_mode == FileMode::Mapped
            && (self.segment_size < self.block_size || self.segment_size % self.block_size != 0)
        {
            return Err(VaultError::Config(format!(
                "Segment size {} must be a non-zero multiple of block size {}",
                self.segment_size, self.block_size
            )));
        }

        self.node_cache.validate("Node")?;
        self.record_cache.validate("Record")?;
        Ok(())
    }
}

/// Settings for one block manager, split out of a [`StoreConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMgrConfig {
    pub block_size: usize,
    pub file_mode: FileMode,
    pub segment_size: usize,
    pub mapped_delete: MappedDeletePolicy,
    pub cache: CachePolicy,
}

impl BlockMgrConfig {
    pub fn memory(block_size: usize) -> Self {
        StoreConfig::memory(block_size).node_mgr()
    }
}
