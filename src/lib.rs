//! # blockvault - Transactional Block Storage Engine
//!
//! `blockvault` stores fixed-length binary records in B+Tree range indexes
//! built on cached, fixed-size disk blocks, with a write-ahead journal that
//! makes multi-component commits atomic and recoverable.
//!
//! - **B+Tree range index** over two block files (nodes and record pages)
//! - **Block managers** with direct, memory-mapped or in-memory storage and
//!   LRU, write-back or adaptive (ARC) caching
//! - **Write-ahead journal** with torn-tail tolerant recovery
//! - **Transactions**: one writer, many snapshot readers, copy-on-write trees
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blockvault::{BPlusTree, Location, RecordFactory, Result, StoreConfig};
//!
//! # fn main() -> Result<()> {
//! let location = Location::dir("/tmp/vault")?;
//! let factory = RecordFactory::new(8, 8);
//! let tree = BPlusTree::create(&location, "SPO", &StoreConfig::default(), factory)?;
//!
//! tree.insert(&factory.create_kv(&1u64.to_be_bytes(), b"value-01")?)?;
//! let found = tree.find(&factory.create_key(&1u64.to_be_bytes())?)?;
//! assert!(found.is_some());
//!
//! tree.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Transactions
//!
//! ```rust,no_run
//! use blockvault::txn::{TransBPlusTree, TransactionCoordinator, TxnType};
//! use blockvault::{Location, RecordFactory, Result, StoreConfig};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let location = Location::dir("/tmp/vault")?;
//! let factory = RecordFactory::new(8, 0);
//! let tree = Arc::new(TransBPlusTree::create(
//!     &location,
//!     "SPO",
//!     &StoreConfig::default(),
//!     factory,
//! )?);
//!
//! let coordinator = TransactionCoordinator::new(&location)?;
//! coordinator.add(tree.clone())?;
//! coordinator.start()?; // replays anything committed before a crash
//!
//! coordinator.exec_write(|txn| {
//!     tree.insert(txn, &factory.create(&42u64.to_be_bytes())?)?;
//!     Ok(())
//! })?;
//!
//! let reader = coordinator.begin(TxnType::Read)?;
//! assert_eq!(tree.size(&reader)?, 1);
//! reader.commit()?;
//! coordinator.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod bptree;
pub mod config;
pub mod error;
pub mod index;
pub mod journal;
pub mod location;
pub mod nodetable;
pub mod objectfile;
pub mod record;
pub mod txn;

pub use block::{open_block_mgr, Block, BlockId, BlockMgr, BlockMgrFile, BlockMgrStats};
pub use bptree::{BPlusTree, BPlusTreeParams, RecordIter, TreeRoot};
pub use config::{BlockMgrConfig, CachePolicy, FileMode, MappedDeletePolicy, StoreConfig};
pub use error::{ErrorCategory, Result, VaultError};
pub use index::{RangeIndex, RangeIndexLogger, RangeIndexWrapper};
pub use journal::{Journal, JournalEntry, JournalEntryType};
pub use location::Location;
pub use nodetable::{NodeId, NodeTable};
pub use objectfile::{ObjectFile, ObjectFileMem, ObjectFileStorage};
pub use record::{Record, RecordFactory};
pub use txn::{Transaction, TransactionCoordinator, TxnType};
