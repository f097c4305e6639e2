//! Transactions
//!
//! A [`TransactionCoordinator`] owns the journal and a set of
//! [`TransactionalComponent`]s. Components stage changes during a write
//! transaction, hand the coordinator a REDO payload at commit, and replay
//! those payloads when the store restarts after a crash.
//!
//! ```rust,no_run
//! use blockvault::txn::{TransBlob, TransactionCoordinator, TxnType};
//! use blockvault::Location;
//! use std::sync::Arc;
//!
//! # fn main() -> blockvault::Result<()> {
//! let location = Location::dir("/tmp/vault")?;
//! let coordinator = TransactionCoordinator::new(&location)?;
//! let blob = Arc::new(TransBlob::new(&location, "greeting")?);
//! coordinator.add(blob.clone())?;
//! coordinator.start()?;
//!
//! let txn = coordinator.begin(TxnType::Write)?;
//! blob.set(&txn, b"Hello Journal")?;
//! txn.commit()?;
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod component;
pub mod coordinator;
pub mod objfile;
pub mod tree;

pub use blob::TransBlob;
pub use component::{ComponentId, TransactionalComponent, TxnId, TxnInfo, TxnType};
pub use coordinator::{Transaction, TransactionCoordinator};
pub use objfile::TransObjectFile;
pub use tree::{TransBPlusTree, TxnIndex};
