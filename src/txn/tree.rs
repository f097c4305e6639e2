//! Transactional B+Tree
//!
//! The writer mutates a copy-on-write [`WriteState`], so blocks reachable
//! from the committed root never change. Readers keep the root that was
//! committed when they began. Commit publishes the writer's root; abort
//! rolls both block managers back to where they were at `begin`.
//!
//! Blocks superseded by a commit are not reclaimed.

use super::component::{ComponentId, TransactionalComponent, TxnId, TxnInfo};
use super::coordinator::Transaction;
use crate::block::BlockMgr;
use crate::bptree::{BPlusTree, RecordIter, TreeRoot, WriteState};
use crate::config::StoreConfig;
use crate::error::{Result, VaultError};
use crate::index::RangeIndex;
use crate::location::{ext, Location};
use crate::record::{Record, RecordFactory};
use ahash::AHashMap;
use parking_lot::Mutex;

struct WriterTxn {
    txn: TxnId,
    state: WriteState,
    /// Allocation limits at `begin`
    node_floor: u64,
    record_floor: u64,
    prepared: Option<TreeRoot>,
}

pub struct TransBPlusTree {
    id: ComponentId,
    label: String,
    tree: BPlusTree,
    sync_on_commit: bool,
    readers: Mutex<AHashMap<TxnId, TreeRoot>>,
    writer: Mutex<Option<WriterTxn>>,
}

impl TransBPlusTree {
    /// Open or create the tree `name` in `location`.
    pub fn create(
        location: &Location,
        name: &str,
        config: &StoreConfig,
        factory: RecordFactory,
    ) -> Result<Self> {
        let tree = BPlusTree::create(location, name, config, factory)?;
        Ok(Self::wrap(tree, config.sync_on_commit))
    }

    /// In-memory transactional tree.
    pub fn mem(name: &str, block_size: usize, factory: RecordFactory) -> Result<Self> {
        Ok(Self::wrap(BPlusTree::mem(name, block_size, factory)?, true))
    }

    /// Put an existing tree under transaction control. The tree must not be
    /// mutated directly afterwards.
    pub fn wrap(tree: BPlusTree, sync_on_commit: bool) -> Self {
        let label = format!("{}.{}", tree.name(), ext::TREE_STATE);
        TransBPlusTree {
            id: ComponentId::from_name(&label),
            label,
            tree,
            sync_on_commit,
            readers: Mutex::new(AHashMap::new()),
            writer: Mutex::new(None),
        }
    }

    /// The underlying tree, for inspection. Mutating it bypasses
    /// transactions.
    pub fn tree(&self) -> &BPlusTree {
        &self.tree
    }

    pub fn record_factory(&self) -> RecordFactory {
        self.tree.record_factory()
    }

    /// Root `txn` reads from.
    fn root_for(&self, txn: &Transaction) -> Result<TreeRoot> {
        let info = txn.check_active()?;
        if info.is_write() {
            if let Some(w) = self.writer.lock().as_ref().filter(|w| w.txn == info.id) {
                return Ok(w.state.root);
            }
        }
        self.readers
            .lock()
            .get(&info.id)
            .copied()
            .ok_or(VaultError::NotInTransaction)
    }

    fn with_writer<T>(
        &self,
        txn: &Transaction,
        f: impl FnOnce(&mut WriteState) -> Result<T>,
    ) -> Result<T> {
        let info = txn.check_write()?;
        let mut writer = self.writer.lock();
        let w = writer
            .as_mut()
            .filter(|w| w.txn == info.id)
            .ok_or(VaultError::NotInTransaction)?;
        f(&mut w.state)
    }

    pub fn find(&self, txn: &Transaction, key: &Record) -> Result<Option<Record>> {
        self.tree.check_key(key)?;
        let root = self.root_for(txn)?;
        self.tree.find_from(root.root, key)
    }

    pub fn contains(&self, txn: &Transaction, key: &Record) -> Result<bool> {
        Ok(self.find(txn, key)?.is_some())
    }

    pub fn insert(&self, txn: &Transaction, record: &Record) -> Result<bool> {
        self.tree.check_full_record(record)?;
        self.with_writer(txn, |state| self.tree.insert_in(state, record))
    }

    pub fn delete(&self, txn: &Transaction, key: &Record) -> Result<bool> {
        self.tree.check_key(key)?;
        self.with_writer(txn, |state| self.tree.delete_in(state, key))
    }

    pub fn clear(&self, txn: &Transaction) -> Result<()> {
        self.with_writer(txn, |state| self.tree.clear_in(state))
    }

    pub fn min_key(&self, txn: &Transaction) -> Result<Option<Record>> {
        self.tree.min_from(self.root_for(txn)?.root)
    }

    pub fn max_key(&self, txn: &Transaction) -> Result<Option<Record>> {
        self.tree.max_from(self.root_for(txn)?.root)
    }

    /// Records with `min <= key < max` as of `txn`.
    ///
    /// A writer must finish with the iterator before it next mutates the
    /// tree.
    pub fn iter_range(
        &self,
        txn: &Transaction,
        min: Option<&Record>,
        max: Option<&Record>,
    ) -> Result<RecordIter> {
        let root = self.root_for(txn)?;
        Ok(self.tree.iter_from(root.root, min.cloned(), max.cloned()))
    }

    pub fn iter(&self, txn: &Transaction) -> Result<RecordIter> {
        self.iter_range(txn, None, None)
    }

    pub fn size(&self, txn: &Transaction) -> Result<u64> {
        self.tree.size_from(self.root_for(txn)?.root)
    }

    pub fn is_empty(&self, txn: &Transaction) -> Result<bool> {
        Ok(self.min_key(txn)?.is_none())
    }

    pub fn check(&self, txn: &Transaction) -> Result<()> {
        self.tree.check_from(&self.root_for(txn)?).map(|_| ())
    }

    /// This tree as a [`RangeIndex`] bound to `txn`.
    pub fn index<'a>(&'a self, txn: &'a Transaction) -> TxnIndex<'a> {
        TxnIndex { tree: self, txn }
    }

    fn reset_to_committed(&self) {
        let root = self.tree.root();
        self.tree.node_mgr().reset_allocation(root.node_limit);
        self.tree.record_mgr().reset_allocation(root.record_limit);
    }
}

impl TransactionalComponent for TransBPlusTree {
    fn component_id(&self) -> ComponentId {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn start_recovery(&self) -> Result<()> {
        Ok(())
    }

    fn recover(&self, payload: &[u8]) -> Result<()> {
        let root = TreeRoot::from_bytes(payload)?;
        tracing::debug!(tree = %self.label, ?root, "Recovering tree root");
        self.tree.node_mgr().ensure_limit(root.node_limit);
        self.tree.record_mgr().ensure_limit(root.record_limit);
        self.tree.publish(root)
    }

    fn finish_recovery(&self) -> Result<()> {
        self.reset_to_committed();
        Ok(())
    }

    fn clean_start(&self) -> Result<()> {
        self.reset_to_committed();
        Ok(())
    }

    fn begin(&self, txn: &TxnInfo) -> Result<()> {
        let root = self.tree.root();
        if !txn.is_write() {
            self.readers.lock().insert(txn.id, root);
            return Ok(());
        }

        let mut writer = self.writer.lock();
        if let Some(w) = writer.as_ref() {
            tracing::warn!(tree = %self.label, writer = w.txn, txn = txn.id, "Second writer refused");
            return Err(VaultError::WriterSlotBusy);
        }
        *writer = Some(WriterTxn {
            txn: txn.id,
            state: WriteState::copy_on_write(root),
            node_floor: self.tree.node_mgr().allocation_limit(),
            record_floor: self.tree.record_mgr().allocation_limit(),
            prepared: None,
        });
        Ok(())
    }

    fn commit_prepare(&self, txn: &TxnInfo) -> Result<Option<Vec<u8>>> {
        let mut writer = self.writer.lock();
        let w = writer
            .as_mut()
            .filter(|w| w.txn == txn.id)
            .ok_or(VaultError::NotInTransaction)?;

        let nodes = self.tree.node_mgr();
        let records = self.tree.record_mgr();
        if w.state.root == self.tree.root()
            && nodes.allocation_limit() == w.node_floor
            && records.allocation_limit() == w.record_floor
        {
            let (fresh_nodes, fresh_pages) = w.state.fresh_blocks();
            if fresh_nodes.is_empty() && fresh_pages.is_empty() {
                return Ok(None);
            }
        }

        if self.sync_on_commit {
            nodes.sync()?;
            records.sync()?;
        }
        let mut root = w.state.root;
        root.node_limit = nodes.allocation_limit();
        root.record_limit = records.allocation_limit();
        w.prepared = Some(root);
        tracing::debug!(tree = %self.label, txn = txn.id, ?root, "Prepared");
        Ok(Some(root.to_bytes().to_vec()))
    }

    fn commit(&self, txn: &TxnInfo) -> Result<()> {
        let prepared = self
            .writer
            .lock()
            .as_ref()
            .filter(|w| w.txn == txn.id)
            .and_then(|w| w.prepared);
        match prepared {
            Some(root) => self.tree.publish(root),
            None => Ok(()),
        }
    }

    fn commit_end(&self, _txn: &TxnInfo) -> Result<()> {
        Ok(())
    }

    fn abort(&self, txn: &TxnInfo) -> Result<()> {
        let w = {
            let mut writer = self.writer.lock();
            match writer.as_ref() {
                Some(w) if w.txn == txn.id => writer.take(),
                _ => None,
            }
        };
        let w = match w {
            Some(w) => w,
            None => return Ok(()),
        };

        let nodes = self.tree.node_mgr();
        let records = self.tree.record_mgr();
        nodes.reset_allocation(w.node_floor);
        records.reset_allocation(w.record_floor);

        // Fresh blocks below the floor came off the free list
        let (fresh_nodes, fresh_pages) = w.state.fresh_blocks();
        for id in fresh_nodes.into_iter().filter(|&id| id < w.node_floor) {
            nodes.free(id)?;
        }
        for id in fresh_pages.into_iter().filter(|&id| id < w.record_floor) {
            records.free(id)?;
        }
        tracing::debug!(tree = %self.label, txn = txn.id, "Rolled back");
        Ok(())
    }

    fn end(&self, txn: &TxnInfo) {
        if txn.is_write() {
            let mut writer = self.writer.lock();
            if writer.as_ref().map_or(false, |w| w.txn == txn.id) {
                *writer = None;
            }
        } else {
            self.readers.lock().remove(&txn.id);
        }
    }

    fn shutdown(&self) -> Result<()> {
        self.tree.close()
    }
}

/// A [`TransBPlusTree`] seen through one transaction.
///
/// `sync` and `close` are no-ops; durability comes from committing the
/// transaction.
pub struct TxnIndex<'a> {
    tree: &'a TransBPlusTree,
    txn: &'a Transaction,
}

impl RangeIndex for TxnIndex<'_> {
    fn find(&self, key: &Record) -> Result<Option<Record>> {
        self.tree.find(self.txn, key)
    }

    fn insert(&self, record: &Record) -> Result<bool> {
        self.tree.insert(self.txn, record)
    }

    fn delete(&self, key: &Record) -> Result<bool> {
        self.tree.delete(self.txn, key)
    }

    fn min_key(&self) -> Result<Option<Record>> {
        self.tree.min_key(self.txn)
    }

    fn max_key(&self) -> Result<Option<Record>> {
        self.tree.max_key(self.txn)
    }

    fn iter_range(&self, min: Option<&Record>, max: Option<&Record>) -> RecordIter {
        // A finished transaction reads the committed tree
        match self.tree.root_for(self.txn) {
            Ok(root) => self.tree.tree.iter_from(root.root, min.cloned(), max.cloned()),
            Err(_) => self.tree.tree.iter_range(min, max),
        }
    }

    fn clear(&self) -> Result<()> {
        self.tree.clear(self.txn)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn check(&self) -> Result<()> {
        self.tree.check(self.txn)
    }

    fn size(&self) -> Result<u64> {
        self.tree.size(self.txn)
    }

    fn is_empty(&self) -> Result<bool> {
        self.tree.is_empty(self.txn)
    }

    fn record_factory(&self) -> RecordFactory {
        self.tree.record_factory()
    }
}
