//! B+Tree over fixed-length records
//!
//! The tree lives in two block files: one of nodes (`.idn`) and one of record
//! pages (`.dat`). Nodes hold separator keys only; every record lives in a
//! record page hanging off a leaf node. There are no sibling links, so range
//! scans walk down from the root with an explicit stack.
//!
//! Mutations run against a [`WriteState`]. Outside a transaction blocks are
//! updated in place. Inside a write transaction the tree is copy-on-write:
//! any block the committed tree can see is copied to a fresh block before it
//! changes, and the copy propagates up to a new root. Readers holding the old
//! root keep seeing the old tree.

pub mod check;
pub mod iter;
pub mod node;
mod ops;
pub mod params;
pub mod state;

pub use iter::RecordIter;
pub use node::NodeKind;
pub use params::BPlusTreeParams;
pub use state::TreeRoot;

use crate::block::{open_block_mgr, Block, BlockId, BlockMgr, BlockMgrStats};
use crate::config::StoreConfig;
use crate::error::{Result, VaultError};
use crate::location::{ext, Location};
use crate::record::{Record, RecordFactory};
use ahash::AHashSet;
use node::{Node, RecordPage};
use parking_lot::RwLock;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Deepest tree a traversal will follow before declaring a pointer cycle.
pub(crate) const MAX_DEPTH: usize = 64;

/// Working state of one sequence of mutations.
pub(crate) struct WriteState {
    pub(crate) root: TreeRoot,
    cow: bool,
    fresh_nodes: AHashSet<BlockId>,
    fresh_pages: AHashSet<BlockId>,
}

impl WriteState {
    /// Modify blocks where they are.
    pub(crate) fn in_place(root: TreeRoot) -> Self {
        WriteState {
            root,
            cow: false,
            fresh_nodes: AHashSet::new(),
            fresh_pages: AHashSet::new(),
        }
    }

    /// Never modify a block that was not allocated by this state.
    pub(crate) fn copy_on_write(root: TreeRoot) -> Self {
        WriteState {
            cow: true,
            ..Self::in_place(root)
        }
    }

    fn can_modify_node(&self, id: BlockId) -> bool {
        !self.cow || self.fresh_nodes.contains(&id)
    }

    fn can_modify_page(&self, id: BlockId) -> bool {
        !self.cow || self.fresh_pages.contains(&id)
    }

    /// Blocks allocated by this state and still in use.
    pub(crate) fn fresh_blocks(&self) -> (Vec<BlockId>, Vec<BlockId>) {
        (
            self.fresh_nodes.iter().copied().collect(),
            self.fresh_pages.iter().copied().collect(),
        )
    }
}

/// A B+Tree range index.
pub struct BPlusTree {
    name: String,
    params: BPlusTreeParams,
    nodes: Arc<dyn BlockMgr>,
    records: Arc<dyn BlockMgr>,
    root: RwLock<TreeRoot>,
    state_path: Option<PathBuf>,
}

impl BPlusTree {
    /// Open or create the tree `name` in `location`.
    pub fn create(
        location: &Location,
        name: &str,
        config: &StoreConfig,
        factory: RecordFactory,
    ) -> Result<Self> {
        config.validate()?;
        let params = BPlusTreeParams::new(config.block_size, factory)?;
        let nodes = open_block_mgr(&config.node_mgr(), location, name, ext::NODES)?;
        let records = open_block_mgr(&config.record_mgr(), location, name, ext::RECORDS)?;
        Self::open(
            name,
            params,
            nodes,
            records,
            location.path(name, ext::TREE_STATE),
        )
    }

    /// In-memory tree.
    pub fn mem(name: &str, block_size: usize, factory: RecordFactory) -> Result<Self> {
        Self::create(&Location::mem(), name, &StoreConfig::memory(block_size), factory)
    }

    /// Open a tree over existing block managers.
    ///
    /// With a state file, the tree resumes from the persisted root and both
    /// managers forget anything allocated after it was written. Without
    /// one, the node file must be empty and a fresh tree is created.
    pub fn open(
        name: &str,
        params: BPlusTreeParams,
        nodes: Arc<dyn BlockMgr>,
        records: Arc<dyn BlockMgr>,
        state_path: Option<PathBuf>,
    ) -> Result<Self> {
        for mgr in [&nodes, &records] {
            if mgr.block_size() != params.block_size() {
                return Err(VaultError::Config(format!(
                    "Block manager {} has block size {}, tree expects {}",
                    mgr.label(),
                    mgr.block_size(),
                    params.block_size()
                )));
            }
        }

        let persisted = match state_path.as_deref() {
            Some(path) => TreeRoot::load(path)?,
            None => None,
        };

        let (root, created) = match persisted {
            Some(root) => {
                nodes.reset_allocation(root.node_limit);
                records.reset_allocation(root.record_limit);
                (root, false)
            }
            None => {
                if nodes.allocation_limit() != 0 {
                    return Err(VaultError::corrupt(format!(
                        "Tree {} has a node file but no state file",
                        name
                    )));
                }
                (Self::create_empty(&params, &*nodes, &*records)?, true)
            }
        };

        let tree = BPlusTree {
            name: name.to_string(),
            params,
            nodes,
            records,
            root: RwLock::new(root),
            state_path,
        };
        if created {
            tracing::debug!(
                tree = %tree.name,
                order = params.order(),
                capacity = params.page_capacity(),
                "Created tree"
            );
            tree.sync()?;
        }
        Ok(tree)
    }

    fn create_empty(
        params: &BPlusTreeParams,
        nodes: &dyn BlockMgr,
        records: &dyn BlockMgr,
    ) -> Result<TreeRoot> {
        let mut page_block = records.allocate()?;
        let page_id = page_block.id();
        RecordPage::new(page_id).encode(params, page_block.data_mut())?;
        records.write(page_block)?;

        let mut node_block = nodes.allocate()?;
        let mut root = Node::new(node_block.id(), NodeKind::Leaf);
        root.children.push(page_id);
        root.encode(params, node_block.data_mut())?;
        nodes.write(node_block)?;

        Ok(TreeRoot {
            root: root.id,
            root_kind: NodeKind::Leaf,
            node_limit: nodes.allocation_limit(),
            record_limit: records.allocation_limit(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &BPlusTreeParams {
        &self.params
    }

    pub fn record_factory(&self) -> RecordFactory {
        self.params.factory()
    }

    /// Currently published root.
    pub fn root(&self) -> TreeRoot {
        *self.root.read()
    }

    pub fn node_mgr(&self) -> &Arc<dyn BlockMgr> {
        &self.nodes
    }

    pub fn record_mgr(&self) -> &Arc<dyn BlockMgr> {
        &self.records
    }

    /// (node manager stats, record manager stats)
    pub fn stats(&self) -> (BlockMgrStats, BlockMgrStats) {
        (self.nodes.stats(), self.records.stats())
    }

    pub(crate) fn check_full_record(&self, record: &Record) -> Result<()> {
        if record.len() != self.params.record_len() {
            return Err(VaultError::InvalidRecordLength {
                expected: self.params.record_len(),
                actual: record.len(),
            });
        }
        self.params.factory().accepts(record)
    }

    pub(crate) fn check_key(&self, key: &Record) -> Result<()> {
        self.params.factory().accepts(key)
    }

    /// Look up the record with `key`'s key.
    pub fn find(&self, key: &Record) -> Result<Option<Record>> {
        self.check_key(key)?;
        let root = self.root();
        self.find_from(root.root, key)
    }

    pub fn contains(&self, key: &Record) -> Result<bool> {
        Ok(self.find(key)?.is_some())
    }

    /// Insert or overwrite. Returns `true` if the key was not present.
    pub fn insert(&self, record: &Record) -> Result<bool> {
        self.check_full_record(record)?;
        let mut root = self.root.write();
        let mut state = WriteState::in_place(*root);
        let result = self.insert_in(&mut state, record);
        *root = state.root;
        result
    }

    /// Remove the record with `key`'s key. Returns `true` if it was present.
    pub fn delete(&self, key: &Record) -> Result<bool> {
        self.check_key(key)?;
        let mut root = self.root.write();
        let mut state = WriteState::in_place(*root);
        let result = self.delete_in(&mut state, key);
        *root = state.root;
        result
    }

    /// Remove every record.
    pub fn clear(&self) -> Result<()> {
        let mut root = self.root.write();
        let mut state = WriteState::in_place(*root);
        let result = self.clear_in(&mut state);
        *root = state.root;
        result
    }

    pub fn min_key(&self) -> Result<Option<Record>> {
        self.min_from(self.root().root)
    }

    pub fn max_key(&self) -> Result<Option<Record>> {
        self.max_from(self.root().root)
    }

    /// Every record, ascending.
    pub fn iter(&self) -> RecordIter {
        self.iter_from(self.root().root, None, None)
    }

    /// Records with `min <= key < max`, ascending. Either bound may be open.
    pub fn iter_range(&self, min: Option<&Record>, max: Option<&Record>) -> RecordIter {
        self.iter_from(self.root().root, min.cloned(), max.cloned())
    }

    pub(crate) fn iter_from(
        &self,
        root: BlockId,
        min: Option<Record>,
        max: Option<Record>,
    ) -> RecordIter {
        RecordIter::new(
            Arc::clone(&self.nodes),
            Arc::clone(&self.records),
            self.params,
            root,
            min,
            max,
        )
    }

    /// Number of records, by walking the tree.
    pub fn size(&self) -> Result<u64> {
        self.size_from(self.root().root)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.min_key()?.is_none())
    }

    /// Validate the whole structure.
    pub fn check(&self) -> Result<()> {
        self.check_from(&self.root()).map(|_| ())
    }

    /// Flush both block files and persist the root.
    pub fn sync(&self) -> Result<()> {
        self.nodes.sync()?;
        self.records.sync()?;
        let mut root = self.root.write();
        root.node_limit = self.nodes.allocation_limit();
        root.record_limit = self.records.allocation_limit();
        if let Some(path) = &self.state_path {
            root.store(path)?;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.sync()?;
        self.nodes.close()?;
        self.records.close()
    }

    /// Make `root` the committed root and persist it.
    pub(crate) fn publish(&self, root: TreeRoot) -> Result<()> {
        let mut current = self.root.write();
        if let Some(path) = &self.state_path {
            root.store(path)?;
        }
        *current = root;
        Ok(())
    }

    // Block plumbing shared by the mutation, iteration and check code

    pub(crate) fn read_node(&self, id: BlockId) -> Result<Node> {
        let block = self.nodes.get_read(id)?;
        Node::decode(&block, &self.params)
    }

    pub(crate) fn read_page(&self, id: BlockId) -> Result<RecordPage> {
        let block = self.records.get_read(id)?;
        RecordPage::decode(&block, &self.params)
    }

    fn fill_and_write(
        mgr: &dyn BlockMgr,
        mut block: Block,
        fill: impl FnOnce(&mut [u8]) -> Result<()>,
    ) -> Result<()> {
        if let Err(e) = fill(block.data_mut()) {
            mgr.release(block);
            return Err(e);
        }
        mgr.write(block)
    }

    /// Write a node that has never been stored; assigns its id.
    fn write_new_node(&self, state: &mut WriteState, node: &mut Node) -> Result<()> {
        let block = self.nodes.allocate()?;
        node.id = block.id();
        if state.cow {
            state.fresh_nodes.insert(node.id);
        }
        Self::fill_and_write(&*self.nodes, block, |buf| node.encode(&self.params, buf))
    }

    /// Write a modified node, copying it to a fresh block when required.
    /// `node.id` is updated if the node moved.
    fn write_node(&self, state: &mut WriteState, node: &mut Node) -> Result<()> {
        if !state.can_modify_node(node.id) {
            return self.write_new_node(state, node);
        }
        let block = self.nodes.get_write(node.id)?;
        Self::fill_and_write(&*self.nodes, block, |buf| node.encode(&self.params, buf))
    }

    fn write_new_page(&self, state: &mut WriteState, page: &mut RecordPage) -> Result<()> {
        let block = self.records.allocate()?;
        page.id = block.id();
        if state.cow {
            state.fresh_pages.insert(page.id);
        }
        Self::fill_and_write(&*self.records, block, |buf| page.encode(&self.params, buf))
    }

    fn write_page(&self, state: &mut WriteState, page: &mut RecordPage) -> Result<()> {
        if !state.can_modify_page(page.id) {
            return self.write_new_page(state, page);
        }
        let block = self.records.get_write(page.id)?;
        Self::fill_and_write(&*self.records, block, |buf| page.encode(&self.params, buf))
    }

    /// Give up a node block. Blocks the committed tree can still see are
    /// left alone.
    fn drop_node(&self, state: &mut WriteState, id: BlockId) -> Result<()> {
        if !state.cow || state.fresh_nodes.remove(&id) {
            self.nodes.free(id)
        } else {
            Ok(())
        }
    }

    fn drop_page(&self, state: &mut WriteState, id: BlockId) -> Result<()> {
        if !state.cow || state.fresh_pages.remove(&id) {
            self.records.free(id)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for BPlusTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BPlusTree")
            .field("name", &self.name)
            .field("order", &self.params.order())
            .field("page_capacity", &self.params.page_capacity())
            .field("root", &self.root())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CachePolicy, FileMode};
    use rand::seq::SliceRandom;
    use rand::{rngs::StdRng, SeedableRng};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn factory() -> RecordFactory {
        RecordFactory::new(8, 8)
    }

    fn rec(n: u64) -> Record {
        factory()
            .create_kv(&n.to_be_bytes(), &(n * 10).to_be_bytes())
            .unwrap()
    }

    fn key(n: u64) -> Record {
        factory().create_key(&n.to_be_bytes()).unwrap()
    }

    fn small_tree() -> BPlusTree {
        BPlusTree::mem("test", 64, factory()).unwrap()
    }

    #[test]
    fn test_empty_tree() {
        let tree = small_tree();
        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.size().unwrap(), 0);
        assert!(tree.min_key().unwrap().is_none());
        assert!(tree.max_key().unwrap().is_none());
        assert!(tree.find(&key(1)).unwrap().is_none());
        assert_eq!(tree.iter().count(), 0);
        tree.check().unwrap();
    }

    #[test]
    fn test_insert_and_find() {
        let tree = small_tree();
        for n in 0..50 {
            assert!(tree.insert(&rec(n)).unwrap());
        }
        tree.check().unwrap();
        for n in 0..50 {
            let found = tree.find(&key(n)).unwrap().unwrap();
            assert!(found.same_bytes(&rec(n)));
        }
        assert!(!tree.contains(&key(50)).unwrap());
        assert_eq!(tree.root().root_kind, NodeKind::Branch);
    }

    #[test]
    fn test_overwrite_keeps_one_record() {
        let tree = small_tree();
        tree.insert(&rec(7)).unwrap();
        let replacement = factory()
            .create_kv(&7u64.to_be_bytes(), &[0xAB; 8])
            .unwrap();
        assert!(!tree.insert(&replacement).unwrap());
        assert_eq!(tree.size().unwrap(), 1);
        assert_eq!(tree.find(&key(7)).unwrap().unwrap().value(), &[0xAB; 8]);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let tree = small_tree();
        let short = RecordFactory::new(8, 4).create(&[0u8; 12]).unwrap();
        assert!(matches!(
            tree.insert(&short),
            Err(VaultError::InvalidRecordLength { .. })
        ));
        // A key-only record is a lookup key, not something to store
        assert!(tree.insert(&key(1)).is_err());
    }

    #[test]
    fn test_min_max() {
        let tree = small_tree();
        for n in [40u64, 10, 30, 20, 50] {
            tree.insert(&rec(n)).unwrap();
        }
        assert_eq!(tree.min_key().unwrap().unwrap(), key(10));
        assert_eq!(tree.max_key().unwrap().unwrap(), key(50));
    }

    #[test]
    fn test_delete_rebalances() {
        let tree = small_tree();
        for n in 0..200 {
            tree.insert(&rec(n)).unwrap();
        }
        for n in (0..200).step_by(3) {
            assert!(tree.delete(&key(n)).unwrap());
            tree.check().unwrap();
        }
        assert!(!tree.delete(&key(0)).unwrap());
        assert_eq!(tree.size().unwrap(), 200 - 67);
    }

    #[test]
    fn test_delete_all_collapses_root() {
        let tree = small_tree();
        for n in 0..100 {
            tree.insert(&rec(n)).unwrap();
        }
        for n in 0..100 {
            assert!(tree.delete(&key(n)).unwrap());
        }
        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.root().root_kind, NodeKind::Leaf);
        tree.check().unwrap();
    }

    #[test]
    fn test_random_against_model() {
        let tree = small_tree();
        let mut model = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut keys: Vec<u64> = (0..300).collect();
        keys.shuffle(&mut rng);

        for &n in &keys {
            tree.insert(&rec(n)).unwrap();
            model.insert(n, ());
        }
        keys.shuffle(&mut rng);
        for &n in keys.iter().take(150) {
            tree.delete(&key(n)).unwrap();
            model.remove(&n);
        }
        tree.check().unwrap();

        let got: Vec<Record> = tree.iter().map(|r| r.unwrap()).collect();
        let expected: Vec<Record> = model.keys().map(|&n| key(n)).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_clear() {
        let tree = small_tree();
        for n in 0..80 {
            tree.insert(&rec(n)).unwrap();
        }
        tree.clear().unwrap();
        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.root().root_kind, NodeKind::Leaf);
        tree.check().unwrap();

        // Freed blocks are reused
        let limit = tree.node_mgr().allocation_limit();
        for n in 0..80 {
            tree.insert(&rec(n)).unwrap();
        }
        assert_eq!(tree.node_mgr().allocation_limit(), limit);
        assert_eq!(tree.size().unwrap(), 80);
    }

    #[test]
    fn test_reopen_from_state_file() {
        let temp = TempDir::new().unwrap();
        let location = Location::dir(temp.path()).unwrap();
        let config = StoreConfig::default()
            .with_block_size(128)
            .with_caches(CachePolicy::Adaptive { capacity: 16 }, CachePolicy::Read { capacity: 16 });

        {
            let tree = BPlusTree::create(&location, "SPO", &config, factory()).unwrap();
            for n in 0..500 {
                tree.insert(&rec(n)).unwrap();
            }
            tree.close().unwrap();
        }

        let tree = BPlusTree::create(&location, "SPO", &config, factory()).unwrap();
        assert_eq!(tree.size().unwrap(), 500);
        tree.check().unwrap();
        assert!(tree.find(&key(321)).unwrap().unwrap().same_bytes(&rec(321)));
    }

    #[test]
    fn test_mapped_tree() {
        let temp = TempDir::new().unwrap();
        let location = Location::dir(temp.path()).unwrap();
        let mut config = StoreConfig::default()
            .with_block_size(256)
            .with_file_mode(FileMode::Mapped);
        config.segment_size = 256 * 16;

        {
            let tree = BPlusTree::create(&location, "POS", &config, factory()).unwrap();
            for n in (0..400).rev() {
                tree.insert(&rec(n)).unwrap();
            }
            tree.close().unwrap();
        }
        let tree = BPlusTree::create(&location, "POS", &config, factory()).unwrap();
        assert_eq!(tree.size().unwrap(), 400);
        tree.check().unwrap();
    }

    #[test]
    fn test_node_file_without_state_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let location = Location::dir(temp.path()).unwrap();
        let config = StoreConfig::default().with_block_size(128);
        {
            let tree = BPlusTree::create(&location, "X", &config, factory()).unwrap();
            tree.close().unwrap();
        }
        std::fs::remove_file(location.path("X", ext::TREE_STATE).unwrap()).unwrap();
        assert!(matches!(
            BPlusTree::create(&location, "X", &config, factory()),
            Err(VaultError::Corrupt(_))
        ));
    }
}
