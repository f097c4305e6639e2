//! Structural validation
//!
//! `check` walks the whole tree and verifies:
//! - keys strictly ascending in every node and page
//! - every key and record within the bounds its parent separators give it
//! - all leaf nodes at the same depth
//! - occupancy: non-root nodes hold `min_children..=order` children, a branch
//!   root at least two, and record pages `min_records..=capacity` records
//!   (the sole page of a single-leaf tree may hold fewer)
//! - no block reachable twice, and every block allocated and not freed

use super::node::NodeKind;
use super::state::TreeRoot;
use super::{BPlusTree, MAX_DEPTH};
use crate::block::BlockId;
use crate::error::{Result, VaultError};
use crate::record::Record;
use ahash::AHashSet;
use std::cmp::Ordering;

struct Walk<'a> {
    tree: &'a BPlusTree,
    leaf_depth: Option<usize>,
    seen_nodes: AHashSet<BlockId>,
    seen_pages: AHashSet<BlockId>,
    records: u64,
}

impl Walk<'_> {
    fn fail(&self, msg: String) -> VaultError {
        VaultError::Corrupt(format!("Tree {}: {}", self.tree.name, msg))
    }

    fn in_bounds(key: &Record, lo: Option<&Record>, hi: Option<&Record>) -> bool {
        lo.map_or(true, |lo| Record::compare(key, lo) != Ordering::Less)
            && hi.map_or(true, |hi| Record::compare(key, hi) == Ordering::Less)
    }

    fn node(
        &mut self,
        id: BlockId,
        lo: Option<&Record>,
        hi: Option<&Record>,
        depth: usize,
        root: Option<NodeKind>,
    ) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(self.fail(format!("deeper than {} levels", MAX_DEPTH)));
        }
        if !self.tree.nodes.valid(id) {
            return Err(self.fail(format!("node {} is not an allocated block", id)));
        }
        if !self.seen_nodes.insert(id) {
            return Err(self.fail(format!("node {} is reachable twice", id)));
        }

        let node = self.tree.read_node(id)?;
        let params = &self.tree.params;

        if let Some(kind) = root {
            if node.kind != kind {
                return Err(self.fail(format!(
                    "root {} is {:?} but state says {:?}",
                    id, node.kind, kind
                )));
            }
            if node.kind == NodeKind::Branch && node.children.len() < 2 {
                return Err(self.fail(format!("branch root {} has one child", id)));
            }
        } else if node.children.len() < params.min_children() {
            return Err(self.fail(format!(
                "node {} has {} children, minimum is {}",
                id,
                node.children.len(),
                params.min_children()
            )));
        }
        if node.children.len() > params.order() {
            return Err(self.fail(format!(
                "node {} has {} children, order is {}",
                id,
                node.children.len(),
                params.order()
            )));
        }

        for (i, key) in node.keys.iter().enumerate() {
            if !Self::in_bounds(key, lo, hi) {
                return Err(self.fail(format!("node {} key {:?} outside its bounds", id, key)));
            }
            if i > 0 && Record::compare(&node.keys[i - 1], key) != Ordering::Less {
                return Err(self.fail(format!("node {} keys out of order at {}", id, i)));
            }
        }

        let sole_page = root.is_some() && node.is_leaf() && node.children.len() == 1;
        for (i, &child) in node.children.iter().enumerate() {
            let child_lo = if i == 0 { lo } else { Some(&node.keys[i - 1]) };
            let child_hi = if i == node.keys.len() { hi } else { Some(&node.keys[i]) };
            if node.is_leaf() {
                self.page(child, child_lo, child_hi, sole_page)?;
            } else {
                self.node(child, child_lo, child_hi, depth + 1, None)?;
            }
        }

        if node.is_leaf() {
            match self.leaf_depth {
                None => self.leaf_depth = Some(depth),
                Some(expected) if expected != depth => {
                    return Err(self.fail(format!(
                        "leaf node {} at depth {}, others at {}",
                        id, depth, expected
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn page(
        &mut self,
        id: BlockId,
        lo: Option<&Record>,
        hi: Option<&Record>,
        sole_page: bool,
    ) -> Result<()> {
        if !self.tree.records.valid(id) {
            return Err(self.fail(format!("record page {} is not an allocated block", id)));
        }
        if !self.seen_pages.insert(id) {
            return Err(self.fail(format!("record page {} is reachable twice", id)));
        }

        let page = self.tree.read_page(id)?;
        let params = &self.tree.params;
        if !sole_page && page.records.len() < params.min_records() {
            return Err(self.fail(format!(
                "record page {} has {} records, minimum is {}",
                id,
                page.records.len(),
                params.min_records()
            )));
        }

        for (i, record) in page.records.iter().enumerate() {
            if !Self::in_bounds(record, lo, hi) {
                return Err(self.fail(format!(
                    "record page {} record {:?} outside its bounds",
                    id, record
                )));
            }
            if i > 0 && Record::compare(&page.records[i - 1], record) != Ordering::Less {
                return Err(self.fail(format!("record page {} out of order at {}", id, i)));
            }
        }
        self.records += page.records.len() as u64;
        Ok(())
    }
}

impl BPlusTree {
    /// Validate the tree under `root`. Returns the number of records.
    pub(crate) fn check_from(&self, root: &TreeRoot) -> Result<u64> {
        let mut walk = Walk {
            tree: self,
            leaf_depth: None,
            seen_nodes: AHashSet::new(),
            seen_pages: AHashSet::new(),
            records: 0,
        };
        walk.node(root.root, None, None, 0, Some(root.root_kind))?;
        tracing::trace!(
            tree = %self.name,
            nodes = walk.seen_nodes.len(),
            pages = walk.seen_pages.len(),
            records = walk.records,
            "Tree check passed"
        );
        Ok(walk.records)
    }
}
