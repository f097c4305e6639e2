//! Tree mutation and point lookups
//!
//! Insert and delete recurse from the root and rewrite nodes on the way back
//! up. A child that moved (copy-on-write) or split is patched into its
//! parent; a parent left unchanged is not rewritten.
//!
//! Underflow repair, for pages and nodes alike: borrow from the left sibling
//! if it has a spare entry, else from the right sibling; failing both, merge
//! into the left sibling if there is one, else merge the right sibling in.

use super::node::{child_index, Node, NodeKind, RecordPage};
use super::{BPlusTree, WriteState, MAX_DEPTH};
use crate::block::BlockId;
use crate::error::{Result, VaultError};
use crate::record::Record;

/// Result of inserting below one node.
struct Inserted {
    /// Where the node now lives
    id: BlockId,
    /// Whether a new key was added
    added: bool,
    /// Separator and block id of a new right sibling
    split: Option<(Record, BlockId)>,
}

fn too_deep(depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(VaultError::corrupt(format!(
            "Tree deeper than {} levels; node pointers form a cycle",
            MAX_DEPTH
        )));
    }
    Ok(())
}

impl BPlusTree {
    pub(crate) fn find_from(&self, root: BlockId, key: &Record) -> Result<Option<Record>> {
        let mut node = self.read_node(root)?;
        for _ in 0..=MAX_DEPTH {
            let child = node.children[child_index(&node.keys, key)];
            if node.is_leaf() {
                let page = self.read_page(child)?;
                return Ok(page.search(key).ok().map(|pos| page.records[pos].clone()));
            }
            node = self.read_node(child)?;
        }
        Err(VaultError::corrupt("Tree too deep"))
    }

    pub(crate) fn min_from(&self, root: BlockId) -> Result<Option<Record>> {
        let page = self.edge_page(root, false)?;
        Ok(page.records.first().cloned())
    }

    pub(crate) fn max_from(&self, root: BlockId) -> Result<Option<Record>> {
        let page = self.edge_page(root, true)?;
        Ok(page.records.last().cloned())
    }

    /// Leftmost or rightmost record page. Only the sole page of a
    /// single-leaf tree can be empty, so this is where the extreme key is.
    fn edge_page(&self, root: BlockId, rightmost: bool) -> Result<RecordPage> {
        let mut node = self.read_node(root)?;
        for _ in 0..=MAX_DEPTH {
            let child = if rightmost {
                node.children[node.children.len() - 1]
            } else {
                node.children[0]
            };
            if node.is_leaf() {
                return self.read_page(child);
            }
            node = self.read_node(child)?;
        }
        Err(VaultError::corrupt("Tree too deep"))
    }

    pub(crate) fn size_from(&self, root: BlockId) -> Result<u64> {
        fn walk(tree: &BPlusTree, id: BlockId, depth: usize) -> Result<u64> {
            too_deep(depth)?;
            let node = tree.read_node(id)?;
            let mut total = 0;
            for &child in &node.children {
                total += if node.is_leaf() {
                    tree.read_page(child)?.records.len() as u64
                } else {
                    walk(tree, child, depth + 1)?
                };
            }
            Ok(total)
        }
        walk(self, root, 0)
    }

    // Insert

    pub(crate) fn insert_in(&self, state: &mut WriteState, record: &Record) -> Result<bool> {
        let root = self.read_node(state.root.root)?;
        let outcome = self.insert_below(state, root, record, 0)?;
        state.root.root = outcome.id;

        if let Some((separator, right)) = outcome.split {
            let mut new_root = Node::new(0, NodeKind::Branch);
            new_root.keys.push(separator);
            new_root.children.extend([outcome.id, right]);
            self.write_new_node(state, &mut new_root)?;
            tracing::debug!(tree = %self.name, root = new_root.id, "Root split, tree grew a level");
            state.root.root = new_root.id;
            state.root.root_kind = NodeKind::Branch;
        }
        Ok(outcome.added)
    }

    fn insert_below(
        &self,
        state: &mut WriteState,
        mut node: Node,
        record: &Record,
        depth: usize,
    ) -> Result<Inserted> {
        too_deep(depth)?;
        let idx = child_index(&node.keys, record);
        let child_id = node.children[idx];

        let below = if node.is_leaf() {
            self.insert_into_page(state, child_id, record)?
        } else {
            let child = self.read_node(child_id)?;
            self.insert_below(state, child, record, depth + 1)?
        };

        if below.id == child_id && below.split.is_none() {
            return Ok(Inserted {
                id: node.id,
                added: below.added,
                split: None,
            });
        }

        node.children[idx] = below.id;
        if let Some((separator, right)) = below.split {
            node.keys.insert(idx, separator);
            node.children.insert(idx + 1, right);
        }

        let split = if node.children.len() > self.params.order() {
            Some(self.split_node(state, &mut node)?)
        } else {
            None
        };
        self.write_node(state, &mut node)?;

        Ok(Inserted {
            id: node.id,
            added: below.added,
            split,
        })
    }

    fn insert_into_page(
        &self,
        state: &mut WriteState,
        page_id: BlockId,
        record: &Record,
    ) -> Result<Inserted> {
        let mut page = self.read_page(page_id)?;
        let added = match page.search(record) {
            Ok(pos) => {
                if page.records[pos].same_bytes(record) {
                    return Ok(Inserted {
                        id: page_id,
                        added: false,
                        split: None,
                    });
                }
                page.records[pos] = record.clone();
                false
            }
            Err(pos) => {
                page.records.insert(pos, record.clone());
                true
            }
        };

        let split = if page.records.len() > self.params.page_capacity() {
            let mid = page.records.len() / 2;
            let mut right = RecordPage::new(0);
            right.records = page.records.split_off(mid);
            let separator = right.records[0].key_record();
            self.write_new_page(state, &mut right)?;
            tracing::trace!(tree = %self.name, left = page.id, right = right.id, "Split record page");
            Some((separator, right.id))
        } else {
            None
        };
        self.write_page(state, &mut page)?;

        Ok(Inserted {
            id: page.id,
            added,
            split,
        })
    }

    /// Split an overfull node, promoting its median key.
    fn split_node(&self, state: &mut WriteState, node: &mut Node) -> Result<(Record, BlockId)> {
        let mid = node.keys.len() / 2;
        let mut right_keys = node.keys.split_off(mid);
        let promoted = right_keys.remove(0);

        let mut right = Node::new(0, node.kind);
        right.keys = right_keys;
        right.children = node.children.split_off(mid + 1);
        self.write_new_node(state, &mut right)?;
        tracing::trace!(tree = %self.name, left = node.id, right = right.id, "Split node");
        Ok((promoted, right.id))
    }

    // Delete

    pub(crate) fn delete_in(&self, state: &mut WriteState, key: &Record) -> Result<bool> {
        let root = self.read_node(state.root.root)?;
        let (root, removed) = self.delete_below(state, root, key, true, 0)?;
        state.root.root = root.id;

        if removed && root.kind == NodeKind::Branch && root.children.len() == 1 {
            let child = self.read_node(root.children[0])?;
            self.drop_node(state, root.id)?;
            tracing::debug!(tree = %self.name, root = child.id, "Root collapsed, tree lost a level");
            state.root.root = child.id;
            state.root.root_kind = child.kind;
        }
        Ok(removed)
    }

    /// Delete below `node`, returning the node as it now stands. The caller
    /// repairs the node if it is left under-full.
    fn delete_below(
        &self,
        state: &mut WriteState,
        mut node: Node,
        key: &Record,
        is_root: bool,
        depth: usize,
    ) -> Result<(Node, bool)> {
        too_deep(depth)?;
        let idx = child_index(&node.keys, key);
        let child_id = node.children[idx];

        if node.is_leaf() {
            let mut page = self.read_page(child_id)?;
            let pos = match page.search(key) {
                Ok(pos) => pos,
                Err(_) => return Ok((node, false)),
            };
            page.records.remove(pos);

            let sole_page = is_root && node.children.len() == 1;
            if sole_page || page.records.len() >= self.params.min_records() {
                self.write_page(state, &mut page)?;
                if page.id == child_id {
                    return Ok((node, true));
                }
                node.children[idx] = page.id;
            } else {
                self.rebalance_page(state, &mut node, idx, page)?;
            }
        } else {
            let child = self.read_node(child_id)?;
            let (child, removed) = self.delete_below(state, child, key, false, depth + 1)?;
            if !removed {
                return Ok((node, false));
            }
            if child.children.len() >= self.params.min_children() {
                if child.id == child_id {
                    return Ok((node, true));
                }
                node.children[idx] = child.id;
            } else {
                self.rebalance_node(state, &mut node, idx, child)?;
            }
        }

        self.write_node(state, &mut node)?;
        Ok((node, true))
    }

    /// Repair the under-full page at `idx` of leaf node `node`.
    fn rebalance_page(
        &self,
        state: &mut WriteState,
        node: &mut Node,
        idx: usize,
        mut page: RecordPage,
    ) -> Result<()> {
        let min = self.params.min_records();

        let mut left = None;
        if idx > 0 {
            let mut sibling = self.read_page(node.children[idx - 1])?;
            if sibling.records.len() > min {
                if let Some(moved) = sibling.records.pop() {
                    page.records.insert(0, moved);
                    node.keys[idx - 1] = page.records[0].key_record();
                    self.write_page(state, &mut sibling)?;
                    self.write_page(state, &mut page)?;
                    node.children[idx - 1] = sibling.id;
                    node.children[idx] = page.id;
                    tracing::trace!(tree = %self.name, page = page.id, "Borrowed record from left page");
                    return Ok(());
                }
            }
            left = Some(sibling);
        }

        let mut right = None;
        if idx + 1 < node.children.len() {
            let mut sibling = self.read_page(node.children[idx + 1])?;
            if sibling.records.len() > min {
                let moved = sibling.records.remove(0);
                page.records.push(moved);
                node.keys[idx] = sibling.records[0].key_record();
                self.write_page(state, &mut page)?;
                self.write_page(state, &mut sibling)?;
                node.children[idx] = page.id;
                node.children[idx + 1] = sibling.id;
                tracing::trace!(tree = %self.name, page = page.id, "Borrowed record from right page");
                return Ok(());
            }
            right = Some(sibling);
        }

        if let Some(mut left) = left {
            left.records.append(&mut page.records);
            self.write_page(state, &mut left)?;
            self.drop_page(state, page.id)?;
            node.keys.remove(idx - 1);
            node.children.remove(idx);
            node.children[idx - 1] = left.id;
            tracing::trace!(tree = %self.name, into = left.id, "Merged page into left sibling");
        } else if let Some(right) = right {
            page.records.extend(right.records);
            self.write_page(state, &mut page)?;
            self.drop_page(state, right.id)?;
            node.keys.remove(idx);
            node.children.remove(idx + 1);
            node.children[idx] = page.id;
            tracing::trace!(tree = %self.name, into = page.id, "Merged right sibling into page");
        } else {
            self.write_page(state, &mut page)?;
            node.children[idx] = page.id;
        }
        Ok(())
    }

    /// Repair the under-full child node at `idx` of `parent`.
    fn rebalance_node(
        &self,
        state: &mut WriteState,
        parent: &mut Node,
        idx: usize,
        mut child: Node,
    ) -> Result<()> {
        let min = self.params.min_children();

        let mut left = None;
        if idx > 0 {
            let mut sibling = self.read_node(parent.children[idx - 1])?;
            if sibling.children.len() > min {
                if let (Some(key), Some(grandchild)) = (sibling.keys.pop(), sibling.children.pop()) {
                    let separator = std::mem::replace(&mut parent.keys[idx - 1], key);
                    child.keys.insert(0, separator);
                    child.children.insert(0, grandchild);
                    self.write_node(state, &mut sibling)?;
                    self.write_node(state, &mut child)?;
                    parent.children[idx - 1] = sibling.id;
                    parent.children[idx] = child.id;
                    tracing::trace!(tree = %self.name, node = child.id, "Borrowed child from left node");
                    return Ok(());
                }
            }
            left = Some(sibling);
        }

        let mut right = None;
        if idx + 1 < parent.children.len() {
            let mut sibling = self.read_node(parent.children[idx + 1])?;
            if sibling.children.len() > min {
                let key = sibling.keys.remove(0);
                let grandchild = sibling.children.remove(0);
                let separator = std::mem::replace(&mut parent.keys[idx], key);
                child.keys.push(separator);
                child.children.push(grandchild);
                self.write_node(state, &mut child)?;
                self.write_node(state, &mut sibling)?;
                parent.children[idx] = child.id;
                parent.children[idx + 1] = sibling.id;
                tracing::trace!(tree = %self.name, node = child.id, "Borrowed child from right node");
                return Ok(());
            }
            right = Some(sibling);
        }

        if let Some(mut left) = left {
            left.keys.push(parent.keys.remove(idx - 1));
            left.keys.append(&mut child.keys);
            left.children.append(&mut child.children);
            self.write_node(state, &mut left)?;
            self.drop_node(state, child.id)?;
            parent.children.remove(idx);
            parent.children[idx - 1] = left.id;
            tracing::trace!(tree = %self.name, into = left.id, "Merged node into left sibling");
        } else if let Some(mut right) = right {
            child.keys.push(parent.keys.remove(idx));
            child.keys.append(&mut right.keys);
            child.children.append(&mut right.children);
            self.write_node(state, &mut child)?;
            self.drop_node(state, right.id)?;
            parent.children.remove(idx + 1);
            parent.children[idx] = child.id;
            tracing::trace!(tree = %self.name, into = child.id, "Merged right sibling into node");
        } else {
            self.write_node(state, &mut child)?;
            parent.children[idx] = child.id;
        }
        Ok(())
    }

    // Clear

    pub(crate) fn clear_in(&self, state: &mut WriteState) -> Result<()> {
        let old_root = state.root.root;
        self.drop_subtree(state, old_root, 0)?;

        let mut page = RecordPage::new(0);
        self.write_new_page(state, &mut page)?;
        let mut root = Node::new(0, NodeKind::Leaf);
        root.children.push(page.id);
        self.write_new_node(state, &mut root)?;

        tracing::debug!(tree = %self.name, root = root.id, "Cleared tree");
        state.root.root = root.id;
        state.root.root_kind = NodeKind::Leaf;
        Ok(())
    }

    fn drop_subtree(&self, state: &mut WriteState, id: BlockId, depth: usize) -> Result<()> {
        too_deep(depth)?;
        let node = self.read_node(id)?;
        for &child in &node.children {
            if node.is_leaf() {
                self.drop_page(state, child)?;
            } else {
                self.drop_subtree(state, child, depth + 1)?;
            }
        }
        self.drop_node(state, id)
    }
}
