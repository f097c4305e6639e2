//! Range iteration
//!
//! Without sibling links, the cursor keeps the path from the root to the
//! current leaf as a stack of (node, next child) frames. Exhausting a record
//! page pops frames until one has an unvisited child, then descends along
//! the leftmost edge of that child to the next page.
//!
//! The cursor reads blocks through the block managers as it goes. It sees a
//! consistent tree only while no one mutates the blocks it reaches, which the
//! transaction layer guarantees by copy-on-write; outside a transaction,
//! mutating a tree during a scan gives unspecified results.

use super::node::{child_index, Node, RecordPage};
use super::params::BPlusTreeParams;
use super::MAX_DEPTH;
use crate::block::{BlockId, BlockMgr};
use crate::error::{Result, VaultError};
use crate::record::Record;
use std::cmp::Ordering;
use std::sync::Arc;

/// Lazy ascending scan over `[min, max)`.
pub struct RecordIter {
    nodes: Arc<dyn BlockMgr>,
    records: Arc<dyn BlockMgr>,
    params: BPlusTreeParams,
    min: Option<Record>,
    max: Option<Record>,
    /// Root to start from, until the first call to `next`
    start: Option<BlockId>,
    stack: Vec<(Node, usize)>,
    page: std::vec::IntoIter<Record>,
    done: bool,
}

impl RecordIter {
    pub(crate) fn new(
        nodes: Arc<dyn BlockMgr>,
        records: Arc<dyn BlockMgr>,
        params: BPlusTreeParams,
        root: BlockId,
        min: Option<Record>,
        max: Option<Record>,
    ) -> Self {
        RecordIter {
            nodes,
            records,
            params,
            min,
            max,
            start: Some(root),
            stack: Vec::new(),
            page: Vec::new().into_iter(),
            done: false,
        }
    }

    fn read_node(&self, id: BlockId) -> Result<Node> {
        let block = self.nodes.get_read(id)?;
        Node::decode(&block, &self.params)
    }

    fn read_page(&self, id: BlockId) -> Result<Vec<Record>> {
        let block = self.records.get_read(id)?;
        Ok(RecordPage::decode(&block, &self.params)?.records)
    }

    fn push(&mut self, node: Node, next: usize) -> Result<()> {
        if self.stack.len() >= MAX_DEPTH {
            return Err(VaultError::corrupt("Tree too deep during scan"));
        }
        self.stack.push((node, next));
        Ok(())
    }

    /// Descend from the root to the page that would hold `min`.
    fn seek(&mut self, root: BlockId) -> Result<()> {
        let mut node = self.read_node(root)?;
        loop {
            let idx = match &self.min {
                Some(min) => child_index(&node.keys, min),
                None => 0,
            };
            let child = node.children[idx];
            let leaf = node.is_leaf();
            self.push(node, idx + 1)?;

            if leaf {
                let mut records = self.read_page(child)?;
                if let Some(min) = &self.min {
                    let start =
                        records.partition_point(|r| Record::compare(r, min) == Ordering::Less);
                    records.drain(..start);
                }
                self.page = records.into_iter();
                return Ok(());
            }
            node = self.read_node(child)?;
        }
    }

    /// Move to the next record page. `false` when the tree is exhausted.
    fn advance(&mut self) -> Result<bool> {
        loop {
            let top = match self.stack.last_mut() {
                Some(top) => top,
                None => return Ok(false),
            };
            if top.1 >= top.0.children.len() {
                self.stack.pop();
                continue;
            }
            let child = top.0.children[top.1];
            top.1 += 1;

            if top.0.is_leaf() {
                self.page = self.read_page(child)?.into_iter();
                return Ok(true);
            }

            // Leftmost path down to a leaf
            let mut node = self.read_node(child)?;
            loop {
                let first = node.children[0];
                let leaf = node.is_leaf();
                self.push(node, 1)?;
                if leaf {
                    self.page = self.read_page(first)?.into_iter();
                    return Ok(true);
                }
                node = self.read_node(first)?;
            }
        }
    }

    fn fail(&mut self, err: VaultError) -> Option<Result<Record>> {
        self.done = true;
        self.stack.clear();
        Some(Err(err))
    }
}

impl Iterator for RecordIter {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(root) = self.start.take() {
            if let Err(e) = self.seek(root) {
                return self.fail(e);
            }
        }

        loop {
            if let Some(record) = self.page.next() {
                if let Some(max) = &self.max {
                    if Record::compare(&record, max) != Ordering::Less {
                        self.done = true;
                        self.stack.clear();
                        return None;
                    }
                }
                return Some(Ok(record));
            }
            match self.advance() {
                Ok(true) => continue,
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => return self.fail(e),
            }
        }
    }
}
