//! On-disk layout of tree nodes and record pages
//!
//! Node block:
//!
//! ```text
//! [kind:u8][reserved:u8][count:u16 BE]
//! [key 0] .. [key order-2]          (order-1 slots of key_len bytes)
//! [ptr 0] .. [ptr order-1]          (order slots, u32 BE block ids)
//! ```
//!
//! Record page block:
//!
//! ```text
//! [count:u16 BE][reserved:u16][record 0] .. [record capacity-1]
//! ```

use super::params::{BPlusTreeParams, NODE_HEADER, PAGE_HEADER, POINTER_LEN};
use crate::block::{Block, BlockId, MAX_BLOCK_ID};
use crate::error::{Result, VaultError};
use crate::record::Record;
use std::cmp::Ordering;

/// What a node's children are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    /// Children are other nodes.
    Branch = 1,
    /// Children are record pages.
    Leaf = 2,
}

impl NodeKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(NodeKind::Branch),
            2 => Some(NodeKind::Leaf),
            _ => None,
        }
    }
}

/// Index of the child covering `key`: child `i` holds keys `>= keys[i-1]`
/// and `< keys[i]`.
pub fn child_index(keys: &[Record], key: &Record) -> usize {
    keys.partition_point(|k| Record::compare(k, key) != Ordering::Greater)
}

/// Decoded tree node.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: BlockId,
    pub kind: NodeKind,
    /// Separator keys (key-only records)
    pub keys: Vec<Record>,
    /// `keys.len() + 1` child block ids
    pub children: Vec<BlockId>,
}

impl Node {
    pub fn new(id: BlockId, kind: NodeKind) -> Self {
        Node {
            id,
            kind,
            keys: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    pub fn decode(block: &Block, params: &BPlusTreeParams) -> Result<Self> {
        let data = block.data();
        if data.len() != params.block_size() {
            return Err(VaultError::corrupt(format!(
                "Node {} has {} bytes, expected {}",
                block.id(),
                data.len(),
                params.block_size()
            )));
        }

        let kind = NodeKind::from_u8(data[0]).ok_or_else(|| {
            VaultError::corrupt(format!("Node {} has invalid kind {}", block.id(), data[0]))
        })?;
        let count = u16::from_be_bytes([data[2], data[3]]) as usize;
        if count > params.max_keys() {
            return Err(VaultError::corrupt(format!(
                "Node {} claims {} keys, order {} allows {}",
                block.id(),
                count,
                params.order(),
                params.max_keys()
            )));
        }

        let key_len = params.key_len();
        let factory = params.factory();
        let mut keys = Vec::with_capacity(count);
        for i in 0..count {
            let start = NODE_HEADER + i * key_len;
            keys.push(factory.create_key(&data[start..start + key_len])?);
        }

        let base = params.pointer_offset();
        let mut children = Vec::with_capacity(count + 1);
        for i in 0..=count {
            let start = base + i * POINTER_LEN;
            let mut ptr = [0u8; POINTER_LEN];
            ptr.copy_from_slice(&data[start..start + POINTER_LEN]);
            children.push(u32::from_be_bytes(ptr) as BlockId);
        }

        Ok(Node {
            id: block.id(),
            kind,
            keys,
            children,
        })
    }

    /// Encode into a block-sized buffer. Unused slots are zeroed.
    pub fn encode(&self, params: &BPlusTreeParams, buf: &mut [u8]) -> Result<()> {
        if self.keys.len() > params.max_keys() || self.children.len() != self.keys.len() + 1 {
            return Err(VaultError::corrupt(format!(
                "Node {} has {} keys and {} children, cannot encode at order {}",
                self.id,
                self.keys.len(),
                self.children.len(),
                params.order()
            )));
        }

        buf.fill(0);
        buf[0] = self.kind as u8;
        buf[2..4].copy_from_slice(&(self.keys.len() as u16).to_be_bytes());

        let key_len = params.key_len();
        for (i, key) in self.keys.iter().enumerate() {
            let start = NODE_HEADER + i * key_len;
            buf[start..start + key_len].copy_from_slice(key.key());
        }

        let base = params.pointer_offset();
        for (i, &child) in self.children.iter().enumerate() {
            if child > MAX_BLOCK_ID {
                return Err(VaultError::InvalidBlockId(child));
            }
            let start = base + i * POINTER_LEN;
            buf[start..start + POINTER_LEN].copy_from_slice(&(child as u32).to_be_bytes());
        }
        Ok(())
    }
}

/// Decoded record page: full records in key order.
#[derive(Debug, Clone)]
pub struct RecordPage {
    pub id: BlockId,
    pub records: Vec<Record>,
}

impl RecordPage {
    pub fn new(id: BlockId) -> Self {
        RecordPage {
            id,
            records: Vec::new(),
        }
    }

    /// Position of `key`, or where it would be inserted.
    pub fn search(&self, key: &Record) -> std::result::Result<usize, usize> {
        self.records
            .binary_search_by(|r| Record::compare(r, key))
    }

    pub fn decode(block: &Block, params: &BPlusTreeParams) -> Result<Self> {
        let data = block.data();
        if data.len() != params.block_size() {
            return Err(VaultError::corrupt(format!(
                "Record page {} has {} bytes, expected {}",
                block.id(),
                data.len(),
                params.block_size()
            )));
        }

        let count = u16::from_be_bytes([data[0], data[1]]) as usize;
        if count > params.page_capacity() {
            return Err(VaultError::corrupt(format!(
                "Record page {} claims {} records, capacity is {}",
                block.id(),
                count,
                params.page_capacity()
            )));
        }

        let rec_len = params.record_len();
        let factory = params.factory();
        let mut records = Vec::with_capacity(count);
        for i in 0..count {
            let start = PAGE_HEADER + i * rec_len;
            records.push(factory.create(&data[start..start + rec_len])?);
        }

        Ok(RecordPage {
            id: block.id(),
            records,
        })
    }

    pub fn encode(&self, params: &BPlusTreeParams, buf: &mut [u8]) -> Result<()> {
        if self.records.len() > params.page_capacity() {
            return Err(VaultError::corrupt(format!(
                "Record page {} has {} records, capacity is {}",
                self.id,
                self.records.len(),
                params.page_capacity()
            )));
        }

        buf.fill(0);
        buf[0..2].copy_from_slice(&(self.records.len() as u16).to_be_bytes());
        let rec_len = params.record_len();
        for (i, record) in self.records.iter().enumerate() {
            if record.len() != rec_len {
                return Err(VaultError::InvalidRecordLength {
                    expected: rec_len,
                    actual: record.len(),
                });
            }
            let start = PAGE_HEADER + i * rec_len;
            buf[start..start + rec_len].copy_from_slice(record.as_bytes());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordFactory;

    fn params() -> BPlusTreeParams {
        BPlusTreeParams::new(64, RecordFactory::new(8, 8)).unwrap()
    }

    fn key(n: u64) -> Record {
        RecordFactory::new(8, 8).create_key(&n.to_be_bytes()).unwrap()
    }

    #[test]
    fn test_node_codec() {
        let params = params();
        let mut node = Node::new(7, NodeKind::Branch);
        node.keys = vec![key(10), key(20), key(30)];
        node.children = vec![1, 2, 3, 4];

        let mut buf = vec![0xFFu8; 64];
        node.encode(&params, &mut buf).unwrap();
        assert_eq!(buf[0], NodeKind::Branch as u8);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 3);

        let decoded = Node::decode(&Block::new(7, buf), &params).unwrap();
        assert_eq!(decoded.kind, NodeKind::Branch);
        assert_eq!(decoded.keys, node.keys);
        assert_eq!(decoded.children, node.children);
    }

    #[test]
    fn test_zeroed_block_is_not_a_node() {
        let params = params();
        let result = Node::decode(&Block::new(0, vec![0u8; 64]), &params);
        assert!(matches!(result, Err(VaultError::Corrupt(_))));
    }

    #[test]
    fn test_overfull_node_rejected() {
        let params = params();
        let mut node = Node::new(0, NodeKind::Leaf);
        node.keys = (0..5).map(key).collect();
        node.children = (0..6).collect();
        assert!(node.encode(&params, &mut vec![0u8; 64]).is_err());

        let mut buf = vec![0u8; 64];
        buf[0] = NodeKind::Leaf as u8;
        buf[3] = 9;
        assert!(Node::decode(&Block::new(0, buf), &params).is_err());
    }

    #[test]
    fn test_child_index() {
        let keys = vec![key(10), key(20)];
        assert_eq!(child_index(&keys, &key(5)), 0);
        assert_eq!(child_index(&keys, &key(10)), 1);
        assert_eq!(child_index(&keys, &key(15)), 1);
        assert_eq!(child_index(&keys, &key(20)), 2);
        assert_eq!(child_index(&keys, &key(99)), 2);
        assert_eq!(child_index(&[], &key(1)), 0);
    }

    #[test]
    fn test_page_codec_and_search() {
        let params = params();
        let factory = params.factory();
        let mut page = RecordPage::new(3);
        for n in [1u64, 5, 9] {
            page.records
                .push(factory.create_kv(&n.to_be_bytes(), &(n * 100).to_be_bytes()).unwrap());
        }

        let mut buf = vec![0u8; 64];
        page.encode(&params, &mut buf).unwrap();
        let decoded = RecordPage::decode(&Block::new(3, buf), &params).unwrap();
        assert_eq!(decoded.records.len(), 3);
        assert!(decoded.records[2].same_bytes(&page.records[2]));

        assert_eq!(decoded.search(&key(5)), Ok(1));
        assert_eq!(decoded.search(&key(6)), Err(2));
    }
}
