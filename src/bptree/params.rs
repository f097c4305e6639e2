//! B+Tree shape: order and record page capacity derived from the block size

use crate::error::{Result, VaultError};
use crate::record::RecordFactory;

/// Bytes of node header: kind, reserved, key count.
pub const NODE_HEADER: usize = 4;

/// Bytes of record page header: record count, reserved.
pub const PAGE_HEADER: usize = 4;

/// Bytes per on-disk child pointer.
pub const POINTER_LEN: usize = 4;

/// Largest order a block of `block_size` bytes can hold for `key_len`-byte
/// keys: `4 + (order-1)*key_len + order*4 <= block_size`.
pub fn calc_order(block_size: usize, key_len: usize) -> usize {
    (block_size.saturating_sub(NODE_HEADER) + key_len) / (key_len + POINTER_LEN)
}

/// Records of `record_len` bytes that fit in one record page.
pub fn calc_page_capacity(block_size: usize, record_len: usize) -> usize {
    if record_len == 0 {
        return 0;
    }
    block_size.saturating_sub(PAGE_HEADER) / record_len
}

/// Fixed parameters of one B+Tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BPlusTreeParams {
    block_size: usize,
    order: usize,
    page_capacity: usize,
    factory: RecordFactory,
}

impl BPlusTreeParams {
    /// Parameters with the largest order the block size allows.
    pub fn new(block_size: usize, factory: RecordFactory) -> Result<Self> {
        Self::build(block_size, calc_order(block_size, factory.key_len()), factory)
    }

    /// Parameters with an explicitly chosen order, which must be exactly the
    /// one the block size implies.
    pub fn with_order(block_size: usize, order: usize, factory: RecordFactory) -> Result<Self> {
        let expected = calc_order(block_size, factory.key_len());
        if order != expected {
            return Err(VaultError::Config(format!(
                "Order {} does not match block size {} with {}-byte keys (expected {})",
                order,
                block_size,
                factory.key_len(),
                expected
            )));
        }
        Self::build(block_size, order, factory)
    }

    fn build(block_size: usize, order: usize, factory: RecordFactory) -> Result<Self> {
        if factory.key_len() == 0 {
            return Err(VaultError::Config("Key length must be non-zero".into()));
        }
        if order < 3 {
            return Err(VaultError::Config(format!(
                "Block size {} gives order {} for {}-byte keys; at least 3 is required",
                block_size,
                order,
                factory.key_len()
            )));
        }
        let page_capacity = calc_page_capacity(block_size, factory.record_len());
        if page_capacity < 2 {
            return Err(VaultError::Config(format!(
                "Block size {} holds {} records of {} bytes; at least 2 are required",
                block_size,
                page_capacity,
                factory.record_len()
            )));
        }
        Ok(BPlusTreeParams {
            block_size,
            order,
            page_capacity,
            factory,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Maximum children per node.
    pub fn order(&self) -> usize {
        self.order
    }

    /// Maximum keys per node.
    pub fn max_keys(&self) -> usize {
        self.order - 1
    }

    /// Minimum children of a non-root node.
    pub fn min_children(&self) -> usize {
        self.order.div_ceil(2)
    }

    /// Maximum records per page.
    pub fn page_capacity(&self) -> usize {
        self.page_capacity
    }

    /// Minimum records per page, except the sole page of a single-leaf tree.
    pub fn min_records(&self) -> usize {
        self.page_capacity.div_ceil(2)
    }

    pub fn factory(&self) -> RecordFactory {
        self.factory
    }

    pub fn key_len(&self) -> usize {
        self.factory.key_len()
    }

    pub fn record_len(&self) -> usize {
        self.factory.record_len()
    }

    /// Byte offset of the child pointer area in a node block.
    pub(crate) fn pointer_offset(&self) -> usize {
        NODE_HEADER + self.max_keys() * self.key_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calc_order() {
        // 8 KiB blocks with 24-byte keys (three 8-byte ids)
        assert_eq!(calc_order(8192, 24), 293);
        // Tiny blocks used by tests
        assert_eq!(calc_order(64, 8), 5);
        let order = calc_order(8192, 24);
        assert!(NODE_HEADER + (order - 1) * 24 + order * 4 <= 8192);
        assert!(NODE_HEADER + order * 24 + (order + 1) * 4 > 8192);
    }

    #[test]
    fn test_calc_page_capacity() {
        assert_eq!(calc_page_capacity(8192, 24), 341);
        assert_eq!(calc_page_capacity(64, 16), 3);
        assert_eq!(calc_page_capacity(64, 0), 0);
    }

    #[test]
    fn test_minimums() {
        let params = BPlusTreeParams::new(64, RecordFactory::new(8, 8)).unwrap();
        assert_eq!(params.order(), 5);
        assert_eq!(params.min_children(), 3);
        assert_eq!(params.page_capacity(), 3);
        assert_eq!(params.min_records(), 2);
        assert_eq!(params.pointer_offset(), 4 + 4 * 8);
    }

    #[test]
    fn test_explicit_order_must_match() {
        let factory = RecordFactory::new(8, 0);
        assert!(BPlusTreeParams::with_order(64, 5, factory).is_ok());
        assert!(matches!(
            BPlusTreeParams::with_order(64, 4, factory),
            Err(VaultError::Config(_))
        ));
    }

    #[test]
    fn test_too_small_rejected() {
        // 64-byte blocks cannot hold two 40-byte records
        assert!(BPlusTreeParams::new(64, RecordFactory::new(20, 20)).is_err());
        // nor an order-3 node of 30-byte keys
        assert!(BPlusTreeParams::new(64, RecordFactory::new(30, 0)).is_err());
    }
}
