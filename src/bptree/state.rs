//! Persisted tree root
//!
//! A tree's root node moves whenever the root splits, collapses or is copied
//! on write, so the root id is stored outside the node file together with the
//! allocation limits of both block files:
//!
//! ```text
//! [root:u64 BE][node_limit:u64 BE][record_limit:u64 BE][root_kind:u8]
//! ```

use super::node::NodeKind;
use crate::block::BlockId;
use crate::error::{Result, VaultError};
use crate::location::write_atomic;
use std::path::Path;

/// Encoded size of a [`TreeRoot`].
pub const TREE_ROOT_LEN: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeRoot {
    pub root: BlockId,
    pub root_kind: NodeKind,
    pub node_limit: u64,
    pub record_limit: u64,
}

impl TreeRoot {
    pub fn to_bytes(&self) -> [u8; TREE_ROOT_LEN] {
        let mut buf = [0u8; TREE_ROOT_LEN];
        buf[0..8].copy_from_slice(&self.root.to_be_bytes());
        buf[8..16].copy_from_slice(&self.node_limit.to_be_bytes());
        buf[16..24].copy_from_slice(&self.record_limit.to_be_bytes());
        buf[24] = self.root_kind as u8;
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != TREE_ROOT_LEN {
            return Err(VaultError::corrupt(format!(
                "Tree state must be {} bytes, got {}",
                TREE_ROOT_LEN,
                bytes.len()
            )));
        }
        let read_u64 = |at: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[at..at + 8]);
            u64::from_be_bytes(word)
        };
        let root_kind = NodeKind::from_u8(bytes[24])
            .ok_or_else(|| VaultError::corrupt(format!("Invalid root kind {}", bytes[24])))?;

        let root = TreeRoot {
            root: read_u64(0),
            node_limit: read_u64(8),
            record_limit: read_u64(16),
            root_kind,
        };
        if root.root >= root.node_limit {
            return Err(VaultError::corrupt(format!(
                "Root node {} lies beyond node limit {}",
                root.root, root.node_limit
            )));
        }
        Ok(root)
    }

    /// Read a state file. `None` if it does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match std::fs::read(path) {
            Ok(bytes) => Self::from_bytes(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the state file atomically (write aside, fsync, rename).
    pub fn store(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("idx.bpt");
        assert!(TreeRoot::load(&path).unwrap().is_none());

        let root = TreeRoot {
            root: 12,
            root_kind: NodeKind::Branch,
            node_limit: 40,
            record_limit: 300,
        };
        root.store(&path).unwrap();
        assert_eq!(TreeRoot::load(&path).unwrap(), Some(root));
    }

    #[test]
    fn test_bad_state_rejected() {
        assert!(TreeRoot::from_bytes(&[0u8; 10]).is_err());

        let mut bytes = TreeRoot {
            root: 1,
            root_kind: NodeKind::Leaf,
            node_limit: 2,
            record_limit: 2,
        }
        .to_bytes();
        bytes[24] = 0;
        assert!(TreeRoot::from_bytes(&bytes).is_err());

        let beyond = TreeRoot {
            root: 5,
            root_kind: NodeKind::Leaf,
            node_limit: 2,
            record_limit: 2,
        };
        assert!(TreeRoot::from_bytes(&beyond.to_bytes()).is_err());
    }
}
