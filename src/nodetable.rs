//! Node table: byte values to compact ids
//!
//! Values are appended to an object file once; the id of a value is its
//! offset there. A B+Tree keyed by the xxh3-128 hash of the value maps back
//! from value to id.

use crate::bptree::BPlusTree;
use crate::config::StoreConfig;
use crate::error::{Result, VaultError};
use crate::index::RangeIndex;
use crate::location::Location;
use crate::objectfile::{open_object_file, ObjectFile, ObjectIter};
use crate::record::{Record, RecordFactory};
use parking_lot::Mutex;
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_128;

/// Id of a stored value.
pub type NodeId = u64;

const HASH_LEN: usize = 16;
const ID_LEN: usize = 8;

pub struct NodeTable {
    objects: Arc<dyn ObjectFile>,
    index: Box<dyn RangeIndex>,
    factory: RecordFactory,
    /// Serializes lookup-then-append
    alloc: Mutex<()>,
}

impl NodeTable {
    /// Record layout of the hash index.
    pub fn record_factory() -> RecordFactory {
        RecordFactory::new(HASH_LEN, ID_LEN)
    }

    /// Open or create node table `name` in `location`: objects in
    /// `<name>.obj`, hash index in `<name>-hash.*`.
    pub fn create(location: &Location, name: &str, config: &StoreConfig) -> Result<Self> {
        let objects = open_object_file(location, name)?;
        let index = BPlusTree::create(
            location,
            &format!("{}-hash", name),
            config,
            Self::record_factory(),
        )?;
        Self::with_parts(objects, Box::new(index))
    }

    pub fn mem(name: &str) -> Result<Self> {
        Self::create(&Location::mem(), name, &StoreConfig::memory(4096))
    }

    pub fn with_parts(objects: Arc<dyn ObjectFile>, index: Box<dyn RangeIndex>) -> Result<Self> {
        let factory = index.record_factory();
        if factory != Self::record_factory() {
            return Err(VaultError::Config(format!(
                "Node table index needs {}+{} byte records, got {}+{}",
                HASH_LEN,
                ID_LEN,
                factory.key_len(),
                factory.value_len()
            )));
        }
        Ok(NodeTable {
            objects,
            index,
            factory,
            alloc: Mutex::new(()),
        })
    }

    fn hash_key(&self, value: &[u8]) -> Result<Record> {
        self.factory
            .create_key(&xxh3_128(value).to_be_bytes())
    }

    fn id_of(record: &Record) -> NodeId {
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(record.value());
        NodeId::from_be_bytes(bytes)
    }

    fn lookup(&self, value: &[u8]) -> Result<Option<NodeId>> {
        let key = self.hash_key(value)?;
        let record = match self.index.find(&key)? {
            Some(record) => record,
            None => return Ok(None),
        };
        let id = Self::id_of(&record);
        if self.objects.read(id)? != value {
            return Err(VaultError::corrupt(format!(
                "Node table hash collision or damage at id {}",
                id
            )));
        }
        Ok(Some(id))
    }

    /// Id of `value`, if it has one.
    pub fn get_node_id(&self, value: &[u8]) -> Result<Option<NodeId>> {
        self.lookup(value)
    }

    /// Id of `value`, storing it first if needed.
    pub fn get_alloc_node_id(&self, value: &[u8]) -> Result<NodeId> {
        let _alloc = self.alloc.lock();
        if let Some(id) = self.lookup(value)? {
            return Ok(id);
        }
        let id = self.objects.write(value)?;
        let record = self
            .factory
            .create_kv(&xxh3_128(value).to_be_bytes(), &id.to_be_bytes())?;
        self.index.insert(&record)?;
        tracing::trace!(id, len = value.len(), "Allocated node id");
        Ok(id)
    }

    /// The value stored under `id`.
    pub fn get_node(&self, id: NodeId) -> Result<Vec<u8>> {
        self.objects.read(id)
    }

    /// Every stored value with its id, in id order.
    pub fn iter(&self) -> ObjectIter<'_> {
        self.objects.iter()
    }

    /// Number of stored values.
    pub fn size(&self) -> Result<u64> {
        self.index.size()
    }

    pub fn check(&self) -> Result<()> {
        self.index.check()
    }

    /// Objects first, so the index never points past the object file.
    pub fn sync(&self) -> Result<()> {
        self.objects.sync()?;
        self.index.sync()
    }

    pub fn close(&self) -> Result<()> {
        self.objects.close()?;
        self.index.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_alloc_is_idempotent() {
        let table = NodeTable::mem("nodes").unwrap();
        let a = table.get_alloc_node_id(b"<http://example/a>").unwrap();
        let b = table.get_alloc_node_id(b"\"literal\"").unwrap();
        assert_ne!(a, b);
        assert_eq!(table.get_alloc_node_id(b"<http://example/a>").unwrap(), a);
        assert_eq!(table.size().unwrap(), 2);

        assert_eq!(table.get_node(b).unwrap(), b"\"literal\"");
        assert_eq!(table.get_node_id(b"\"literal\"").unwrap(), Some(b));
        assert_eq!(table.get_node_id(b"missing").unwrap(), None);
    }

    #[test]
    fn test_many_values() {
        let table = NodeTable::mem("nodes").unwrap();
        let ids: Vec<NodeId> = (0..2000)
            .map(|i| table.get_alloc_node_id(format!("value-{}", i).as_bytes()).unwrap())
            .collect();
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(table.get_node(*id).unwrap(), format!("value-{}", i).as_bytes());
        }
        table.check().unwrap();
        assert_eq!(table.iter().count(), 2000);
    }

    #[test]
    fn test_persists() {
        let temp = TempDir::new().unwrap();
        let location = Location::dir(temp.path()).unwrap();
        let config = StoreConfig::default().with_block_size(1024);
        let id = {
            let table = NodeTable::create(&location, "nodes", &config).unwrap();
            let id = table.get_alloc_node_id(b"kept").unwrap();
            table.close().unwrap();
            id
        };
        let table = NodeTable::create(&location, "nodes", &config).unwrap();
        assert_eq!(table.get_node_id(b"kept").unwrap(), Some(id));
        assert_eq!(table.get_alloc_node_id(b"kept").unwrap(), id);
    }

    #[test]
    fn test_rejects_wrong_index_shape() {
        let index = BPlusTree::mem("bad", 1024, RecordFactory::new(8, 8)).unwrap();
        assert!(matches!(
            NodeTable::with_parts(Arc::new(crate::objectfile::ObjectFileMem::new("o")), Box::new(index)),
            Err(VaultError::Config(_))
        ));
    }
}
