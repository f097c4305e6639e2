//! Transactional object file
//!
//! The committed length is the transaction boundary: readers see objects
//! below the length committed when they began, the writer appends past it,
//! and abort or recovery cut the file back to it. The committed length is
//! kept in `<name>.opos` and is also the REDO payload.

use super::component::{ComponentId, TransactionalComponent, TxnId, TxnInfo};
use super::coordinator::Transaction;
use crate::error::{Result, VaultError};
use crate::location::{ext, write_atomic, Location};
use crate::objectfile::{open_object_file, ObjectFile, ObjectIter};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct TransObjectFile {
    id: ComponentId,
    label: String,
    file: Arc<dyn ObjectFile>,
    state_path: Option<PathBuf>,
    committed: AtomicU64,
    /// Visible length per transaction
    txns: Mutex<AHashMap<TxnId, u64>>,
    prepared: Mutex<Option<(TxnId, u64)>>,
}

impl TransObjectFile {
    /// The object file `<name>.obj` of `location`, under transaction control.
    pub fn create(location: &Location, name: &str) -> Result<Self> {
        let file = open_object_file(location, name)?;
        Self::wrap(file, name, location.path(name, ext::OBJECTS_STATE))
    }

    pub fn mem(name: &str) -> Result<Self> {
        Self::create(&Location::mem(), name)
    }

    /// Wrap `file`. Without a state file, everything already in the file
    /// counts as committed.
    pub fn wrap(file: Arc<dyn ObjectFile>, name: &str, state_path: Option<PathBuf>) -> Result<Self> {
        let committed = match &state_path {
            Some(path) => match std::fs::read(path) {
                Ok(bytes) => decode_length(&bytes)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => file.length(),
                Err(e) => return Err(e.into()),
            },
            None => file.length(),
        };
        let label = format!("{}.{}", name, ext::OBJECTS);
        Ok(TransObjectFile {
            id: ComponentId::from_name(&label),
            label,
            file,
            state_path,
            committed: AtomicU64::new(committed),
            txns: Mutex::new(AHashMap::new()),
            prepared: Mutex::new(None),
        })
    }

    pub fn committed_length(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    /// Length visible to `txn`.
    pub fn length(&self, txn: &Transaction) -> Result<u64> {
        let info = txn.check_active()?;
        if info.is_write() {
            return Ok(self.file.length());
        }
        self.txns
            .lock()
            .get(&info.id)
            .copied()
            .ok_or(VaultError::NotInTransaction)
    }

    /// Append an object, returning its offset.
    pub fn write(&self, txn: &Transaction, bytes: &[u8]) -> Result<u64> {
        let info = txn.check_write()?;
        if !self.txns.lock().contains_key(&info.id) {
            return Err(VaultError::NotInTransaction);
        }
        self.file.write(bytes)
    }

    pub fn read(&self, txn: &Transaction, offset: u64) -> Result<Vec<u8>> {
        if offset >= self.length(txn)? {
            return Err(VaultError::InvalidOffset(offset));
        }
        self.file.read(offset)
    }

    /// Objects visible to `txn`.
    pub fn iter<'a>(&'a self, txn: &Transaction) -> Result<ObjectIter<'a>> {
        let end = self.length(txn)?;
        Ok(self.file.iter_range(0, end))
    }

    fn set_committed(&self, len: u64) -> Result<()> {
        if let Some(path) = &self.state_path {
            write_atomic(path, &len.to_be_bytes())?;
        }
        self.committed.store(len, Ordering::Release);
        Ok(())
    }

    /// Cut off anything past the committed length.
    fn trim(&self) -> Result<()> {
        let committed = self.committed_length();
        let len = self.file.length();
        if len < committed {
            return Err(VaultError::corrupt(format!(
                "{}: file holds {} bytes, {} committed",
                self.label, len, committed
            )));
        }
        if len > committed {
            tracing::info!(file = %self.label, len, committed, "Discarding uncommitted objects");
            self.file.truncate(committed)?;
        }
        Ok(())
    }
}

fn decode_length(bytes: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| VaultError::corrupt(format!("Object length record of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

impl TransactionalComponent for TransObjectFile {
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
        let len = decode_length(payload)?;
        tracing::debug!(file = %self.label, len, "Recovering committed length");
        self.set_committed(len)
    }

    fn finish_recovery(&self) -> Result<()> {
        self.trim()
    }

    fn clean_start(&self) -> Result<()> {
        self.trim()
    }

    fn begin(&self, txn: &TxnInfo) -> Result<()> {
        self.txns.lock().insert(txn.id, self.committed_length());
        Ok(())
    }

    fn commit_prepare(&self, txn: &TxnInfo) -> Result<Option<Vec<u8>>> {
        let len = self.file.length();
        if len == self.committed_length() {
            return Ok(None);
        }
        self.file.sync()?;
        *self.prepared.lock() = Some((txn.id, len));
        Ok(Some(len.to_be_bytes().to_vec()))
    }

    fn commit(&self, txn: &TxnInfo) -> Result<()> {
        let prepared = *self.prepared.lock();
        match prepared {
            Some((id, len)) if id == txn.id => self.set_committed(len),
            _ => Ok(()),
        }
    }

    fn commit_end(&self, txn: &TxnInfo) -> Result<()> {
        let mut prepared = self.prepared.lock();
        if prepared.map_or(false, |(id, _)| id == txn.id) {
            *prepared = None;
        }
        Ok(())
    }

    fn abort(&self, txn: &TxnInfo) -> Result<()> {
        if txn.is_write() {
            *self.prepared.lock() = None;
            self.file.truncate(self.committed_length())?;
        }
        Ok(())
    }

    fn end(&self, txn: &TxnInfo) {
        self.txns.lock().remove(&txn.id);
    }

    fn shutdown(&self) -> Result<()> {
        self.file.close()
    }
}
