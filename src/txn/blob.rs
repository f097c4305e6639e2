//! A single transactional byte blob

use super::component::{ComponentId, TransactionalComponent, TxnId, TxnInfo};
use super::coordinator::Transaction;
use crate::error::{Result, VaultError};
use crate::location::{ext, write_atomic, Location};
use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::Arc;

struct BlobTxn {
    /// Committed value when the transaction began
    snapshot: Arc<[u8]>,
    staged: Option<Arc<[u8]>>,
}

/// A byte blob persisted whole in `<name>.blob`.
///
/// Readers see the value committed when they began; a writer also sees its
/// own staged value. The REDO payload is the new value.
pub struct TransBlob {
    id: ComponentId,
    label: String,
    path: Option<PathBuf>,
    committed: RwLock<Arc<[u8]>>,
    txns: Mutex<AHashMap<TxnId, BlobTxn>>,
}

impl TransBlob {
    pub fn new(location: &Location, name: &str) -> Result<Self> {
        let label = format!("{}.{}", name, ext::BLOB);
        let path = location.path(name, ext::BLOB);
        let value: Arc<[u8]> = match &path {
            Some(path) if path.exists() => std::fs::read(path)?.into(),
            _ => Arc::from(Vec::new()),
        };
        Ok(TransBlob {
            id: ComponentId::from_name(&label),
            label,
            path,
            committed: RwLock::new(value),
            txns: Mutex::new(AHashMap::new()),
        })
    }

    pub fn mem(name: &str) -> Self {
        let label = format!("{}.{}", name, ext::BLOB);
        TransBlob {
            id: ComponentId::from_name(&label),
            label,
            path: None,
            committed: RwLock::new(Arc::from(Vec::new())),
            txns: Mutex::new(AHashMap::new()),
        }
    }

    /// Value as seen by `txn`.
    pub fn get(&self, txn: &Transaction) -> Result<Arc<[u8]>> {
        let info = txn.check_active()?;
        let txns = self.txns.lock();
        let state = txns.get(&info.id).ok_or(VaultError::NotInTransaction)?;
        Ok(state
            .staged
            .as_ref()
            .unwrap_or(&state.snapshot)
            .clone())
    }

    pub fn set(&self, txn: &Transaction, value: &[u8]) -> Result<()> {
        let info = txn.check_write()?;
        let mut txns = self.txns.lock();
        let state = txns.get_mut(&info.id).ok_or(VaultError::NotInTransaction)?;
        state.staged = Some(Arc::from(value));
        Ok(())
    }

    /// Last committed value, outside any transaction.
    pub fn committed(&self) -> Arc<[u8]> {
        self.committed.read().clone()
    }

    fn install(&self, value: Arc<[u8]>) -> Result<()> {
        if let Some(path) = &self.path {
            write_atomic(path, &value)?;
        }
        *self.committed.write() = value;
        Ok(())
    }

    fn staged(&self, txn: &TxnInfo) -> Option<Arc<[u8]>> {
        self.txns
            .lock()
            .get(&txn.id)
            .and_then(|state| state.staged.clone())
    }
}

impl TransactionalComponent for TransBlob {
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
        tracing::debug!(blob = %self.label, len = payload.len(), "Recovering blob");
        self.install(Arc::from(payload))
    }

    fn finish_recovery(&self) -> Result<()> {
        Ok(())
    }

    fn clean_start(&self) -> Result<()> {
        Ok(())
    }

    fn begin(&self, txn: &TxnInfo) -> Result<()> {
        let snapshot = self.committed();
        self.txns.lock().insert(
            txn.id,
            BlobTxn {
                snapshot,
                staged: None,
            },
        );
        Ok(())
    }

    fn commit_prepare(&self, txn: &TxnInfo) -> Result<Option<Vec<u8>>> {
        Ok(self.staged(txn).map(|value| value.to_vec()))
    }

    fn commit(&self, txn: &TxnInfo) -> Result<()> {
        match self.staged(txn) {
            Some(value) => self.install(value),
            None => Ok(()),
        }
    }

    fn commit_end(&self, _txn: &TxnInfo) -> Result<()> {
        Ok(())
    }

    fn abort(&self, txn: &TxnInfo) -> Result<()> {
        if let Some(state) = self.txns.lock().get_mut(&txn.id) {
            state.staged = None;
        }
        Ok(())
    }

    fn end(&self, txn: &TxnInfo) {
        self.txns.lock().remove(&txn.id);
    }

    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use crate::txn::{TransactionCoordinator, TxnType};

    fn setup() -> (TransactionCoordinator, Arc<TransBlob>) {
        let coord = TransactionCoordinator::with_journal(Journal::mem());
        let blob = Arc::new(TransBlob::mem("b"));
        coord.add(blob.clone()).unwrap();
        coord.start().unwrap();
        (coord, blob)
    }

    #[test]
    fn test_writer_sees_own_value() {
        let (coord, blob) = setup();
        let txn = coord.begin(TxnType::Write).unwrap();
        assert!(blob.get(&txn).unwrap().is_empty());
        blob.set(&txn, b"staged").unwrap();
        assert_eq!(&*blob.get(&txn).unwrap(), b"staged");
        assert!(blob.committed().is_empty());
        txn.commit().unwrap();
        assert_eq!(&*blob.committed(), b"staged");
    }

    #[test]
    fn test_reader_isolated_from_later_commit() {
        let (coord, blob) = setup();
        coord.exec_write(|txn| blob.set(txn, b"old")).unwrap();

        let reader = coord.begin(TxnType::Read).unwrap();
        coord.exec_write(|txn| blob.set(txn, b"new")).unwrap();
        assert_eq!(&*blob.get(&reader).unwrap(), b"old");
        reader.commit().unwrap();

        let reader = coord.begin(TxnType::Read).unwrap();
        assert_eq!(&*blob.get(&reader).unwrap(), b"new");
    }

    #[test]
    fn test_read_txn_cannot_set() {
        let (coord, blob) = setup();
        let reader = coord.begin(TxnType::Read).unwrap();
        assert!(matches!(
            blob.set(&reader, b"x"),
            Err(VaultError::ReadOnlyTransaction)
        ));
    }

    #[test]
    fn test_abort_discards() {
        let (coord, blob) = setup();
        let txn = coord.begin(TxnType::Write).unwrap();
        blob.set(&txn, b"gone").unwrap();
        txn.abort().unwrap();
        assert!(blob.committed().is_empty());
    }
}
