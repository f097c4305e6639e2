//! Restart and journal replay
//!
//! Each test builds a store in a temp directory, leaves it in some
//! half-finished state, and reopens it with fresh components.

use blockvault::journal::JournalEntryType;
use blockvault::location::{ext, JOURNAL_NAME};
use blockvault::txn::{
    ComponentId, TransBPlusTree, TransBlob, TransObjectFile, TransactionalComponent, TxnInfo,
    TxnType,
};
use blockvault::{
    Journal, Location, Record, RecordFactory, StoreConfig, TransactionCoordinator, VaultError,
};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;

fn config() -> StoreConfig {
    StoreConfig::default().with_block_size(256)
}

fn factory() -> RecordFactory {
    RecordFactory::new(8, 8)
}

fn rec(k: u64) -> Record {
    factory()
        .create_kv(&k.to_be_bytes(), &(k * 10).to_be_bytes())
        .unwrap()
}

fn keys(tree: &TransBPlusTree, coordinator: &TransactionCoordinator) -> Vec<u64> {
    coordinator
        .exec_read(|txn| {
            tree.iter(txn)?
                .map(|r| r.map(|r| u64::from_be_bytes(r.key().try_into().unwrap())))
                .collect()
        })
        .unwrap()
}

/// Delegates to a tree but refuses to publish, leaving a durable journal.
struct PublishFails(Arc<TransBPlusTree>);

impl TransactionalComponent for PublishFails {
    fn component_id(&self) -> ComponentId {
        self.0.component_id()
    }
    fn label(&self) -> &str {
        self.0.label()
    }
    fn start_recovery(&self) -> blockvault::Result<()> {
        self.0.start_recovery()
    }
    fn recover(&self, payload: &[u8]) -> blockvault::Result<()> {
        self.0.recover(payload)
    }
    fn finish_recovery(&self) -> blockvault::Result<()> {
        self.0.finish_recovery()
    }
    fn clean_start(&self) -> blockvault::Result<()> {
        self.0.clean_start()
    }
    fn begin(&self, txn: &TxnInfo) -> blockvault::Result<()> {
        self.0.begin(txn)
    }
    fn commit_prepare(&self, txn: &TxnInfo) -> blockvault::Result<Option<Vec<u8>>> {
        self.0.commit_prepare(txn)
    }
    fn commit(&self, _txn: &TxnInfo) -> blockvault::Result<()> {
        Err(VaultError::CommitFailed("disk unplugged".into()))
    }
    fn commit_end(&self, txn: &TxnInfo) -> blockvault::Result<()> {
        self.0.commit_end(txn)
    }
    fn abort(&self, txn: &TxnInfo) -> blockvault::Result<()> {
        self.0.abort(txn)
    }
    fn end(&self, txn: &TxnInfo) {
        self.0.end(txn)
    }
    fn shutdown(&self) -> blockvault::Result<()> {
        Ok(())
    }
}

#[test]
fn test_hello_journal_replayed_into_blob() {
    let temp = TempDir::new().unwrap();
    let location = Location::dir(temp.path()).unwrap();

    {
        let journal = Journal::open_in(&location).unwrap();
        let id = ComponentId::from_name("greeting.blob");
        journal
            .write(JournalEntryType::Redo, id, b"Hello Journal")
            .unwrap();
        journal.write_journal(JournalEntryType::Commit).unwrap();
        journal.close().unwrap();
    }

    let coordinator = TransactionCoordinator::new(&location).unwrap();
    let blob = Arc::new(TransBlob::new(&location, "greeting").unwrap());
    coordinator.add(blob.clone()).unwrap();
    coordinator.start().unwrap();

    assert_eq!(&*blob.committed(), b"Hello Journal");
    let on_disk = std::fs::read(location.path("greeting", ext::BLOB).unwrap()).unwrap();
    assert_eq!(on_disk, b"Hello Journal");
    assert!(coordinator.journal().is_empty());

    let txn = coordinator.begin(TxnType::Read).unwrap();
    assert_eq!(&*blob.get(&txn).unwrap(), b"Hello Journal");
    txn.commit().unwrap();
}

#[test]
fn test_incomplete_transaction_discarded() {
    let temp = TempDir::new().unwrap();
    let location = Location::dir(temp.path()).unwrap();
    let id = ComponentId::from_name("state.blob");

    {
        let journal = Journal::open_in(&location).unwrap();
        journal.write(JournalEntryType::Redo, id, b"first").unwrap();
        journal.write_journal(JournalEntryType::Commit).unwrap();
        journal.write(JournalEntryType::Redo, id, b"never committed").unwrap();
        journal.sync().unwrap();
    }

    let coordinator = TransactionCoordinator::new(&location).unwrap();
    let blob = Arc::new(TransBlob::new(&location, "state").unwrap());
    coordinator.add(blob.clone()).unwrap();
    coordinator.start().unwrap();

    assert_eq!(&*blob.committed(), b"first");
}

#[test]
fn test_aborted_group_skipped() {
    let temp = TempDir::new().unwrap();
    let location = Location::dir(temp.path()).unwrap();
    let id = ComponentId::from_name("state.blob");

    {
        let journal = Journal::open_in(&location).unwrap();
        journal.write(JournalEntryType::Redo, id, b"rolled back").unwrap();
        journal.write_journal(JournalEntryType::Abort).unwrap();
        journal.write(JournalEntryType::Redo, id, b"kept").unwrap();
        journal.write_journal(JournalEntryType::Commit).unwrap();
    }

    let coordinator = TransactionCoordinator::new(&location).unwrap();
    let blob = Arc::new(TransBlob::new(&location, "state").unwrap());
    coordinator.add(blob.clone()).unwrap();
    coordinator.start().unwrap();

    assert_eq!(&*blob.committed(), b"kept");
}

#[test]
fn test_torn_tail_ignored() {
    let temp = TempDir::new().unwrap();
    let location = Location::dir(temp.path()).unwrap();
    let id = ComponentId::from_name("state.blob");

    {
        let journal = Journal::open_in(&location).unwrap();
        journal.write(JournalEntryType::Redo, id, b"whole").unwrap();
        journal.write_journal(JournalEntryType::Commit).unwrap();
        journal.close().unwrap();
    }
    {
        // Half an entry header, as if the process died mid-write
        let path = location.path(JOURNAL_NAME, ext::JOURNAL).unwrap();
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(&[0, 0, 0, 40, 0xde, 0xad]).unwrap();
    }

    let coordinator = TransactionCoordinator::new(&location).unwrap();
    let blob = Arc::new(TransBlob::new(&location, "state").unwrap());
    coordinator.add(blob.clone()).unwrap();
    coordinator.start().unwrap();

    assert_eq!(&*blob.committed(), b"whole");
    assert!(coordinator.journal().is_empty());
}

#[test]
fn test_journal_with_only_torn_tail_is_clean_start() {
    let temp = TempDir::new().unwrap();
    let location = Location::dir(temp.path()).unwrap();
    std::fs::write(
        location.path(JOURNAL_NAME, ext::JOURNAL).unwrap(),
        [0u8, 0, 0, 3],
    )
    .unwrap();

    let coordinator = TransactionCoordinator::new(&location).unwrap();
    let blob = Arc::new(TransBlob::new(&location, "state").unwrap());
    coordinator.add(blob.clone()).unwrap();
    coordinator.start().unwrap();

    assert!(blob.committed().is_empty());
    assert!(coordinator.journal().is_empty());
}

#[test]
fn test_tree_redo_replayed_after_failed_publish() {
    let temp = TempDir::new().unwrap();
    let location = Location::dir(temp.path()).unwrap();

    {
        let tree = Arc::new(TransBPlusTree::create(&location, "SPO", &config(), factory()).unwrap());
        let coordinator = TransactionCoordinator::new(&location).unwrap();
        coordinator.add(Arc::new(PublishFails(tree.clone()))).unwrap();
        coordinator.start().unwrap();

        let txn = coordinator.begin(TxnType::Write).unwrap();
        for k in 0..100 {
            tree.insert(&txn, &rec(k)).unwrap();
        }
        assert!(matches!(txn.commit(), Err(VaultError::CommitFailed(_))));

        // Nothing published, but the journal holds the commit
        assert_eq!(tree.tree().size().unwrap(), 0);
        assert!(!coordinator.journal().is_empty());
        // Process dies here
    }

    let tree = Arc::new(TransBPlusTree::create(&location, "SPO", &config(), factory()).unwrap());
    let coordinator = TransactionCoordinator::new(&location).unwrap();
    coordinator.add(tree.clone()).unwrap();
    coordinator.start().unwrap();

    assert_eq!(keys(&tree, &coordinator), (0..100).collect::<Vec<_>>());
    coordinator.exec_read(|txn| tree.check(txn)).unwrap();
    assert!(coordinator.journal().is_empty());

    // And the replayed state is itself durable
    coordinator.shutdown().unwrap();
    let tree = TransBPlusTree::create(&location, "SPO", &config(), factory()).unwrap();
    assert_eq!(tree.tree().size().unwrap(), 100);
}

#[test]
fn test_failed_publish_not_overwritten_by_later_writer() {
    let temp = TempDir::new().unwrap();
    let location = Location::dir(temp.path()).unwrap();

    {
        let tree = Arc::new(TransBPlusTree::create(&location, "SPO", &config(), factory()).unwrap());
        let coordinator = TransactionCoordinator::new(&location).unwrap();
        coordinator.add(Arc::new(PublishFails(tree.clone()))).unwrap();
        coordinator.start().unwrap();

        coordinator
            .exec_write(|txn| {
                for k in 0..100 {
                    tree.insert(txn, &rec(k))?;
                }
                Ok(())
            })
            .unwrap_err();

        // A later writer would start from the unpublished root
        assert!(matches!(
            coordinator.begin(TxnType::Write),
            Err(VaultError::RecoveryPending)
        ));
        let later = coordinator.exec_write(|txn| tree.insert(txn, &rec(500)).map(|_| ()));
        assert!(matches!(later, Err(VaultError::RecoveryPending)));
        assert_eq!(coordinator.count_active_writers(), 0);
        coordinator.exec_read(|txn| tree.size(txn)).unwrap();
    }

    let tree = Arc::new(TransBPlusTree::create(&location, "SPO", &config(), factory()).unwrap());
    let coordinator = TransactionCoordinator::new(&location).unwrap();
    coordinator.add(tree.clone()).unwrap();
    coordinator.start().unwrap();
    assert_eq!(keys(&tree, &coordinator), (0..100).collect::<Vec<_>>());

    // Writers are welcome again once recovery has run
    coordinator
        .exec_write(|txn| tree.insert(txn, &rec(500)).map(|_| ()))
        .unwrap();
    coordinator.shutdown().unwrap();

    let tree = Arc::new(TransBPlusTree::create(&location, "SPO", &config(), factory()).unwrap());
    let coordinator = TransactionCoordinator::new(&location).unwrap();
    coordinator.add(tree.clone()).unwrap();
    coordinator.start().unwrap();
    let mut expected: Vec<u64> = (0..100).collect();
    expected.push(500);
    assert_eq!(keys(&tree, &coordinator), expected);
}

#[test]
fn test_uncommitted_tree_writer_discarded() {
    let temp = TempDir::new().unwrap();
    let location = Location::dir(temp.path()).unwrap();

    {
        let tree = Arc::new(TransBPlusTree::create(&location, "SPO", &config(), factory()).unwrap());
        let coordinator = TransactionCoordinator::new(&location).unwrap();
        coordinator.add(tree.clone()).unwrap();
        coordinator.start().unwrap();

        coordinator
            .exec_write(|txn| {
                for k in 0..20 {
                    tree.insert(txn, &rec(k))?;
                }
                Ok(())
            })
            .unwrap();

        let txn = coordinator.begin(TxnType::Write).unwrap();
        for k in 20..400 {
            tree.insert(&txn, &rec(k)).unwrap();
        }
        // Crash with the writer open
        std::mem::forget(txn);
    }

    let tree = Arc::new(TransBPlusTree::create(&location, "SPO", &config(), factory()).unwrap());
    let coordinator = TransactionCoordinator::new(&location).unwrap();
    coordinator.add(tree.clone()).unwrap();
    coordinator.start().unwrap();

    assert_eq!(keys(&tree, &coordinator), (0..20).collect::<Vec<_>>());

    // Blocks the dead writer used are handed out again
    coordinator
        .exec_write(|txn| tree.insert(txn, &rec(500)).map(|_| ()))
        .unwrap();
    coordinator.exec_read(|txn| tree.check(txn)).unwrap();
    assert_eq!(coordinator.exec_read(|txn| tree.size(txn)).unwrap(), 21);
}

#[test]
fn test_components_commit_together() {
    let temp = TempDir::new().unwrap();
    let location = Location::dir(temp.path()).unwrap();

    let offset = {
        let tree = Arc::new(TransBPlusTree::create(&location, "idx", &config(), factory()).unwrap());
        let objects = Arc::new(TransObjectFile::create(&location, "nodes").unwrap());
        let blob = Arc::new(TransBlob::new(&location, "meta").unwrap());
        let coordinator = TransactionCoordinator::new(&location).unwrap();
        coordinator.add(tree.clone()).unwrap();
        coordinator.add(objects.clone()).unwrap();
        coordinator.add(blob.clone()).unwrap();
        coordinator.start().unwrap();

        let offset = coordinator
            .exec_write(|txn| {
                let offset = objects.write(txn, b"<http://example/s>")?;
                tree.insert(txn, &rec(offset))?;
                blob.set(txn, b"v1")?;
                Ok(offset)
            })
            .unwrap();

        // A second transaction touching all three, never finished
        let txn = coordinator.begin(TxnType::Write).unwrap();
        let lost = objects.write(&txn, b"lost").unwrap();
        tree.insert(&txn, &rec(lost)).unwrap();
        blob.set(&txn, b"v2").unwrap();
        std::mem::forget(txn);
        offset
    };

    let tree = Arc::new(TransBPlusTree::create(&location, "idx", &config(), factory()).unwrap());
    let objects = Arc::new(TransObjectFile::create(&location, "nodes").unwrap());
    let blob = Arc::new(TransBlob::new(&location, "meta").unwrap());
    let coordinator = TransactionCoordinator::new(&location).unwrap();
    coordinator.add(tree.clone()).unwrap();
    coordinator.add(objects.clone()).unwrap();
    coordinator.add(blob.clone()).unwrap();
    coordinator.start().unwrap();

    coordinator
        .exec_read(|txn| {
            assert_eq!(objects.read(txn, offset)?, b"<http://example/s>");
            assert_eq!(objects.iter(txn)?.count(), 1);
            assert_eq!(tree.size(txn)?, 1);
            assert_eq!(&*blob.get(txn)?, b"v1");
            Ok(())
        })
        .unwrap();
}
