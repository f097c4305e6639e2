//! Readers and writers on separate threads

use blockvault::txn::{TransBPlusTree, TxnType};
use blockvault::{Journal, Record, RecordFactory, TransactionCoordinator, VaultError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn factory() -> RecordFactory {
    RecordFactory::new(8, 8)
}

fn rec(k: u64, v: u64) -> Record {
    factory()
        .create_kv(&k.to_be_bytes(), &v.to_be_bytes())
        .unwrap()
}

fn setup() -> (Arc<TransactionCoordinator>, Arc<TransBPlusTree>) {
    let tree = Arc::new(TransBPlusTree::mem("T", 128, factory()).unwrap());
    let coordinator = Arc::new(TransactionCoordinator::with_journal(Journal::mem()));
    coordinator.add(tree.clone()).unwrap();
    coordinator.start().unwrap();
    (coordinator, tree)
}

#[test]
fn test_reader_snapshot_under_concurrent_writer() {
    let (coordinator, tree) = setup();
    coordinator
        .exec_write(|txn| {
            for k in 0..200 {
                tree.insert(txn, &rec(k, 0))?;
            }
            Ok(())
        })
        .unwrap();

    let reader = coordinator.begin(TxnType::Read).unwrap();
    let version = reader.data_version();

    let writer = {
        let coordinator = coordinator.clone();
        let tree = tree.clone();
        thread::spawn(move || {
            for round in 1..=10u64 {
                coordinator
                    .exec_write(|txn| {
                        for k in 0..200 {
                            tree.insert(txn, &rec(k, round))?;
                        }
                        for k in 200 + round * 10..200 + round * 10 + 10 {
                            tree.insert(txn, &rec(k, round))?;
                        }
                        Ok(())
                    })
                    .unwrap();
            }
        })
    };

    // The reader keeps seeing the first commit the whole time
    for _ in 0..20 {
        let seen: Vec<(u64, u64)> = tree
            .iter(&reader)
            .unwrap()
            .map(|r| {
                let r = r.unwrap();
                (
                    u64::from_be_bytes(r.key().try_into().unwrap()),
                    u64::from_be_bytes(r.value().try_into().unwrap()),
                )
            })
            .collect();
        assert_eq!(seen.len(), 200);
        assert!(seen.iter().all(|&(_, v)| v == 0));
        thread::yield_now();
    }
    writer.join().unwrap();

    assert_eq!(tree.size(&reader).unwrap(), 200);
    assert_eq!(reader.data_version(), version);
    reader.commit().unwrap();

    let fresh = coordinator.begin(TxnType::Read).unwrap();
    assert_eq!(tree.size(&fresh).unwrap(), 300);
    let lookup = factory().create_key(&5u64.to_be_bytes()).unwrap();
    let found = tree.find(&fresh, &lookup).unwrap().unwrap();
    assert_eq!(u64::from_be_bytes(found.value().try_into().unwrap()), 10);
    assert_eq!(fresh.data_version(), version + 10);
    tree.check(&fresh).unwrap();
    fresh.commit().unwrap();
}

#[test]
fn test_single_writer_across_threads() {
    let (coordinator, tree) = setup();
    let inside = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let coordinator = coordinator.clone();
            let tree = tree.clone();
            let inside = inside.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for i in 0..25u64 {
                    coordinator
                        .exec_write(|txn| {
                            assert!(!inside.swap(true, Ordering::SeqCst));
                            tree.insert(txn, &rec(t * 1000 + i, t))?;
                            inside.store(false, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(coordinator.count_begin_write(), 100);
    assert_eq!(coordinator.count_active_writers(), 0);
    assert_eq!(coordinator.data_version(), 100);
    assert_eq!(coordinator.exec_read(|txn| tree.size(txn)).unwrap(), 100);
}

#[test]
fn test_try_begin_while_writer_active() {
    let (coordinator, _tree) = setup();
    let writer = coordinator.begin(TxnType::Write).unwrap();

    let other = {
        let coordinator = coordinator.clone();
        thread::spawn(move || {
            matches!(
                coordinator.try_begin(TxnType::Write),
                Err(VaultError::WriterSlotBusy)
            )
        })
    };
    assert!(other.join().unwrap());

    // Readers are never blocked by the writer
    let reader = coordinator.try_begin(TxnType::Read).unwrap();
    reader.commit().unwrap();

    let waiting = {
        let coordinator = coordinator.clone();
        thread::spawn(move || coordinator.begin(TxnType::Write).map(|txn| txn.abort()))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!waiting.is_finished());
    writer.abort().unwrap();
    waiting.join().unwrap().unwrap().unwrap();
}

#[test]
fn test_many_readers_iterate_while_writing() {
    let (coordinator, tree) = setup();
    coordinator
        .exec_write(|txn| {
            for k in 0..500 {
                tree.insert(txn, &rec(k, k))?;
            }
            Ok(())
        })
        .unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let coordinator = coordinator.clone();
            let tree = tree.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut scans = 0u64;
                while !stop.load(Ordering::Relaxed) || scans == 0 {
                    coordinator
                        .exec_read(|txn| {
                            let mut previous = None;
                            let mut count = 0u64;
                            for record in tree.iter(txn)? {
                                let key = u64::from_be_bytes(record?.key().try_into().unwrap());
                                assert!(previous.map_or(true, |p| p < key));
                                previous = Some(key);
                                count += 1;
                            }
                            // Every commit keeps the count a multiple of 500
                            assert_eq!(count % 500, 0);
                            Ok(())
                        })
                        .unwrap();
                    scans += 1;
                }
                scans
            })
        })
        .collect();

    for round in 1..=5u64 {
        coordinator
            .exec_write(|txn| {
                for k in 0..500 {
                    tree.insert(txn, &rec(round * 10_000 + k, k))?;
                }
                Ok(())
            })
            .unwrap();
    }
    stop.store(true, Ordering::Relaxed);

    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    assert_eq!(coordinator.exec_read(|txn| tree.size(txn)).unwrap(), 3000);
    assert_eq!(coordinator.count_active_readers(), 0);
}

#[test]
fn test_blocked_writers_wait_for_enable() {
    let (coordinator, tree) = setup();
    coordinator.block_writers().unwrap();
    assert!(matches!(
        coordinator.try_begin(TxnType::Write),
        Err(VaultError::WriterSlotBusy)
    ));

    let writer = {
        let coordinator = coordinator.clone();
        let tree = tree.clone();
        thread::spawn(move || coordinator.exec_write(|txn| tree.insert(txn, &rec(1, 1))))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!writer.is_finished());
    // Readers are not held off
    assert_eq!(coordinator.exec_read(|txn| tree.size(txn)).unwrap(), 0);

    coordinator.enable_writers();
    assert!(writer.join().unwrap().unwrap());
    assert_eq!(coordinator.exec_read(|txn| tree.size(txn)).unwrap(), 1);
}

#[test]
fn test_exclusive_mode_sees_quiet_store() {
    let (coordinator, tree) = setup();
    coordinator
        .exec_write(|txn| {
            for k in 0..100 {
                tree.insert(txn, &rec(k, k))?;
            }
            Ok(())
        })
        .unwrap();

    let reader = coordinator.begin(TxnType::Read).unwrap();
    let exclusive = {
        let coordinator = coordinator.clone();
        let tree = tree.clone();
        thread::spawn(move || {
            coordinator.exec_exclusive(|| {
                assert_eq!(coordinator.count_active_readers(), 0);
                assert_eq!(coordinator.count_active_writers(), 0);
                tree.tree().check()?;
                tree.tree().size()
            })
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!exclusive.is_finished());
    assert_eq!(tree.size(&reader).unwrap(), 100);
    reader.commit().unwrap();

    assert_eq!(exclusive.join().unwrap().unwrap(), 100);
    assert!(!coordinator.is_exclusive_mode());
    coordinator
        .exec_write(|txn| tree.insert(txn, &rec(100, 100)).map(|_| ()))
        .unwrap();
}
