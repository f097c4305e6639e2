//! Benchmarks for B+Tree insert, lookup and range scans

use blockvault::txn::{TransBPlusTree, TxnType};
use blockvault::{BPlusTree, Journal, Record, RecordFactory, TransactionCoordinator};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};
use std::sync::Arc;

fn factory() -> RecordFactory {
    RecordFactory::new(24, 0)
}

/// Triple-shaped keys: three big-endian u64s.
fn triple(n: u64) -> Record {
    let mut key = [0u8; 24];
    key[..8].copy_from_slice(&(n / 1000).to_be_bytes());
    key[8..16].copy_from_slice(&(n % 1000).to_be_bytes());
    key[16..].copy_from_slice(&n.to_be_bytes());
    factory().create(&key).unwrap()
}

fn shuffled(count: u64) -> Vec<Record> {
    let mut records: Vec<Record> = (0..count).map(triple).collect();
    records.shuffle(&mut StdRng::seed_from_u64(42));
    records
}

fn benchmark_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("bptree_insert");

    for size in [1_000u64, 10_000, 50_000].iter() {
        let records = shuffled(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let tree = BPlusTree::mem("bench", 4096, factory()).unwrap();
                for record in &records {
                    tree.insert(black_box(record)).unwrap();
                }
            });
        });
    }

    group.finish();
}

fn benchmark_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("bptree_find");

    for size in [1_000u64, 10_000, 100_000].iter() {
        let tree = BPlusTree::mem("bench", 4096, factory()).unwrap();
        for record in shuffled(*size) {
            tree.insert(&record).unwrap();
        }
        let lookups = shuffled(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % lookups.len();
                black_box(tree.find(&lookups[i]).unwrap());
            });
        });
    }

    group.finish();
}

fn benchmark_range_scan(c: &mut Criterion) {
    let tree = BPlusTree::mem("bench", 4096, factory()).unwrap();
    for record in shuffled(100_000) {
        tree.insert(&record).unwrap();
    }

    c.bench_function("bptree_scan_full_100k", |b| {
        b.iter(|| black_box(tree.iter().count()));
    });

    let lo = triple(40_000);
    let hi = triple(41_000);
    c.bench_function("bptree_scan_range_1k", |b| {
        b.iter(|| black_box(tree.iter_range(Some(&lo), Some(&hi)).count()));
    });
}

fn benchmark_txn_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("bptree_txn_commit");

    for batch in [1u64, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(batch), batch, |b, &batch| {
            let tree = Arc::new(TransBPlusTree::mem("bench", 4096, factory()).unwrap());
            let coordinator = TransactionCoordinator::with_journal(Journal::mem());
            coordinator.add(tree.clone()).unwrap();
            coordinator.start().unwrap();
            let mut next = 0u64;
            b.iter(|| {
                let txn = coordinator.begin(TxnType::Write).unwrap();
                for _ in 0..batch {
                    tree.insert(&txn, &triple(next)).unwrap();
                    next += 1;
                }
                txn.commit().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_insert,
    benchmark_find,
    benchmark_range_scan,
    benchmark_txn_commit
);
criterion_main!(benches);
