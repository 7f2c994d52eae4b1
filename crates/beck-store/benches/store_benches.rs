//! Criterion benchmarks for the merkle tree store hot paths.
//!
//! Covers: serial vs pooled tree construction, the wire codec, and the
//! disk store read/write paths.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use beck_core::merkle::MerkleTree;
use beck_core::types::{Block, BlockHeader, Hash256, Transaction};
use beck_store::{ComputePool, DiskStore, StoreConfig};

/// Block with `n` distinct transactions.
fn make_block(n: usize) -> Arc<Block> {
    let transactions = (0..n)
        .map(|i| Transaction {
            version: 1,
            data: (i as u64).to_le_bytes().to_vec(),
        })
        .collect();
    Arc::new(Block {
        header: BlockHeader {
            version: 1,
            prev_hash: Hash256([0xAA; 32]),
            merkle_root: Hash256([0xBB; 32]),
            timestamp: 1_700_000_000,
            nonce: n as u64,
        },
        transactions,
    })
}

fn bench_tree_compute(c: &mut Criterion) {
    let pool = ComputePool::new(4).unwrap();
    let block_small = make_block(100);
    let block_large = make_block(4000);

    c.bench_function("tree_serial_100_txs", |b| {
        b.iter(|| MerkleTree::from_leaves(&black_box(&block_small).txids()))
    });
    c.bench_function("tree_serial_4000_txs", |b| {
        b.iter(|| MerkleTree::from_leaves(&black_box(&block_large).txids()))
    });
    c.bench_function("tree_pooled_4000_txs", |b| {
        b.iter(|| pool.compute(black_box(&block_large)))
    });
}

fn bench_wire_codec(c: &mut Criterion) {
    let block = make_block(1000);
    let tree = MerkleTree::from_leaves(&block.txids());
    let bytes = tree.encode();

    c.bench_function("tree_encode_1000_leaves", |b| {
        b.iter(|| black_box(&tree).encode())
    });
    c.bench_function("tree_decode_1000_leaves", |b| {
        b.iter(|| MerkleTree::decode(black_box(&bytes)).unwrap())
    });
}

fn bench_disk_store(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::new(dir.path().join("merkle"));
    let store = DiskStore::open(&config).unwrap();

    let block = make_block(1000);
    let tree = MerkleTree::from_leaves(&block.txids());
    let encoded = tree.encode();

    let counter = AtomicU64::new(0);
    c.bench_function("store_put_1000_leaf_tree", |b| {
        b.iter(|| {
            let n = counter.fetch_add(1, Ordering::Relaxed);
            let mut hash = [0u8; 32];
            hash[..8].copy_from_slice(&n.to_le_bytes());
            store
                .put(&Hash256(hash), n, black_box(&encoded), n)
                .unwrap();
        })
    });

    let read_hash = Hash256([0xEE; 32]);
    store.put(&read_hash, 0, &encoded, 0).unwrap();
    c.bench_function("store_get_1000_leaf_tree", |b| {
        b.iter(|| store.get(black_box(&read_hash)).unwrap().unwrap())
    });
}

criterion_group!(
    benches,
    bench_tree_compute,
    bench_wire_codec,
    bench_disk_store
);
criterion_main!(benches);
