//! End-to-end tests for the two-tier merkle tree store: persistence across
//! reopen, file sealing, pruning under the retention window, crash
//! reconciliation, and concurrent access through the factory.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use beck_core::merkle::MerkleTree;
use beck_core::source::MemoryBlockSource;
use beck_core::types::{Block, BlockHeader, BlockIndex, Hash256, Transaction};
use beck_store::{DiskStore, MerkleTreeFactory, StoreConfig};

// ------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------

fn h(byte: u8) -> Hash256 {
    Hash256([byte; 32])
}

/// Deterministic tree with content unique per seed; size depends only on
/// the leaf count.
fn tree(seed: u8, leaves: usize) -> MerkleTree {
    let leaves: Vec<Hash256> = (0..leaves)
        .map(|i| Hash256(blake3::hash(&[seed, i as u8]).into()))
        .collect();
    MerkleTree::from_leaves(&leaves)
}

fn make_block(tx_count: usize, nonce: u64) -> Block {
    let transactions = (0..tx_count)
        .map(|i| Transaction {
            version: 1,
            data: [nonce.to_le_bytes(), (i as u64).to_le_bytes()].concat(),
        })
        .collect();
    Block {
        header: BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            timestamp: 1_700_000_000,
            nonce,
        },
        transactions,
    }
}

/// Sum of the sizes of every `mrk*.dat` file under `store_path`.
fn filesystem_usage(store_path: &Path) -> u64 {
    fs::read_dir(store_path)
        .unwrap()
        .filter_map(|entry| {
            let entry = entry.unwrap();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            (name.starts_with("mrk") && name.ends_with(".dat"))
                .then(|| entry.metadata().unwrap().len())
        })
        .sum()
}

fn store_config(dir: &Path) -> StoreConfig {
    StoreConfig::new(dir.join("merkle"))
}

// ------------------------------------------------------------------
// Persistence across reopen
// ------------------------------------------------------------------

#[test]
fn put_get_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = store_config(dir.path());
    let t = tree(1, 16);

    {
        let store = DiskStore::open(&config).unwrap();
        store.put(&h(1), 100, &t.encode(), 100).unwrap();
        assert_eq!(store.get(&h(1)).unwrap().unwrap(), t);
    }

    // All in-memory state discarded; everything must come back from the
    // index and the data files.
    let store = DiskStore::open(&config).unwrap();
    assert_eq!(store.get(&h(1)).unwrap().unwrap(), t);
    assert_eq!(store.disk_usage(), t.encoded_len());
    assert_eq!(store.disk_usage(), filesystem_usage(&config.store_path));
    assert_eq!(store.next_write_position(), (0, t.encoded_len()));
}

#[test]
fn many_trees_reload_intact() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = store_config(dir.path());
    let size = tree(0, 8).encoded_len();
    // Three trees per file.
    config.preferred_file_size = size * 3;

    {
        let store = DiskStore::open(&config).unwrap();
        for seed in 0..10u8 {
            let t = tree(seed, 8);
            store
                .put(&h(seed), u64::from(seed), &t.encode(), u64::from(seed))
                .unwrap();
        }
        assert_eq!(store.file_count(), 4);
    }

    let store = DiskStore::open(&config).unwrap();
    assert_eq!(store.tree_count(), 10);
    assert_eq!(store.file_count(), 4);
    for seed in 0..10u8 {
        assert_eq!(store.get(&h(seed)).unwrap().unwrap(), tree(seed, 8));
    }
    assert_eq!(store.disk_usage(), filesystem_usage(&config.store_path));
}

// ------------------------------------------------------------------
// File sealing
// ------------------------------------------------------------------

#[test]
fn trees_distribute_across_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = store_config(dir.path());
    let size = tree(1, 8).encoded_len();
    config.preferred_file_size = size * 2;

    let store = DiskStore::open(&config).unwrap();
    store.put(&h(1), 1, &tree(1, 8).encode(), 1).unwrap();
    store.put(&h(2), 2, &tree(2, 8).encode(), 2).unwrap();
    store.put(&h(3), 3, &tree(3, 8).encode(), 3).unwrap();

    // First two fill file 0 exactly, the third opens file 1.
    assert_eq!(store.file_count(), 2);
    assert_eq!(store.next_write_position(), (1, size));
    assert!(fs::metadata(config.store_path.join("mrk00000.dat")).is_ok());
    assert!(fs::metadata(config.store_path.join("mrk00001.dat")).is_ok());
}

#[test]
fn tree_filling_file_exactly_stays_then_seals() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = store_config(dir.path());
    let size = tree(1, 8).encoded_len();
    config.preferred_file_size = size;

    let store = DiskStore::open(&config).unwrap();
    // Exactly preferred size: written into the fresh file, which is sealed
    // by the next write.
    store.put(&h(1), 1, &tree(1, 8).encode(), 1).unwrap();
    assert_eq!(store.next_write_position(), (0, size));

    store.put(&h(2), 2, &tree(2, 8).encode(), 2).unwrap();
    assert_eq!(store.next_write_position(), (1, size));
    assert_eq!(store.file_count(), 2);
}

// ------------------------------------------------------------------
// Pruning and the retention window
// ------------------------------------------------------------------

#[test]
fn prune_deletes_old_file_keeps_recent() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = store_config(dir.path());
    let size = tree(1, 8).encoded_len();
    config.preferred_file_size = size * 2;
    config.max_disk_space = size * 3;

    let store = DiskStore::open(&config).unwrap();
    // Heights far below the eventual chain tip.
    store.put(&h(1), 100, &tree(1, 8).encode(), 100).unwrap();
    store.put(&h(2), 112, &tree(2, 8).encode(), 112).unwrap();
    store.put(&h(3), 113, &tree(3, 8).encode(), 113).unwrap();
    assert_eq!(store.file_count(), 2);

    // The fourth write overflows the budget; file 0 (heights <= 112) is out
    // of the window at height 400 and is deleted whole.
    store.put(&h(4), 400, &tree(4, 8).encode(), 400).unwrap();

    assert!(store.get(&h(1)).unwrap().is_none());
    assert!(store.get(&h(2)).unwrap().is_none());
    assert_eq!(store.get(&h(3)).unwrap().unwrap(), tree(3, 8));
    assert_eq!(store.get(&h(4)).unwrap().unwrap(), tree(4, 8));
    assert!(!config.store_path.join("mrk00000.dat").exists());
    assert_eq!(store.disk_usage(), filesystem_usage(&config.store_path));
}

#[test]
fn retention_window_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = store_config(dir.path());
    let size = tree(1, 8).encoded_len();
    // One tree per file, budget for two files.
    config.preferred_file_size = size;
    config.max_disk_space = size * 2;

    let store = DiskStore::open(&config).unwrap();
    let height = 1000u64;
    store.put(&h(1), height, &tree(1, 8).encode(), height).unwrap();
    store
        .put(&h(2), height + 1, &tree(2, 8).encode(), height + 1)
        .unwrap();

    // File 0 holds height 1000. At chain height 1287 it is 287 blocks old:
    // still inside the window, so the write cannot make room.
    let err = store
        .put(&h(3), height + 287, &tree(3, 8).encode(), height + 287)
        .unwrap_err();
    assert!(matches!(err, beck_store::StoreError::Capacity { .. }));
    assert!(store.get(&h(1)).unwrap().is_some());

    // One block later it leaves the window and the same write succeeds.
    store
        .put(&h(3), height + 288, &tree(3, 8).encode(), height + 288)
        .unwrap();
    assert!(store.get(&h(1)).unwrap().is_none());
    assert!(store.get(&h(3)).unwrap().is_some());
}

#[test]
fn capacity_error_leaves_store_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = store_config(dir.path());
    let size = tree(1, 8).encoded_len();
    config.preferred_file_size = size;
    config.max_disk_space = size * 2;

    let store = DiskStore::open(&config).unwrap();
    store.put(&h(1), 150, &tree(1, 8).encode(), 150).unwrap();
    store.put(&h(2), 151, &tree(2, 8).encode(), 151).unwrap();

    // Height 150 is still within the window at chain height 200.
    let err = store
        .put(&h(3), 200, &tree(3, 8).encode(), 200)
        .unwrap_err();
    assert!(matches!(err, beck_store::StoreError::Capacity { .. }));

    assert_eq!(store.tree_count(), 2);
    assert_eq!(store.file_count(), 2);
    assert!(!store.contains(&h(3)));
    assert_eq!(store.disk_usage(), filesystem_usage(&config.store_path));
}

#[test]
fn pruned_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = store_config(dir.path());
    let size = tree(1, 8).encoded_len();
    config.preferred_file_size = size;
    config.max_disk_space = size * 2;

    {
        let store = DiskStore::open(&config).unwrap();
        store.put(&h(1), 1, &tree(1, 8).encode(), 1).unwrap();
        store.put(&h(2), 2, &tree(2, 8).encode(), 2).unwrap();
        store.put(&h(3), 600, &tree(3, 8).encode(), 600).unwrap();
        assert!(store.get(&h(1)).unwrap().is_none());
    }

    let store = DiskStore::open(&config).unwrap();
    assert!(store.get(&h(1)).unwrap().is_none());
    assert!(store.get(&h(2)).unwrap().is_some());
    assert!(store.get(&h(3)).unwrap().is_some());
    assert_eq!(store.disk_usage(), filesystem_usage(&config.store_path));
}

// ------------------------------------------------------------------
// Crash reconciliation
// ------------------------------------------------------------------

#[test]
fn missing_data_file_rows_dropped_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = store_config(dir.path());
    let size = tree(1, 8).encoded_len();
    config.preferred_file_size = size;

    {
        let store = DiskStore::open(&config).unwrap();
        store.put(&h(1), 1, &tree(1, 8).encode(), 1).unwrap();
        store.put(&h(2), 2, &tree(2, 8).encode(), 2).unwrap();
        store.put(&h(3), 3, &tree(3, 8).encode(), 3).unwrap();
    }

    // Simulate a crash between a prune's unlink and its index commit.
    fs::remove_file(config.store_path.join("mrk00000.dat")).unwrap();

    let store = DiskStore::open(&config).unwrap();
    assert!(store.get(&h(1)).unwrap().is_none());
    assert_eq!(store.get(&h(2)).unwrap().unwrap(), tree(2, 8));
    assert_eq!(store.get(&h(3)).unwrap().unwrap(), tree(3, 8));
    assert_eq!(store.disk_usage(), filesystem_usage(&config.store_path));

    // The cleanup is durable: a further reopen sees the same state.
    drop(store);
    let store = DiskStore::open(&config).unwrap();
    assert!(store.get(&h(1)).unwrap().is_none());
    assert_eq!(store.tree_count(), 2);
}

#[test]
fn orphan_data_file_removed_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let config = store_config(dir.path());

    {
        let store = DiskStore::open(&config).unwrap();
        store.put(&h(1), 1, &tree(1, 8).encode(), 1).unwrap();
    }

    // A file the index has never heard of.
    let orphan = config.store_path.join("mrk00099.dat");
    fs::write(&orphan, b"leftover bytes").unwrap();

    let store = DiskStore::open(&config).unwrap();
    assert!(!orphan.exists());
    assert_eq!(store.get(&h(1)).unwrap().unwrap(), tree(1, 8));
    assert_eq!(store.disk_usage(), filesystem_usage(&config.store_path));
}

#[test]
fn uncommitted_append_bytes_truncated_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let config = store_config(dir.path());
    let t = tree(1, 8);

    {
        let store = DiskStore::open(&config).unwrap();
        store.put(&h(1), 1, &t.encode(), 1).unwrap();
    }

    // Simulate a crash after an append but before the batch commit.
    let path = config.store_path.join("mrk00000.dat");
    let mut bytes = fs::read(&path).unwrap();
    bytes.extend_from_slice(&[0xDE; 100]);
    fs::write(&path, &bytes).unwrap();

    let store = DiskStore::open(&config).unwrap();
    assert_eq!(fs::metadata(&path).unwrap().len(), t.encoded_len());
    assert_eq!(store.get(&h(1)).unwrap().unwrap(), t);
    assert_eq!(store.next_write_position(), (0, t.encoded_len()));

    // The append point is clean: the next write lands and reads back.
    store.put(&h(2), 2, &tree(2, 8).encode(), 2).unwrap();
    assert_eq!(store.get(&h(2)).unwrap().unwrap(), tree(2, 8));
}

#[test]
fn lost_committed_bytes_reset_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = store_config(dir.path());

    {
        let store = DiskStore::open(&config).unwrap();
        store.put(&h(1), 1, &tree(1, 16).encode(), 1).unwrap();
    }

    // Committed data goes missing: unrecoverable, the store starts over.
    let path = config.store_path.join("mrk00000.dat");
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    let store = DiskStore::open(&config).unwrap();
    assert_eq!(store.tree_count(), 0);
    assert_eq!(store.disk_usage(), 0);
    assert_eq!(store.next_write_position(), (0, 0));
    assert!(!path.exists());

    // The reset store accepts new writes.
    store.put(&h(2), 2, &tree(2, 8).encode(), 2).unwrap();
    assert_eq!(store.get(&h(2)).unwrap().unwrap(), tree(2, 8));
}

// ------------------------------------------------------------------
// Factory end-to-end
// ------------------------------------------------------------------

#[test]
fn factory_round_trip_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = store_config(dir.path());
    let block = make_block(20, 7);
    let index = BlockIndex {
        hash: block.hash(),
        height: 3,
    };

    let expected = MerkleTree::from_leaves(&block.txids());

    {
        let mut source = MemoryBlockSource::new();
        source.insert(block);
        let factory = MerkleTreeFactory::new(&config, Arc::new(source)).unwrap();
        let tree = factory.get_tree(&index, 3).unwrap();
        assert_eq!(*tree, expected);
    }

    // Reopen with a source that no longer has the block body: the tree must
    // come back from disk alone.
    let factory = MerkleTreeFactory::new(&config, Arc::new(MemoryBlockSource::new())).unwrap();
    let tree = factory.get_tree(&index, 3).unwrap();
    assert_eq!(*tree, expected);
}

#[test]
fn factory_concurrent_misses_agree() {
    let dir = tempfile::tempdir().unwrap();
    let config = store_config(dir.path());
    let block = make_block(300, 11);
    let index = BlockIndex {
        hash: block.hash(),
        height: 0,
    };

    let mut source = MemoryBlockSource::new();
    source.insert(block.clone());
    let factory = MerkleTreeFactory::new(&config, Arc::new(source)).unwrap();

    let trees: Vec<Arc<MerkleTree>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| factory.get_tree(&index, 0).unwrap()))
            .collect();
        handles.into_iter().map(|t| t.join().unwrap()).collect()
    });

    let expected = MerkleTree::from_leaves(&block.txids());
    for tree in &trees {
        assert_eq!(**tree, expected);
    }
    // Exactly one writer won; the store holds a single copy.
    assert_eq!(factory.store().tree_count(), 1);
    assert_eq!(
        factory.store().get(&index.hash).unwrap().unwrap(),
        expected
    );
}

#[test]
fn factory_survives_full_disk() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = store_config(dir.path());
    // Too small for any tree; every put fails with a capacity error.
    config.max_disk_space = 16;

    let block = make_block(10, 5);
    let index = BlockIndex {
        hash: block.hash(),
        height: 0,
    };
    let mut source = MemoryBlockSource::new();
    source.insert(block.clone());
    let factory = MerkleTreeFactory::new(&config, Arc::new(source)).unwrap();

    // The tree is still served, memory-only.
    let tree = factory.get_tree(&index, 0).unwrap();
    assert_eq!(*tree, MerkleTree::from_leaves(&block.txids()));
    assert_eq!(factory.store().tree_count(), 0);
    assert_eq!(factory.cache().len(), 1);
}

#[test]
fn factory_fifo_cache_eviction() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = store_config(dir.path());

    let blocks: Vec<Block> = (0..3).map(|i| make_block(8, i)).collect();
    let tree_size = MerkleTree::from_leaves(&blocks[0].txids()).encoded_len();
    // Room for two trees, not three.
    config.max_cache_bytes = tree_size * 2 + tree_size / 2;

    let mut source = MemoryBlockSource::new();
    let indexes: Vec<BlockIndex> = blocks
        .iter()
        .enumerate()
        .map(|(height, block)| {
            source.insert(block.clone());
            BlockIndex {
                hash: block.hash(),
                height: height as u64,
            }
        })
        .collect();
    let factory = MerkleTreeFactory::new(&config, Arc::new(source)).unwrap();

    factory.get_tree(&indexes[0], 2).unwrap();
    factory.get_tree(&indexes[1], 2).unwrap();
    // Repeated reads do not refresh FIFO order.
    for _ in 0..5 {
        assert!(factory.cache().get(&indexes[0].hash).is_some());
    }
    factory.get_tree(&indexes[2], 2).unwrap();

    assert!(factory.cache().get(&indexes[0].hash).is_none());
    assert!(factory.cache().get(&indexes[1].hash).is_some());
    assert!(factory.cache().get(&indexes[2].hash).is_some());

    // The evicted tree is still on disk and a fresh request re-caches it.
    let tree = factory.get_tree(&indexes[0], 2).unwrap();
    assert_eq!(*tree, MerkleTree::from_leaves(&blocks[0].txids()));
}
