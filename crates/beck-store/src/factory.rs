//! Public façade of the merkle tree store.
//!
//! [`MerkleTreeFactory`] routes each request through the memory cache, then
//! the disk store, then block load + computation. It is an explicitly-owned
//! value: construct it once the store directory and configuration are known,
//! share it by reference, and drop it at shutdown after in-flight calls have
//! returned.
//!
//! Concurrent misses for the same block are not coalesced: both callers
//! compute, one `put` wins, the other observes the duplicate and both return
//! equal trees.

use std::sync::Arc;

use tracing::{debug, warn};

use beck_core::merkle::MerkleTree;
use beck_core::source::BlockSource;
use beck_core::types::BlockIndex;

use crate::cache::TreeCache;
use crate::compute::ComputePool;
use crate::config::StoreConfig;
use crate::disk_store::DiskStore;
use crate::error::StoreError;

/// Creates, stores, and serves per-block merkle trees.
pub struct MerkleTreeFactory {
    cache: TreeCache,
    store: DiskStore,
    pool: Arc<ComputePool>,
    source: Arc<dyn BlockSource>,
}

impl MerkleTreeFactory {
    /// Open the store under `config` and spawn the compute pool.
    pub fn new(config: &StoreConfig, source: Arc<dyn BlockSource>) -> Result<Self, StoreError> {
        let store = DiskStore::open(config)?;
        let cache = TreeCache::new(config.max_cache_bytes);
        let pool = Arc::new(ComputePool::new(config.max_compute_threads)?);
        Ok(Self {
            cache,
            store,
            pool,
            source,
        })
    }

    /// Return the merkle tree for `block`, computing and persisting it if
    /// it is not already cached or stored.
    ///
    /// `chain_height` is the current tip height; it bounds pruning when the
    /// write needs disk space.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotAvailable`] when the block body cannot be loaded;
    /// this is the only failure this method surfaces. A full disk or a
    /// concurrent duplicate write is logged and the freshly computed tree
    /// is still returned.
    pub fn get_tree(
        &self,
        block: &BlockIndex,
        chain_height: u64,
    ) -> Result<Arc<MerkleTree>, StoreError> {
        if let Some(tree) = self.cache.get(&block.hash) {
            return Ok(tree);
        }

        match self.store.get(&block.hash) {
            Ok(Some(tree)) => {
                let tree = Arc::new(tree);
                self.cache.insert(block.hash, Arc::clone(&tree));
                return Ok(tree);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(hash = %block.hash, "failed to read merkle tree from disk, recomputing: {e}");
            }
        }

        let Some(body) = self.source.load_block(block) else {
            return Err(StoreError::NotAvailable(block.hash));
        };
        let body = Arc::new(body);
        let tree = Arc::new(self.pool.compute(&body));

        match self
            .store
            .put(&block.hash, block.height, &tree.encode(), chain_height)
        {
            Ok(()) => {}
            Err(StoreError::AlreadyPresent(_)) => {
                debug!(hash = %block.hash, "merkle tree stored by a concurrent caller");
            }
            Err(StoreError::Capacity { needed, limit }) => {
                warn!(
                    hash = %block.hash,
                    needed,
                    limit,
                    "disk budget exhausted; serving merkle tree from memory only"
                );
            }
            Err(e) => {
                warn!(hash = %block.hash, "failed to persist merkle tree: {e}");
            }
        }

        self.cache.insert(block.hash, Arc::clone(&tree));
        Ok(tree)
    }

    /// The memory cache tier.
    pub fn cache(&self) -> &TreeCache {
        &self.cache
    }

    /// The disk tier.
    pub fn store(&self) -> &DiskStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beck_core::source::MemoryBlockSource;
    use beck_core::types::{Block, BlockHeader, Hash256, Transaction};

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

    fn factory_with_blocks(
        blocks: &[Block],
    ) -> (MerkleTreeFactory, Vec<BlockIndex>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new(dir.path().join("merkle"));

        let mut source = MemoryBlockSource::new();
        let mut indexes = Vec::new();
        for (height, block) in blocks.iter().enumerate() {
            indexes.push(BlockIndex {
                hash: block.hash(),
                height: height as u64,
            });
            source.insert(block.clone());
        }
        let factory = MerkleTreeFactory::new(&config, Arc::new(source)).unwrap();
        (factory, indexes, dir)
    }

    #[test]
    fn miss_computes_and_persists() {
        let block = make_block(5, 1);
        let (factory, indexes, _dir) = factory_with_blocks(&[block.clone()]);

        let tree = factory.get_tree(&indexes[0], 0).unwrap();
        assert_eq!(tree.leaf_count(), 5);
        assert_eq!(tree.leaves(), block.txids());

        // Persisted and cached.
        assert!(factory.store().contains(&indexes[0].hash));
        assert_eq!(factory.cache().len(), 1);
    }

    #[test]
    fn second_call_hits_cache() {
        let (factory, indexes, _dir) = factory_with_blocks(&[make_block(3, 1)]);

        let first = factory.get_tree(&indexes[0], 0).unwrap();
        let second = factory.get_tree(&indexes[0], 0).unwrap();
        // Same shared value, not a recomputation.
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn unknown_block_not_available() {
        let (factory, _indexes, _dir) = factory_with_blocks(&[]);
        let unknown = BlockIndex {
            hash: Hash256([0xEE; 32]),
            height: 9,
        };
        let err = factory.get_tree(&unknown, 9).unwrap_err();
        assert!(matches!(err, StoreError::NotAvailable(hash) if hash == unknown.hash));
    }

    #[test]
    fn disk_hit_fills_cache() {
        let block = make_block(4, 2);
        let (factory, indexes, _dir) = factory_with_blocks(&[block.clone()]);

        // Seed the disk tier directly, bypassing the cache.
        let tree = beck_core::merkle::MerkleTree::from_leaves(&block.txids());
        factory
            .store()
            .put(&indexes[0].hash, 0, &tree.encode(), 0)
            .unwrap();
        assert_eq!(factory.cache().len(), 0);

        let served = factory.get_tree(&indexes[0], 0).unwrap();
        assert_eq!(*served, tree);
        assert_eq!(factory.cache().len(), 1);
    }

    #[test]
    fn empty_block_tree() {
        let (factory, indexes, _dir) = factory_with_blocks(&[make_block(0, 3)]);
        let tree = factory.get_tree(&indexes[0], 0).unwrap();
        assert_eq!(tree.leaf_count(), 0);
        assert_eq!(tree.root(), Hash256::ZERO);
    }
}
