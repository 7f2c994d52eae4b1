//! Strict-FIFO memory cache of merkle trees.
//!
//! Insertion order is eviction order: no per-access bookkeeping, predictable
//! eviction. Capacity is accounted in serialized bytes, the same measure the
//! disk tier uses.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use beck_core::merkle::MerkleTree;
use beck_core::types::Hash256;

struct CacheInner {
    map: HashMap<Hash256, Arc<MerkleTree>>,
    order: VecDeque<Hash256>,
    bytes: u64,
}

/// Byte-bounded FIFO cache keyed by block hash.
pub struct TreeCache {
    inner: Mutex<CacheInner>,
    max_bytes: u64,
}

impl TreeCache {
    /// Create a cache holding at most `max_bytes` of serialized tree data.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                bytes: 0,
            }),
            max_bytes,
        }
    }

    /// Look up a tree. Does not affect eviction order.
    pub fn get(&self, hash: &Hash256) -> Option<Arc<MerkleTree>> {
        self.inner.lock().map.get(hash).cloned()
    }

    /// Insert a tree, evicting the oldest entries until it fits.
    ///
    /// A hash already present is left untouched. A tree larger than the
    /// whole cache budget is not inserted and evicts nothing.
    pub fn insert(&self, hash: Hash256, tree: Arc<MerkleTree>) {
        let size = tree.encoded_len();
        if size > self.max_bytes {
            debug!(%hash, size, limit = self.max_bytes, "tree exceeds cache budget; not cached");
            return;
        }

        let mut inner = self.inner.lock();
        if inner.map.contains_key(&hash) {
            return;
        }

        while inner.bytes + size > self.max_bytes {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if let Some(evicted) = inner.map.remove(&oldest) {
                inner.bytes -= evicted.encoded_len();
                debug!(hash = %oldest, freed = evicted.encoded_len(), "evicted merkle tree from cache");
            }
        }

        inner.bytes += size;
        inner.map.insert(hash, tree);
        inner.order.push_back(hash);
    }

    /// Number of cached trees.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }

    /// Bytes currently accounted against the budget.
    pub fn byte_size(&self) -> u64 {
        self.inner.lock().bytes
    }
}
