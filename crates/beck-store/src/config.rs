//! Store configuration.
//!
//! Provides [`StoreConfig`] with defaults for file sizing, cache and disk
//! budgets, and compute parallelism. The configuration is built
//! programmatically by the embedding node.

use std::path::{Path, PathBuf};

/// Number of most recent blocks whose merkle trees must stay on disk.
///
/// Data files still holding a tree inside this window are never pruned.
pub const MIN_BLOCKS_TO_KEEP: u64 = 288;

/// Default soft cap on the size of a single data file: 32 MiB.
pub const DEFAULT_PREFERRED_FILE_SIZE: u64 = 32 * 1024 * 1024;

/// Default memory cache budget: 32 MiB.
pub const DEFAULT_CACHE_BYTES: u64 = 32 * 1024 * 1024;

/// Default RocksDB block cache for the tree index: 8 MiB.
pub const DEFAULT_INDEX_DB_CACHE_BYTES: usize = 8 * 1024 * 1024;

/// Configuration for a merkle tree store instance.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Absolute path to the directory holding the data files.
    pub store_path: PathBuf,
    /// Soft cap on per-file bytes; a file is sealed once a write would push
    /// it past this size. A single tree larger than this gets its own file.
    pub preferred_file_size: u64,
    /// Hard cap on the summed size of all data files. `u64::MAX` disables
    /// the cap.
    pub max_disk_space: u64,
    /// Hard cap on memory cache bytes.
    pub max_cache_bytes: u64,
    /// Worker count for parallel tree computation.
    pub max_compute_threads: usize,
    /// RocksDB block cache size for the tree index.
    pub index_db_cache_bytes: usize,
}

impl StoreConfig {
    /// Configuration with defaults for everything but the path.
    pub fn new(store_path: impl AsRef<Path>) -> Self {
        Self {
            store_path: store_path.as_ref().to_path_buf(),
            preferred_file_size: DEFAULT_PREFERRED_FILE_SIZE,
            max_disk_space: u64::MAX,
            max_cache_bytes: DEFAULT_CACHE_BYTES,
            max_compute_threads: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            index_db_cache_bytes: DEFAULT_INDEX_DB_CACHE_BYTES,
        }
    }

    /// Path to the RocksDB index directory, adjacent to the data files.
    pub fn index_db_path(&self) -> PathBuf {
        self.store_path.join("index")
    }
}
