//! # beck-store — Two-tier merkle tree store.
//!
//! A bounded FIFO memory cache in front of an append-style on-disk store
//! whose file set is governed by a RocksDB index:
//! - [`factory::MerkleTreeFactory`] — public façade: cache, then disk, then
//!   compute-and-persist
//! - [`disk_store::DiskStore`] — data files + index, pruned at file
//!   granularity under a retention window
//! - [`cache::TreeCache`] — strict-FIFO byte-bounded cache
//! - [`compute::ComputePool`] — worker pool for parallel tree construction
//! - [`config::StoreConfig`] — store configuration

pub mod cache;
pub mod compute;
pub mod config;
pub mod disk_store;
pub mod error;
pub mod factory;
mod index_db;
mod layout;

pub use cache::TreeCache;
pub use compute::ComputePool;
pub use config::StoreConfig;
pub use disk_store::DiskStore;
pub use error::StoreError;
pub use factory::MerkleTreeFactory;
