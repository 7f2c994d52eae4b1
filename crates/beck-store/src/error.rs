//! Error types for the Beck store layer.
use thiserror::Error;

use beck_core::error::CodecError;
use beck_core::types::Hash256;

/// Failures across the disk store, index database, and factory.
///
/// The disk store recovers only from partial-write I/O (rollback plus file
/// truncation); everything else is surfaced. The factory absorbs
/// [`AlreadyPresent`](StoreError::AlreadyPresent) and
/// [`Capacity`](StoreError::Capacity) and surfaces only
/// [`NotAvailable`](StoreError::NotAvailable) to its callers.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode: {0}")]
    Decode(#[from] CodecError),

    #[error("index database: {0}")]
    Database(#[from] rocksdb::Error),

    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    #[error("merkle tree already stored for block {0}")]
    AlreadyPresent(Hash256),

    #[error("cannot store {needed} bytes within the {limit} byte disk limit without pruning retained trees")]
    Capacity { needed: u64, limit: u64 },

    #[error("block {0} not available")]
    NotAvailable(Hash256),
}
