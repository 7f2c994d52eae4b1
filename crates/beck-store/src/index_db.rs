//! RocksDB-backed index of the merkle tree file set.
//!
//! Three key families in the default column family:
//! - `'E' || block_hash` → `varint(suffix) varint(offset) varint(len) varint(height)`
//! - `'F' || be32(suffix)` → `varint(disk_bytes) varint(greatest_height)`
//! - `'N'` → `varint(suffix) varint(offset)` (the next write position)
//!
//! Every mutation goes through an [`IndexBatch`] committed atomically with a
//! synced write, so readers observe either the pre- or post-state and a
//! committed batch survives a crash.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use rocksdb::{BlockBasedOptions, Cache, IteratorMode, Options, WriteBatch, WriteOptions, DB};

use beck_core::codec::{write_varint, ByteReader};
use beck_core::error::CodecError;
use beck_core::types::Hash256;

use crate::error::StoreError;
use crate::layout::DiskPosition;

const ENTRY_PREFIX: u8 = b'E';
const FILE_PREFIX: u8 = b'F';
const NEXT_POSITION_KEY: [u8; 1] = [b'N'];

/// Where a tree's serialized bytes live and the height they belong to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    /// First byte of the serialized tree.
    pub pos: DiskPosition,
    /// Serialized length in bytes.
    pub len: u64,
    /// Height of the block the tree was computed from.
    pub height: u64,
}

/// Aggregate facts about one data file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct FileInfo {
    /// Bytes of live tree data in the file (equals the file size).
    pub disk_bytes: u64,
    /// Greatest block height among the trees in the file. Drives the
    /// retention window during pruning.
    pub greatest_height: u64,
}

/// Everything the index knows, loaded into memory.
#[derive(Debug, Default)]
pub(crate) struct IndexState {
    pub entries: HashMap<Hash256, IndexEntry>,
    pub files: BTreeMap<u32, FileInfo>,
    pub next: DiskPosition,
}

/// A set of index mutations applied atomically.
#[derive(Default)]
pub(crate) struct IndexBatch {
    inner: WriteBatch,
}

impl IndexBatch {
    pub fn put_entry(&mut self, hash: &Hash256, entry: &IndexEntry) {
        let mut value = Vec::with_capacity(4 * 10);
        write_varint(&mut value, u64::from(entry.pos.suffix));
        write_varint(&mut value, entry.pos.offset);
        write_varint(&mut value, entry.len);
        write_varint(&mut value, entry.height);
        self.inner.put(entry_key(hash), value);
    }

    pub fn delete_entry(&mut self, hash: &Hash256) {
        self.inner.delete(entry_key(hash));
    }

    pub fn put_file(&mut self, suffix: u32, info: &FileInfo) {
        let mut value = Vec::with_capacity(2 * 10);
        write_varint(&mut value, info.disk_bytes);
        write_varint(&mut value, info.greatest_height);
        self.inner.put(file_key(suffix), value);
    }

    pub fn delete_file(&mut self, suffix: u32) {
        self.inner.delete(file_key(suffix));
    }

    pub fn put_next(&mut self, pos: &DiskPosition) {
        let mut value = Vec::with_capacity(2 * 10);
        write_varint(&mut value, u64::from(pos.suffix));
        write_varint(&mut value, pos.offset);
        self.inner.put(NEXT_POSITION_KEY, value);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

fn entry_key(hash: &Hash256) -> [u8; 33] {
    let mut key = [0u8; 33];
    key[0] = ENTRY_PREFIX;
    key[1..].copy_from_slice(hash.as_bytes());
    key
}

fn file_key(suffix: u32) -> [u8; 5] {
    let mut key = [0u8; 5];
    key[0] = FILE_PREFIX;
    key[1..].copy_from_slice(&suffix.to_be_bytes());
    key
}

/// The durable index database.
pub(crate) struct TreeIndexDb {
    db: DB,
}

impl TreeIndexDb {
    /// Open or create the index at `path` with the given block cache size.
    pub fn open(path: &Path, cache_bytes: usize) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(&Cache::new_lru_cache(cache_bytes));
        opts.set_block_based_table_factory(&block_opts);

        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    /// Apply a batch atomically and durably.
    pub fn write(&self, batch: IndexBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch.inner, &write_opts)?;
        Ok(())
    }

    /// Load the whole index.
    ///
    /// Returns `Ok(None)` for a brand-new (empty) database. A database that
    /// has rows but no next-write-position singleton, or any row that fails
    /// to decode, is reported as [`StoreError::CorruptIndex`] so the store
    /// can reset.
    pub fn load_all(&self) -> Result<Option<IndexState>, StoreError> {
        let mut entries = HashMap::new();
        let mut files = BTreeMap::new();
        let mut next = None;
        let mut rows = 0usize;

        for item in self.db.iterator(IteratorMode::Start) {
            let (key, value) = item?;
            rows += 1;
            match key.first() {
                Some(&ENTRY_PREFIX) => {
                    let hash: [u8; 32] = key[1..]
                        .try_into()
                        .map_err(|_| corrupt_row("entry key length", &key))?;
                    let entry = decode_entry(&value)
                        .map_err(|e| corrupt_row(&format!("entry value: {e}"), &key))?;
                    entries.insert(Hash256(hash), entry);
                }
                Some(&FILE_PREFIX) => {
                    let raw: [u8; 4] = key[1..]
                        .try_into()
                        .map_err(|_| corrupt_row("file key length", &key))?;
                    let info = decode_file_info(&value)
                        .map_err(|e| corrupt_row(&format!("file value: {e}"), &key))?;
                    files.insert(u32::from_be_bytes(raw), info);
                }
                Some(&b'N') if key.len() == 1 => {
                    next = Some(
                        decode_position(&value)
                            .map_err(|e| corrupt_row(&format!("next position: {e}"), &key))?,
                    );
                }
                _ => return Err(corrupt_row("unknown key family", &key)),
            }
        }

        if rows == 0 {
            return Ok(None);
        }
        let next = next.ok_or_else(|| {
            StoreError::CorruptIndex("missing next-write-position row".into())
        })?;
        Ok(Some(IndexState {
            entries,
            files,
            next,
        }))
    }

    /// Queue deletion of every row into `batch`.
    ///
    /// Used by the store reset path; the caller commits the batch together
    /// with the fresh next-write-position row.
    pub fn delete_all_into(&self, batch: &mut IndexBatch) -> Result<(), StoreError> {
        for item in self.db.iterator(IteratorMode::Start) {
            let (key, _) = item?;
            batch.inner.delete(key);
        }
        Ok(())
    }
}

fn corrupt_row(reason: &str, key: &[u8]) -> StoreError {
    let hex: String = key.iter().map(|b| format!("{b:02x}")).collect();
    StoreError::CorruptIndex(format!("{reason} (key {hex})"))
}

fn decode_entry(value: &[u8]) -> Result<IndexEntry, CodecError> {
    let mut reader = ByteReader::new(value);
    let suffix = read_suffix(&mut reader)?;
    let offset = reader.read_varint()?;
    let len = reader.read_varint()?;
    let height = reader.read_varint()?;
    reader.finish()?;
    Ok(IndexEntry {
        pos: DiskPosition { suffix, offset },
        len,
        height,
    })
}

fn decode_file_info(value: &[u8]) -> Result<FileInfo, CodecError> {
    let mut reader = ByteReader::new(value);
    let disk_bytes = reader.read_varint()?;
    let greatest_height = reader.read_varint()?;
    reader.finish()?;
    Ok(FileInfo {
        disk_bytes,
        greatest_height,
    })
}

fn decode_position(value: &[u8]) -> Result<DiskPosition, CodecError> {
    let mut reader = ByteReader::new(value);
    let suffix = read_suffix(&mut reader)?;
    let offset = reader.read_varint()?;
    reader.finish()?;
    Ok(DiskPosition { suffix, offset })
}

fn read_suffix(reader: &mut ByteReader<'_>) -> Result<u32, CodecError> {
    let raw = reader.read_varint()?;
    u32::try_from(raw).map_err(|_| CodecError::ValueOutOfRange(raw))
}
