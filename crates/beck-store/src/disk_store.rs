//! On-disk tier of the merkle tree store.
//!
//! Trees are appended to numbered data files; a RocksDB index maps block
//! hashes to byte ranges and tracks per-file size and greatest block height.
//! One mutex covers the in-memory maps, the write cursor, the usage counter
//! and index batch submission, so at every mutex release the in-memory state
//! equals the last committed index state.
//!
//! Disk capacity is reclaimed at whole-file granularity: when a write would
//! exceed the disk budget, the oldest files whose greatest height has fallen
//! out of the retention window are unlinked and their index rows are deleted
//! in the same atomic batch that commits the new write.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{Read, Write};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use beck_core::merkle::MerkleTree;
use beck_core::types::Hash256;

use crate::config::{StoreConfig, MIN_BLOCKS_TO_KEEP};
use crate::error::StoreError;
use crate::index_db::{FileInfo, IndexBatch, IndexEntry, IndexState, TreeIndexDb};
use crate::layout::{DiskPosition, FileLayout};

struct StoreState {
    entries: HashMap<Hash256, IndexEntry>,
    files: BTreeMap<u32, FileInfo>,
    next: DiskPosition,
    disk_usage: u64,
}

impl StoreState {
    fn from_index(state: IndexState) -> Self {
        let disk_usage = state.files.values().map(|info| info.disk_bytes).sum();
        Self {
            entries: state.entries,
            files: state.files,
            next: state.next,
            disk_usage,
        }
    }
}

/// Durable store of serialized merkle trees.
pub struct DiskStore {
    state: Mutex<StoreState>,
    layout: FileLayout,
    index: TreeIndexDb,
    preferred_file_size: u64,
    max_disk_space: u64,
}

impl DiskStore {
    /// Open the store, creating the directory and index as needed.
    ///
    /// A fresh directory is initialized empty. An index that cannot be read,
    /// or that disagrees irreconcilably with the file set, is reset: all
    /// data files are deleted and the index is cleared.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.store_path)?;
        let layout = FileLayout::new(&config.store_path);
        let index = TreeIndexDb::open(&config.index_db_path(), config.index_db_cache_bytes)?;

        let state = match index.load_all() {
            Ok(Some(state)) => match Self::reconcile(&layout, &index, state) {
                Ok(state) => state,
                Err(StoreError::CorruptIndex(reason)) => {
                    warn!(%reason, "merkle tree index disagrees with file set; resetting store");
                    Self::reset(&layout, &index)?
                }
                Err(e) => return Err(e),
            },
            Ok(None) => {
                info!(path = %config.store_path.display(), "initializing empty merkle tree store");
                Self::reset(&layout, &index)?
            }
            Err(StoreError::CorruptIndex(reason)) => {
                warn!(%reason, "merkle tree index unreadable; resetting store");
                Self::reset(&layout, &index)?
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            state: Mutex::new(StoreState::from_index(state)),
            layout,
            index,
            preferred_file_size: config.preferred_file_size,
            max_disk_space: config.max_disk_space,
        })
    }

    /// Store a serialized tree for `block_hash` at `height`.
    ///
    /// `chain_height` bounds pruning: files still holding a tree within the
    /// last [`MIN_BLOCKS_TO_KEEP`] blocks are never deleted to make room.
    ///
    /// # Errors
    ///
    /// - [`StoreError::AlreadyPresent`] if a tree for `block_hash` exists;
    ///   nothing is written
    /// - [`StoreError::Capacity`] if pruning cannot free enough space;
    ///   nothing is written
    /// - [`StoreError::Io`] on filesystem failure; in-memory state is rolled
    ///   back and the data file holds no unreferenced bytes
    pub fn put(
        &self,
        block_hash: &Hash256,
        height: u64,
        encoded: &[u8],
        chain_height: u64,
    ) -> Result<(), StoreError> {
        let need = encoded.len() as u64;
        let mut state = self.state.lock();

        if state.entries.contains_key(block_hash) {
            return Err(StoreError::AlreadyPresent(*block_hash));
        }

        let mut batch = IndexBatch::default();

        if state.disk_usage.saturating_add(need) > self.max_disk_space {
            if let Err(e) = self.prune_locked(&mut state, &mut batch, need, chain_height) {
                // Files already unlinked stay pruned; their deletions must
                // still reach the index.
                self.commit_best_effort(batch);
                return Err(e);
            }
        }

        // Seal the current file when the tree will not fit. A tree larger
        // than a whole file writes from offset zero of a fresh file.
        let mut write_pos = state.next;
        if write_pos.offset > 0 && write_pos.offset + need > self.preferred_file_size {
            write_pos = DiskPosition {
                suffix: write_pos.suffix + 1,
                offset: 0,
            };
        }

        if let Err(e) = self.append(&write_pos, encoded) {
            self.commit_best_effort(batch);
            return Err(e);
        }

        // Mirror in memory exactly what the batch will commit.
        let entry = IndexEntry {
            pos: write_pos,
            len: need,
            height,
        };
        let prev_next = state.next;
        let prev_info = state.files.get(&write_pos.suffix).copied();
        state.entries.insert(*block_hash, entry);
        let info = state.files.entry(write_pos.suffix).or_default();
        info.disk_bytes += need;
        info.greatest_height = info.greatest_height.max(height);
        let info = *info;
        state.next = DiskPosition {
            suffix: write_pos.suffix,
            offset: write_pos.offset + need,
        };
        state.disk_usage += need;

        batch.put_entry(block_hash, &entry);
        batch.put_file(write_pos.suffix, &info);
        batch.put_next(&state.next);

        if let Err(e) = self.index.write(batch) {
            state.entries.remove(block_hash);
            match prev_info {
                Some(prev) => {
                    state.files.insert(write_pos.suffix, prev);
                }
                None => {
                    state.files.remove(&write_pos.suffix);
                }
            }
            state.next = prev_next;
            state.disk_usage -= need;
            if let Err(trunc) = self.discard_written(&write_pos) {
                warn!(
                    suffix = write_pos.suffix,
                    "failed to discard bytes of aborted write: {trunc}"
                );
            }
            return Err(e);
        }

        debug!(
            hash = %block_hash,
            height,
            bytes = need,
            suffix = write_pos.suffix,
            offset = write_pos.offset,
            "stored merkle tree"
        );
        Ok(())
    }

    /// Read and decode the tree stored for `block_hash`.
    pub fn get(&self, block_hash: &Hash256) -> Result<Option<MerkleTree>, StoreError> {
        let state = self.state.lock();
        let Some(entry) = state.entries.get(block_hash).copied() else {
            return Ok(None);
        };

        // The read happens under the mutex so a concurrent prune cannot
        // unlink the file first.
        let mut file = self.layout.open_read(&entry.pos)?;
        let mut buf = vec![0u8; entry.len as usize];
        file.read_exact(&mut buf)?;
        drop(state);

        Ok(Some(MerkleTree::decode(&buf)?))
    }

    /// Whether a tree for `block_hash` is stored.
    pub fn contains(&self, block_hash: &Hash256) -> bool {
        self.state.lock().entries.contains_key(block_hash)
    }

    /// Summed size in bytes of all data files.
    pub fn disk_usage(&self) -> u64 {
        self.state.lock().disk_usage
    }

    /// Number of data files.
    pub fn file_count(&self) -> usize {
        self.state.lock().files.len()
    }

    /// Number of stored trees.
    pub fn tree_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// The append point as `(file suffix, byte offset)`.
    pub fn next_write_position(&self) -> (u32, u64) {
        let state = self.state.lock();
        (state.next.suffix, state.next.offset)
    }

    /// Delete old data files until `need` more bytes fit under the budget.
    ///
    /// Victims are sealed files whose greatest height is at least
    /// [`MIN_BLOCKS_TO_KEEP`] behind `chain_height`, taken oldest-first.
    /// When even deleting every eligible file would not free enough, nothing
    /// is touched and [`StoreError::Capacity`] is returned. Files are
    /// unlinked before their index deletions commit; load-time
    /// reconciliation covers a crash in between.
    fn prune_locked(
        &self,
        state: &mut StoreState,
        batch: &mut IndexBatch,
        need: u64,
        chain_height: u64,
    ) -> Result<(), StoreError> {
        let mut victims = Vec::new();
        let mut freed = 0u64;
        if let Some(cutoff) = chain_height.checked_sub(MIN_BLOCKS_TO_KEEP) {
            for (&suffix, info) in state.files.iter() {
                if (state.disk_usage - freed).saturating_add(need) <= self.max_disk_space {
                    break;
                }
                if suffix == state.next.suffix || info.greatest_height > cutoff {
                    continue;
                }
                victims.push(suffix);
                freed += info.disk_bytes;
            }
        }

        if (state.disk_usage - freed).saturating_add(need) > self.max_disk_space {
            return Err(StoreError::Capacity {
                needed: need,
                limit: self.max_disk_space,
            });
        }

        for suffix in victims {
            self.layout.remove(suffix)?;
            let Some(info) = state.files.remove(&suffix) else {
                continue;
            };
            state.disk_usage -= info.disk_bytes;
            batch.delete_file(suffix);
            let mut dropped = 0usize;
            state.entries.retain(|hash, entry| {
                if entry.pos.suffix == suffix {
                    batch.delete_entry(hash);
                    dropped += 1;
                    false
                } else {
                    true
                }
            });
            info!(
                suffix,
                freed = info.disk_bytes,
                trees = dropped,
                "pruned merkle tree data file"
            );
        }
        Ok(())
    }

    /// Write `bytes` at `pos` and flush content and metadata.
    ///
    /// A failed or partial write is truncated away before returning so the
    /// file never keeps unreferenced bytes.
    fn append(&self, pos: &DiskPosition, bytes: &[u8]) -> Result<(), StoreError> {
        let mut file = self.layout.open_append(pos)?;
        if let Err(e) = file.write_all(bytes).and_then(|()| file.sync_all()) {
            drop(file);
            if let Err(trunc) = self.discard_written(pos) {
                warn!(suffix = pos.suffix, "failed to truncate partial write: {trunc}");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Drop everything at and past `pos` from its file.
    fn discard_written(&self, pos: &DiskPosition) -> Result<(), StoreError> {
        if pos.offset > 0 {
            self.layout.truncate(pos.suffix, pos.offset)?;
        } else {
            self.layout.remove(pos.suffix)?;
        }
        Ok(())
    }

    fn commit_best_effort(&self, batch: IndexBatch) {
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.index.write(batch) {
            warn!("failed to persist prune deletions: {e}");
        }
    }

    /// Wipe the store: every data file deleted, the index cleared, the
    /// write cursor back at the start.
    fn reset(layout: &FileLayout, index: &TreeIndexDb) -> Result<IndexState, StoreError> {
        for (_, path) in layout.data_files()? {
            fs::remove_file(path)?;
        }
        let mut batch = IndexBatch::default();
        index.delete_all_into(&mut batch)?;
        batch.put_next(&DiskPosition::START);
        index.write(batch)?;
        Ok(IndexState::default())
    }

    /// Bring a loaded index and the file set back in step after a crash.
    ///
    /// Handles the two residues of unlink-before-commit and append-before-
    /// commit: index rows pointing at missing files are dropped, and file
    /// bytes past the committed state are truncated or deleted. Committed
    /// bytes that are gone from disk cannot be repaired and surface as
    /// [`StoreError::CorruptIndex`], which resets the store.
    fn reconcile(
        layout: &FileLayout,
        index: &TreeIndexDb,
        mut state: IndexState,
    ) -> Result<IndexState, StoreError> {
        let mut batch = IndexBatch::default();

        let missing: Vec<u32> = state
            .files
            .keys()
            .copied()
            .filter(|&suffix| !layout.data_file_path(suffix).exists())
            .collect();
        for suffix in missing {
            if suffix == state.next.suffix && state.next.offset > 0 {
                return Err(StoreError::CorruptIndex(format!(
                    "append file {suffix} missing"
                )));
            }
            state.files.remove(&suffix);
            batch.delete_file(suffix);
            let mut dropped = 0usize;
            state.entries.retain(|hash, entry| {
                if entry.pos.suffix == suffix {
                    batch.delete_entry(hash);
                    dropped += 1;
                    false
                } else {
                    true
                }
            });
            warn!(suffix, dropped, "data file missing; dropping its index rows");
        }

        if state.next.offset > 0 {
            match state.files.get(&state.next.suffix) {
                None => {
                    return Err(StoreError::CorruptIndex(format!(
                        "no file info for append file {}",
                        state.next.suffix
                    )));
                }
                Some(info) if info.disk_bytes != state.next.offset => {
                    return Err(StoreError::CorruptIndex(format!(
                        "append file {} has {} indexed bytes but cursor at {}",
                        state.next.suffix, info.disk_bytes, state.next.offset
                    )));
                }
                Some(_) => {}
            }
        }

        for (&suffix, info) in &state.files {
            let size = layout.file_size(suffix)?;
            match size.cmp(&info.disk_bytes) {
                std::cmp::Ordering::Greater => {
                    warn!(
                        suffix,
                        size,
                        expected = info.disk_bytes,
                        "truncating data file past committed bytes"
                    );
                    layout.truncate(suffix, info.disk_bytes)?;
                }
                std::cmp::Ordering::Less => {
                    return Err(StoreError::CorruptIndex(format!(
                        "data file {suffix} is {size} bytes, index expects {}",
                        info.disk_bytes
                    )));
                }
                std::cmp::Ordering::Equal => {}
            }
        }

        for (suffix, path) in layout.data_files()? {
            if state.files.contains_key(&suffix) {
                continue;
            }
            if suffix == state.next.suffix {
                // First write to a fresh append file crashed before its
                // commit; drop the uncommitted bytes.
                let size = fs::metadata(&path)?.len();
                if size > state.next.offset {
                    warn!(suffix, size, "truncating uncommitted bytes in append file");
                    layout.truncate(suffix, state.next.offset)?;
                }
            } else {
                warn!(suffix, "removing orphan data file");
                fs::remove_file(&path)?;
            }
        }

        if !batch.is_empty() {
            index.write(batch)?;
        }
        Ok(state)
    }
}
