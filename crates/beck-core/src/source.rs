//! Block retrieval interface.
//!
//! The merkle tree store computes trees from blocks it does not own; the
//! [`BlockSource`] trait is the seam to whatever holds them (the block store
//! in the full node, a map in tests).

use std::collections::HashMap;

use crate::types::{Block, BlockIndex};

/// Read-only access to block bodies.
pub trait BlockSource: Send + Sync {
    /// Load the block identified by `index`. Returns `None` if the block is
    /// unknown or cannot be read.
    fn load_block(&self, index: &BlockIndex) -> Option<Block>;
}

/// In-memory [`BlockSource`] keyed by block hash. Suitable for testing.
#[derive(Default)]
pub struct MemoryBlockSource {
    blocks: HashMap<crate::types::Hash256, Block>,
}

impl MemoryBlockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a block under its own header hash.
    pub fn insert(&mut self, block: Block) {
        self.blocks.insert(block.hash(), block);
    }

    /// Number of registered blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl BlockSource for MemoryBlockSource {
    fn load_block(&self, index: &BlockIndex) -> Option<Block> {
        self.blocks.get(&index.hash).cloned()
    }
}
