//! BLAKE3 Merkle tree with full intermediate layers.
//!
//! Uses domain-separated hashing to prevent second-preimage attacks:
//! - Leaf hash: `BLAKE3(0x00 || leaf)`
//! - Internal node: `BLAKE3(0x01 || left || right)`
//!
//! Odd-length layers are padded by duplicating the last element. Empty trees
//! produce [`Hash256::ZERO`] roots.
//!
//! Trees are stored whole so inclusion proofs can be extracted for any leaf
//! long after the block has been processed. The serialized form is the
//! on-disk payload: `varint(num_leaves) || leaves || varint(num_layers) ||
//! per layer varint(len) || hashes`, every hash 32 bytes, every integer a
//! little-endian varint.

use serde::{Deserialize, Serialize};

use crate::codec::{varint_len, write_varint, ByteReader};
use crate::error::CodecError;
use crate::types::Hash256;

/// Domain separation prefix for leaf hashes.
const LEAF_PREFIX: u8 = 0x00;

/// Domain separation prefix for internal node hashes.
const NODE_PREFIX: u8 = 0x01;

/// Compute a domain-separated leaf hash: `BLAKE3(0x00 || leaf)`.
pub fn leaf_hash(leaf: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_PREFIX]);
    hasher.update(leaf.as_bytes());
    Hash256(hasher.finalize().into())
}

/// Compute a domain-separated internal node hash: `BLAKE3(0x01 || left || right)`.
pub fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[NODE_PREFIX]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash256(hasher.finalize().into())
}

/// Compute the next layer of the tree from the current one.
///
/// Pairs adjacent hashes with [`node_hash`], duplicating the last element
/// when the layer has an odd number of entries. Public so that callers
/// building layers out-of-band (e.g. a worker pool) produce identical trees.
pub fn next_layer(layer: &[Hash256]) -> Vec<Hash256> {
    let mut next = Vec::with_capacity(layer.len().div_ceil(2));
    let mut i = 0;
    while i < layer.len() {
        let left = &layer[i];
        let right = if i + 1 < layer.len() { &layer[i + 1] } else { left };
        next.push(node_hash(left, right));
        i += 2;
    }
    next
}

/// Compute the Merkle root from leaf values without keeping the layers.
///
/// Returns [`Hash256::ZERO`] for an empty slice. Cheaper than building a full
/// [`MerkleTree`] when proofs are not needed.
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return Hash256::ZERO;
    }
    let mut current: Vec<Hash256> = leaves.iter().map(leaf_hash).collect();
    while current.len() > 1 {
        current = next_layer(&current);
    }
    current[0]
}

/// Full Merkle tree: leaf values plus every hash layer up to the root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleTree {
    /// Original leaf values (typically transaction IDs).
    leaves: Vec<Hash256>,
    /// `layers[0]` = leaf hashes, `layers[last]` = `[root]`.
    layers: Vec<Vec<Hash256>>,
}

impl MerkleTree {
    /// Build a Merkle tree from leaf values.
    pub fn from_leaves(leaves: &[Hash256]) -> Self {
        if leaves.is_empty() {
            return Self {
                leaves: Vec::new(),
                layers: Vec::new(),
            };
        }

        let mut layers = Vec::new();
        layers.push(leaves.iter().map(leaf_hash).collect::<Vec<_>>());
        while let Some(last) = layers.last() {
            if last.len() <= 1 {
                break;
            }
            let next = next_layer(last);
            layers.push(next);
        }

        Self {
            leaves: leaves.to_vec(),
            layers,
        }
    }

    /// Assemble a tree from layers computed elsewhere.
    ///
    /// The caller guarantees `layers` is exactly what [`from_leaves`] would
    /// produce for `leaves`; this is the seam the parallel builder uses.
    pub fn from_parts(leaves: Vec<Hash256>, layers: Vec<Vec<Hash256>>) -> Self {
        debug_assert_eq!(layers.first().map(Vec::len), if leaves.is_empty() { None } else { Some(leaves.len()) });
        debug_assert!(layers.last().map_or(leaves.is_empty(), |l| l.len() == 1));
        Self { leaves, layers }
    }

    /// The Merkle root. Returns [`Hash256::ZERO`] for an empty tree.
    pub fn root(&self) -> Hash256 {
        self.layers
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or(Hash256::ZERO)
    }

    /// Number of leaves in the tree.
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// The original leaf values.
    pub fn leaves(&self) -> &[Hash256] {
        &self.leaves
    }

    /// Generate an inclusion proof for the leaf at `index`.
    ///
    /// Returns `None` if the index is out of bounds or the tree is empty.
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        if self.leaves.is_empty() || index >= self.leaves.len() {
            return None;
        }

        let mut path = Vec::new();
        let mut pos = index;

        // Walk from leaf layer to just below the root.
        for layer in &self.layers[..self.layers.len() - 1] {
            let sibling_pos = pos ^ 1;
            let sibling = if sibling_pos < layer.len() {
                layer[sibling_pos]
            } else {
                // Odd layer: last element's sibling is itself (duplication).
                layer[pos]
            };

            let side = if pos % 2 == 0 { Side::Right } else { Side::Left };
            path.push(ProofStep { hash: sibling, side });
            pos /= 2;
        }

        Some(MerkleProof {
            leaf_index: index,
            leaf: self.leaves[index],
            path,
        })
    }

    /// Size in bytes of [`encode`](Self::encode)'s output.
    ///
    /// The cache and the disk store account capacity with this value.
    pub fn encoded_len(&self) -> u64 {
        let mut len = varint_len(self.leaves.len() as u64) + 32 * self.leaves.len();
        len += varint_len(self.layers.len() as u64);
        for layer in &self.layers {
            len += varint_len(layer.len() as u64) + 32 * layer.len();
        }
        len as u64
    }

    /// Serialize to the on-disk payload format.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len() as usize);
        write_varint(&mut out, self.leaves.len() as u64);
        for leaf in &self.leaves {
            out.extend_from_slice(leaf.as_bytes());
        }
        write_varint(&mut out, self.layers.len() as u64);
        for layer in &self.layers {
            write_varint(&mut out, layer.len() as u64);
            for hash in layer {
                out.extend_from_slice(hash.as_bytes());
            }
        }
        out
    }

    /// Decode the on-disk payload format.
    ///
    /// Validates the layer structure (each layer half the previous, rounded
    /// up, ending in a single root) and that the buffer is fully consumed;
    /// hash values themselves are trusted.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut reader = ByteReader::new(buf);

        let num_leaves = reader.read_count()?;
        let mut leaves = Vec::with_capacity(num_leaves);
        for _ in 0..num_leaves {
            leaves.push(reader.read_hash()?);
        }

        let num_layers = reader.read_varint()? as usize;
        // Every layer costs at least one length byte; a count beyond the
        // remaining input is corrupt and must not drive an allocation.
        if num_layers > reader.remaining() {
            return Err(CodecError::LengthOutOfBounds {
                len: num_layers as u64,
                remaining: reader.remaining(),
            });
        }
        let mut layers = Vec::with_capacity(num_layers);
        for _ in 0..num_layers {
            let len = reader.read_count()?;
            let mut layer = Vec::with_capacity(len);
            for _ in 0..len {
                layer.push(reader.read_hash()?);
            }
            layers.push(layer);
        }
        reader.finish()?;

        Self::validate_shape(&leaves, &layers)?;
        Ok(Self { leaves, layers })
    }

    fn validate_shape(leaves: &[Hash256], layers: &[Vec<Hash256>]) -> Result<(), CodecError> {
        if leaves.is_empty() {
            if layers.is_empty() {
                return Ok(());
            }
            return Err(CodecError::MalformedTree(
                "layers present for empty leaf set".into(),
            ));
        }

        let first = layers
            .first()
            .ok_or_else(|| CodecError::MalformedTree("no layers for non-empty leaf set".into()))?;
        if first.len() != leaves.len() {
            return Err(CodecError::MalformedTree(format!(
                "leaf layer has {} hashes for {} leaves",
                first.len(),
                leaves.len()
            )));
        }
        for window in layers.windows(2) {
            let expected = window[0].len().div_ceil(2);
            if window[1].len() != expected {
                return Err(CodecError::MalformedTree(format!(
                    "layer of {} above layer of {}",
                    window[1].len(),
                    window[0].len()
                )));
            }
        }
        match layers.last() {
            Some(last) if last.len() == 1 => Ok(()),
            _ => Err(CodecError::MalformedTree("tree does not end in a root".into())),
        }
    }
}

/// Which side a sibling hash is on relative to the current node.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub enum Side {
    /// Sibling is on the left (we are on the right).
    Left,
    /// Sibling is on the right (we are on the left).
    Right,
}

/// A single step in a Merkle inclusion proof.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct ProofStep {
    /// The sibling hash at this level of the tree.
    pub hash: Hash256,
    /// Which side the sibling is on.
    pub side: Side,
}

/// Merkle inclusion proof for a single leaf.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct MerkleProof {
    /// Index of the leaf in the original tree.
    pub leaf_index: usize,
    /// The original leaf value (e.g. a transaction ID).
    pub leaf: Hash256,
    /// Sibling hashes from leaf level up to root.
    pub path: Vec<ProofStep>,
}

impl MerkleProof {
    /// Verify this proof against an expected Merkle root.
    pub fn verify(&self, expected_root: &Hash256) -> bool {
        let mut current = leaf_hash(&self.leaf);
        for step in &self.path {
            current = match step.side {
                Side::Left => node_hash(&step.hash, &current),
                Side::Right => node_hash(&current, &step.hash),
            };
        }
        current == *expected_root
    }
}
