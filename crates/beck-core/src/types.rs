//! Core block types: hashes, transactions, blocks.
//!
//! Only what the merkle tree store needs from the wider node is kept here:
//! enough block structure to derive the leaf hashes a tree is built from.
//! Transaction contents are opaque to the store.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::codec::write_varint;

/// A 32-byte hash value.
///
/// Block header hashes (double SHA-256) key both store tiers; transaction
/// IDs and merkle layer hashes (BLAKE3) make up the stored trees.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The all-zero hash, also the root of an empty tree.
    pub const ZERO: Self = Self([0u8; 32]);

    /// The underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether this is the all-zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A transaction as the merkle tree store sees it: a version and the
/// canonical serialized body.
///
/// The store never interprets transaction contents; it only derives a
/// stable ID per transaction to use as a tree leaf. Spend semantics
/// (inputs, outputs, signatures) live in the validation layer and never
/// reach this crate.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    /// Protocol version.
    pub version: u64,
    /// Canonical serialized transaction body.
    pub data: Vec<u8>,
}

impl Transaction {
    /// Compute the transaction ID.
    ///
    /// BLAKE3 over the explicit layout `varint(version) || varint(len) ||
    /// data`, so the ID is stable independent of any serialization
    /// framework.
    pub fn txid(&self) -> Hash256 {
        let mut bytes = Vec::with_capacity(self.data.len() + 2 * 10);
        write_varint(&mut bytes, self.version);
        write_varint(&mut bytes, self.data.len() as u64);
        bytes.extend_from_slice(&self.data);
        Hash256(blake3::hash(&bytes).into())
    }
}

/// Block header.
///
/// Hash is computed as double SHA-256 over a fixed byte layout.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    /// Protocol version.
    pub version: u64,
    /// Hash of the previous block header.
    pub prev_hash: Hash256,
    /// BLAKE3 merkle root of the block's transactions.
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Proof-of-work nonce.
    pub nonce: u64,
}

impl BlockHeader {
    /// Header size in bytes when serialized for hashing.
    const HASH_SIZE: usize = 3 * 8 + 2 * 32;

    /// Compute the block header hash (double SHA-256).
    ///
    /// Explicit fixed byte layout: version || prev_hash || merkle_root ||
    /// timestamp || nonce, all little-endian.
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(Self::HASH_SIZE);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(self.prev_hash.as_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        let first = Sha256::digest(&data);
        Hash256(Sha256::digest(first).into())
    }
}

/// A complete block: header plus transactions.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    /// Block header with proof-of-work.
    pub header: BlockHeader,
    /// Ordered list of transactions.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Block hash, i.e. the header hash.
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Transaction IDs in block order.
    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::txid).collect()
    }
}

/// Identity of a block in the chain: its hash and height.
///
/// The merkle tree store keys everything by hash; the height feeds the
/// retention window.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockIndex {
    /// Block header hash.
    pub hash: Hash256,
    /// Height of the block in the active chain.
    pub height: u64,
}
