//! Varint codec for the on-disk wire formats.
//!
//! Serialized trees and index rows use LEB128 varints: seven value bits per
//! byte, least-significant group first, high bit set on every byte except the
//! last. All multi-byte quantities are therefore little-endian by
//! construction. Decoding rejects non-minimal encodings so that every value
//! has exactly one byte representation.

use crate::error::CodecError;
use crate::types::Hash256;

/// Longest possible encoding of a `u64` (ceil(64 / 7) bytes).
pub const MAX_VARINT_LEN: usize = 10;

/// Append the varint encoding of `value` to `out`.
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Number of bytes [`write_varint`] produces for `value`.
pub fn varint_len(value: u64) -> usize {
    // 64 - leading_zeros is the bit width; zero still takes one byte.
    let bits = (64 - u64::leading_zeros(value | 1)) as usize;
    bits.div_ceil(7)
}

/// Bounds-checked cursor over an input buffer.
///
/// Every read advances the cursor; [`finish`](Self::finish) asserts the whole
/// buffer was consumed, which decoders of fixed-layout payloads rely on.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Current cursor position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Decode one varint.
    pub fn read_varint(&mut self) -> Result<u64, CodecError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or(CodecError::UnexpectedEof(self.pos))?;
            self.pos += 1;

            let group = u64::from(byte & 0x7f);
            // The tenth byte may only carry the single remaining bit.
            if shift == 63 && group > 1 {
                return Err(CodecError::VarintOverflow);
            }
            value |= group << shift;

            if byte & 0x80 == 0 {
                if shift > 0 && byte == 0 {
                    return Err(CodecError::NonCanonicalVarint);
                }
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(CodecError::VarintOverflow);
            }
        }
    }

    /// Read a 32-byte hash.
    pub fn read_hash(&mut self) -> Result<Hash256, CodecError> {
        let end = self
            .pos
            .checked_add(32)
            .filter(|&end| end <= self.buf.len())
            .ok_or(CodecError::UnexpectedEof(self.buf.len()))?;
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(Hash256(bytes))
    }

    /// Read a varint and check it can index `32 * count` further bytes.
    ///
    /// Used for hash-array lengths so that a corrupt count fails fast instead
    /// of attempting a huge allocation.
    pub fn read_count(&mut self) -> Result<usize, CodecError> {
        let count = self.read_varint()?;
        let needed = count.checked_mul(32).ok_or(CodecError::LengthOutOfBounds {
            len: count,
            remaining: self.remaining(),
        })?;
        if needed > self.remaining() as u64 {
            return Err(CodecError::LengthOutOfBounds {
                len: count,
                remaining: self.remaining(),
            });
        }
        Ok(count as usize)
    }

    /// Assert the buffer is fully consumed.
    pub fn finish(self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}
