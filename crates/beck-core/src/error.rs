//! Error types for the Beck core layer.
use thiserror::Error;

/// Failures while decoding the contractual wire formats (varints, serialized
/// trees, index rows).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input at byte {0}")] UnexpectedEof(usize),
    #[error("varint does not fit in u64")] VarintOverflow,
    #[error("varint is not minimally encoded")] NonCanonicalVarint,
    #[error("{0} trailing bytes after payload")] TrailingBytes(usize),
    #[error("length {len} exceeds remaining input {remaining}")] LengthOutOfBounds { len: u64, remaining: usize },
    #[error("value {0} out of range")] ValueOutOfRange(u64),
    #[error("malformed tree: {0}")] MalformedTree(String),
}
