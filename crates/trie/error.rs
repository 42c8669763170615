use thiserror::Error;

use crate::nibbles::Nibbles;

#[derive(Debug, Error)]
pub enum TrieError {
    #[error(transparent)]
    Decode(#[from] NodeDecodeError),
    #[error("Inconsistent internal tree structure")]
    InconsistentTree,
    #[error("Trie build error: {0}")]
    Build(String),
    #[error("Lock Error: Panicked when trying to acquire a lock")]
    LockError,
    #[error("Database error: {0}")]
    DbError(anyhow::Error),
    #[error("State version mismatch")]
    StateVersionMismatch,

    #[error("Inconsistent internal tree structure: missing node for path {0:?}")]
    MissingNode(Nibbles),
    #[error("Inconsistent internal tree structure: missing preimage for hashed storage value")]
    MissingValuePreimage,
}

/// Failure while decoding a node from its wire encoding.
/// Never recovered silently, always aborts the triggering operation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeDecodeError {
    #[error("unknown node header byte: {0:#010b}")]
    UnknownHeader(u8),
    #[error("partial key length overflow")]
    PartialKeyLenOverflow,
    #[error("unexpected end of node encoding")]
    UnexpectedEof,
    #[error("nonzero padding nibble in odd-length partial key")]
    NonZeroPadding,
    #[error("branch node with empty children bitmap")]
    EmptyChildrenBitmap,
    #[error("child merkle value of {0} bytes exceeds the 32 byte maximum")]
    ChildTooLong(usize),
    #[error("invalid compact length prefix")]
    InvalidLengthPrefix,
    #[error("trailing bytes after node encoding")]
    TrailingBytes,
}
