//! Error types for index encoding.

/// Errors that can occur while decoding or encoding an index.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input ended in the middle of a field.
    #[error("Unexpected end of input at offset {0}")]
    UnexpectedEof(usize),

    /// Opaque data padding contained non-zero bytes.
    #[error("Non-zero padding at offset {0}")]
    InvalidPadding(usize),

    /// Input contained bytes after the encoded index.
    #[error("{0} trailing bytes after encoded index")]
    TrailingBytes(usize),

    /// The trie envelope carries a version we cannot read.
    #[error("Unsupported trie index version: {0}")]
    UnsupportedVersion(u32),

    /// Trie nodes are nested deeper than any valid key allows.
    #[error("Trie nesting exceeds {0} levels")]
    TooDeep(usize),

    /// A decoded bitmap whose bounds disagree with its bytes.
    #[error("Inconsistent bitmap: {0}")]
    InvalidBitmap(&'static str),

    /// Checkpoint positions start at 1.
    #[error("Bitmap positions start at 1, got 0")]
    ZeroPosition,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
