//! Error types for superpack format operations

use thiserror::Error;

/// Format operation result type
pub type FormatResult<T> = Result<T, FormatError>;

/// Errors raised while decoding or building superpack structures
#[derive(Debug, Error)]
pub enum FormatError {
    /// Marker mismatch or declared sizes that do not fit the buffer
    #[error("Corrupt format: {0}")]
    CorruptFormat(String),

    /// CRC32 of a block does not match the value declared for it
    #[error("CRC32 mismatch in {what}: expected 0x{expected:08x}, got 0x{actual:08x}")]
    CrcMismatch {
        /// Which block failed verification
        what: &'static str,
        /// Declared CRC32
        expected: u32,
        /// Computed CRC32
        actual: u32,
    },

    /// Name blob and file table disagree on the number of files
    #[error("File table has {entries} entries but names block has {names} names")]
    NameCountMismatch {
        /// Number of names found in the decompressed blob
        names: usize,
        /// Number of entries in the file table
        entries: usize,
    },

    /// Compressor or decompressor failure
    #[error("Compression error: {0}")]
    Compression(String),

    /// Unknown compression type value on the wire
    #[error("Unsupported compression type: {0}")]
    UnsupportedCompression(u32),

    /// Pack metadata failed structural validation
    #[error("Pack metadata corrupt: {0}")]
    MetaCorrupt(String),

    /// Dependency list contains a token that is not a valid pack index
    #[error("Bad dependency index '{token}' in pack '{pack}'")]
    BadDependencyIndex {
        /// Pack whose dependency list is broken
        pack: String,
        /// Offending token
        token: String,
    },

    /// Pack name or index is unknown to the metadata
    #[error("Pack not found: {0}")]
    PackNotFound(String),

    /// Binary read/write error
    #[error("Binary format error: {0}")]
    BinRw(#[from] binrw::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FormatError {
    /// Check if this error comes from integrity verification
    ///
    /// Validation errors mean the bytes themselves are bad and should be
    /// fetched again, as opposed to a programming or data-model error.
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::CorruptFormat(_) | Self::CrcMismatch { .. } | Self::NameCountMismatch { .. }
        )
    }

    /// Check if this error describes a broken pack metadata model
    pub fn is_meta_error(&self) -> bool {
        matches!(
            self,
            Self::MetaCorrupt(_) | Self::BadDependencyIndex { .. } | Self::PackNotFound(_)
        )
    }
}
