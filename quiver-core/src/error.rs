//! Error types for Quiver

use thiserror::Error;

/// Result type alias for Quiver operations
pub type Result<T> = std::result::Result<T, QuiverError>;

/// Quiver error types
#[derive(Error, Debug)]
pub enum QuiverError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Allocator ran out of configured space
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    /// Tag rejected by the index
    #[error("Invalid tag, rejecting index: {0}")]
    InvalidTag(String),

    /// Query error
    #[error("Query error: {0}")]
    Query(String),

    /// Series not found
    #[error("Series not found: {0}")]
    SeriesNotFound(String),

    /// Compaction error
    #[error("Compaction error: {0}")]
    Compaction(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QuiverError {
    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            QuiverError::Corruption(_) | QuiverError::ChecksumMismatch { .. }
        )
    }

    /// Check if the allocator refused the request
    pub fn is_capacity(&self) -> bool {
        matches!(self, QuiverError::Capacity(_))
    }
}

impl From<bincode::Error> for QuiverError {
    fn from(e: bincode::Error) -> Self {
        QuiverError::InvalidFormat(e.to_string())
    }
}

impl From<serde_json::Error> for QuiverError {
    fn from(e: serde_json::Error) -> Self {
        QuiverError::InvalidFormat(e.to_string())
    }
}
