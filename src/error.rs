//! Error types for tilestore
//!
//! Provides a unified error type for all operations.
//!
//! Note that a read buffer that is too small is *not* an error: it is reported
//! as [`ReadStatus::Overflow`](crate::ReadStatus) and the read is resumable.

use thiserror::Error;

/// Result type alias using TileError
pub type Result<T> = std::result::Result<T, TileError>;

/// Unified error type for tilestore operations
#[derive(Debug, Error)]
pub enum TileError {
    // -------------------------------------------------------------------------
    // Validation Errors
    // -------------------------------------------------------------------------
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Buffer mismatch: {0}")]
    BufferMismatch(String),

    #[error("Empty buffer: {0}")]
    EmptyBuffer(String),

    // -------------------------------------------------------------------------
    // Object Errors
    // -------------------------------------------------------------------------
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    // -------------------------------------------------------------------------
    // Handle Errors
    // -------------------------------------------------------------------------
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    #[error("Mode violation: {0}")]
    ModeViolation(String),

    #[error("Array already has an open writer: {0}")]
    WriterBusy(String),

    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TileError {
    /// Whether this error belongs to the storage-failure class (read, write,
    /// compress or decompress failed underneath the engine).
    pub fn is_io_failure(&self) -> bool {
        matches!(
            self,
            TileError::Io(_)
                | TileError::Codec(_)
                | TileError::Corruption(_)
                | TileError::Serialization(_)
        )
    }
}

impl From<bincode::Error> for TileError {
    fn from(e: bincode::Error) -> Self {
        TileError::Serialization(e.to_string())
    }
}
