//! Error types for Tessera
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using TesseraError
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Unified error type for Tessera operations
#[derive(Debug, Error)]
pub enum TesseraError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Database State Errors
    // -------------------------------------------------------------------------
    /// Generic failure that is not an I/O error (revision misuse, exhaustion).
    #[error("Database error: {0}")]
    Database(String),

    /// A base file or metafile is missing at the requested path.
    #[error("Cannot open database: {0}")]
    DatabaseOpening(String),

    /// On-disk structures parse but are inconsistent, or fail their checksum.
    #[error("Database corrupt: {0}")]
    DatabaseCorrupt(String),

    /// The on-disk format version is not the one this engine writes.
    #[error("Unsupported database version: {0}")]
    DatabaseVersion(String),

    /// Another writer already holds the database lock.
    #[error("Database locked: {0}")]
    DatabaseLock(String),

    /// The revision's base file is gone, or its blocks have been reused.
    #[error("Revision {revision} is not available")]
    RevisionNotAvailable { revision: u32 },

    // -------------------------------------------------------------------------
    // Item Errors
    // -------------------------------------------------------------------------
    #[error("Key too long: {len} bytes (max {max})")]
    KeyTooLong { len: usize, max: usize },

    #[error("Tag too long: {len} bytes (max {max})")]
    TagTooLong { len: usize, max: usize },

    // -------------------------------------------------------------------------
    // Usage Errors
    // -------------------------------------------------------------------------
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for TesseraError {
    fn from(err: bincode::Error) -> Self {
        TesseraError::Serialization(err.to_string())
    }
}
