//! Error types for lsmdao
//!
//! Provides a unified error type for all operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using DaoError
pub type Result<T> = std::result::Result<T, DaoError>;

/// Unified error type for lsmdao operations
#[derive(Debug, Error)]
pub enum DaoError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Corrupt segment {}: {reason}", path.display())]
    CorruptSegment { path: PathBuf, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    // -------------------------------------------------------------------------
    // Engine Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Engine is closed")]
    ClosedEngine,

    #[error("Engine is read-only after a background failure: {0}")]
    ReadOnly(String),

    // -------------------------------------------------------------------------
    // Query Errors
    // -------------------------------------------------------------------------
    #[error("Invalid range: lower bound is greater than upper bound")]
    InvalidRange,

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DaoError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        DaoError::CorruptSegment {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
