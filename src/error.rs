//! Error types for StashKV
//!
//! Provides a unified error type for all operations.
//!
//! A missing key is never an error: lookups return `Ok(None)`.
//! An unavailable backend is not an error either; it simply drops
//! out of the active backend set.

use thiserror::Error;

use crate::backend::BackendKind;

/// Result type alias using StashError
pub type Result<T> = std::result::Result<T, StashError>;

/// Unified error type for StashKV operations
#[derive(Debug, Error)]
pub enum StashError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Backend {0} is unavailable")]
    BackendUnavailable(BackendKind),

    #[error("Backend {0} did not answer in time")]
    BackendTimeout(BackendKind),

    #[error("Quota exceeded on {backend}: {needed} bytes needed, {quota} bytes allowed")]
    QuotaExceeded {
        backend: BackendKind,
        needed: u64,
        quota: u64,
    },

    #[error("No storage backend available")]
    NoBackendAvailable,

    // -------------------------------------------------------------------------
    // Validation Errors
    // -------------------------------------------------------------------------
    #[error("Validation error: {0}")]
    Validation(String),

    // -------------------------------------------------------------------------
    // Codec Errors
    // -------------------------------------------------------------------------
    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Migration Errors
    // -------------------------------------------------------------------------
    #[error("Migration {version} failed: {reason}")]
    Migration { version: String, reason: String },

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StashError {
    /// True for bad keys, bad bundles and other caller mistakes
    pub fn is_validation(&self) -> bool {
        matches!(self, StashError::Validation(_))
    }

    /// True for failures of a single backend medium
    ///
    /// These are the errors `get` swallows while falling through to
    /// the next backend.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            StashError::Io(_)
                | StashError::Storage(_)
                | StashError::BackendUnavailable(_)
                | StashError::BackendTimeout(_)
                | StashError::QuotaExceeded { .. }
        )
    }
}

impl From<serde_json::Error> for StashError {
    fn from(e: serde_json::Error) -> Self {
        StashError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for StashError {
    fn from(e: bincode::Error) -> Self {
        StashError::Serialization(e.to_string())
    }
}

impl From<base64::DecodeError> for StashError {
    fn from(e: base64::DecodeError) -> Self {
        StashError::Serialization(format!("invalid base64: {}", e))
    }
}
