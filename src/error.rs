//! Error types for storage operations.

use thiserror::Error;

/// Errors returned by the storage engine.
///
/// A cache miss is not an error: lookups return `None` for absent, expired,
/// and integrity-failed entries alike.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The backend could not map, attach, or lay out the shared region.
    ///
    /// Fatal when returned from startup.
    #[error("shared memory allocation failed: {reason}")]
    Allocation {
        /// What the backend was doing when it failed.
        reason: String,
        /// Underlying OS error, when there is one.
        #[source]
        source: Option<std::io::Error>,
    },

    /// The key is empty or longer than the inline key capacity (48 bytes).
    #[error("invalid key (must be 1..=48 bytes)")]
    InvalidKey,

    /// The value exceeds the per-entry limit or the capacity of its segment.
    #[error("value too large")]
    ValueTooLarge,

    /// An add-only update found a live entry for the key.
    #[error("key already exists")]
    AlreadyExists,

    /// The configuration is unreadable or inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StorageError {
    pub(crate) fn allocation(reason: impl Into<String>) -> Self {
        Self::Allocation {
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn os(reason: impl Into<String>, source: std::io::Error) -> Self {
        Self::Allocation {
            reason: reason.into(),
            source: Some(source),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
