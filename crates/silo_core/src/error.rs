//! Error types for silo operations.

use std::io;
use thiserror::Error;

/// Result type for silo operations.
pub type SiloResult<T> = Result<T, SiloError>;

/// Errors that can occur in silo operations.
///
/// Internal consistency violations (out-of-bounds offsets, misaligned
/// cursors, loads from the wrong thread) are not represented here: they
/// are assertion failures, because continuing would corrupt the store.
#[derive(Debug, Error)]
pub enum SiloError {
    /// Storage medium error.
    #[error("storage error: {0}")]
    Storage(#[from] silo_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The silo configuration is unusable.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the problem.
        message: String,
    },

    /// A field of the ident block does not match what was expected.
    #[error("ident mismatch on {field}: expected {expected}, found {found}")]
    IdentMismatch {
        /// Name of the mismatching field.
        field: &'static str,
        /// Value required by this build or configuration.
        expected: String,
        /// Value found on the medium.
        found: String,
    },

    /// The silo is corrupt beyond recovery.
    #[error("silo corrupt: {message}")]
    Corrupt {
        /// Description of the corruption.
        message: String,
    },

    /// No space is left and nothing can be evicted.
    #[error("silo full: cannot place {requested} bytes")]
    Capacity {
        /// Bytes the caller tried to store.
        requested: u64,
    },

    /// A table image does not fit its region.
    #[error("{table} table full: image of {requested} bytes exceeds {capacity}")]
    TableFull {
        /// Name of the table.
        table: &'static str,
        /// Bytes of the rejected image.
        requested: u64,
        /// Bytes a copy can hold.
        capacity: u64,
    },

    /// The silo has been shut down.
    #[error("silo is closed")]
    Closed,
}

impl SiloError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    /// Creates an ident mismatch error.
    pub fn ident_mismatch(
        field: &'static str,
        expected: impl ToString,
        found: impl ToString,
    ) -> Self {
        Self::IdentMismatch {
            field,
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    /// Returns whether the error is an operator-visible misconfiguration.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::IdentMismatch { .. })
    }
}
