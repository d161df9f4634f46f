//! Error types for silo media and file acquisition.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while acquiring or accessing silo media.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The storage path could not be used.
    #[error("({path}): {message}")]
    Path {
        /// The offending path.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// A size specification could not be interpreted.
    #[error("size \"{spec}\": {message}")]
    InvalidSize {
        /// The specification as given.
        spec: String,
        /// Why it was rejected.
        message: String,
    },

    /// A flush range fell outside the medium.
    #[error("range out of bounds: offset {offset}, len {len}, size {size}")]
    OutOfBounds {
        /// Start of the range.
        offset: u64,
        /// Length of the range.
        len: u64,
        /// Size of the medium.
        size: u64,
    },

    /// Another process holds the silo file.
    #[error("silo file is locked by another process: {0}")]
    Locked(PathBuf),
}

impl StorageError {
    /// Creates a path error.
    pub fn path(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Path {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid size error.
    pub fn invalid_size(spec: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidSize {
            spec: spec.into(),
            message: message.into(),
        }
    }
}
