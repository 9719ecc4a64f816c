//! Error types for control-plane store access.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by a [`TopologyStore`](crate::TopologyStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot currently serve requests.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Reading the backing storage failed.
    #[error("io error on {path}: {source}")]
    Io {
        /// Path that was being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A stored record could not be decoded.
    #[error("cannot decode record {path}: {reason}")]
    Decode {
        /// Path of the offending record.
        path: PathBuf,
        /// Decoder message.
        reason: String,
    },

    /// A record or namespace name is not usable as a key.
    #[error("invalid name: {0:?}")]
    InvalidName(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
