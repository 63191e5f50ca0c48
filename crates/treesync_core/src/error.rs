//! Error types for treesync core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations.
///
/// Only input errors are represented here. A put or merge with a valid
/// path cannot fail.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Path text or segment is malformed.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath {
        /// The offending input.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Path has more segments than allowed.
    #[error("path depth {depth} exceeds maximum of {max}")]
    PathTooDeep {
        /// Number of segments in the input.
        depth: usize,
        /// Maximum allowed depth.
        max: usize,
    },

    /// Snapshot encoding or decoding failed.
    #[error("snapshot codec error: {0}")]
    Codec(#[from] treesync_codec::CodecError),
}

impl CoreError {
    /// Creates an invalid path error.
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
