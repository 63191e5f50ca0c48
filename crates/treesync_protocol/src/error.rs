//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding wire frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame is not valid JSON or not a JSON object.
    #[error("malformed frame: {0}")]
    Codec(#[from] treesync_codec::CodecError),

    /// A required field is absent or has the wrong type.
    #[error("missing or invalid field {field:?}")]
    MissingField {
        /// Field name.
        field: &'static str,
    },

    /// A discriminator field has a value this client does not know.
    #[error("unknown {field} code {code:?}")]
    UnknownCode {
        /// Field name (`t` or `a`).
        field: &'static str,
        /// The value found.
        code: String,
    },

    /// The frame carries a path that does not parse.
    #[error("invalid path in frame: {0}")]
    Path(#[from] treesync_core::CoreError),
}

impl ProtocolError {
    /// Creates a missing field error.
    pub fn missing(field: &'static str) -> Self {
        Self::MissingField { field }
    }

    /// Creates an unknown code error.
    pub fn unknown_code(field: &'static str, code: impl Into<String>) -> Self {
        Self::UnknownCode {
            field,
            code: code.into(),
        }
    }
}
