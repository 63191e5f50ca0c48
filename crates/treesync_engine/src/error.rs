//! Error types for the sync engine.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the connection should be retried.
        retryable: bool,
    },

    /// Inbound frame could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] treesync_protocol::ProtocolError),

    /// Path or snapshot error.
    #[error("core error: {0}")]
    Core(#[from] treesync_core::CoreError),

    /// Server rejected the request.
    #[error("server rejected request: {status}")]
    ServerRejected {
        /// Server status code.
        status: String,
        /// Optional server message.
        message: Option<String>,
    },

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// The subscription handle is not registered.
    #[error("unknown subscription handle {0}")]
    UnknownHandle(u64),

    /// Too many writes are waiting for acknowledgement.
    #[error("too many pending requests (limit {limit})")]
    TooManyPendingRequests {
        /// Configured limit.
        limit: usize,
    },

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,

    /// The session was torn down before the operation completed.
    #[error("session closed")]
    Cancelled,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a server rejection.
    pub fn rejected(status: impl Into<String>, message: Option<String>) -> Self {
        Self::ServerRejected {
            status: status.into(),
            message,
        }
    }

    /// Returns true if a reconnect should follow this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::NotConnected => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection reset").is_retryable());
        assert!(!SyncError::transport_fatal("bad certificate").is_retryable());
        assert!(SyncError::NotConnected.is_retryable());
        assert!(!SyncError::rejected("permission_denied", None).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn error_display() {
        assert_eq!(SyncError::NotConnected.to_string(), "not connected to server");

        let err = SyncError::InvalidStateTransition {
            from: "Connected".into(),
            to: "Connecting".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid state transition from Connected to Connecting"
        );
        assert!(SyncError::TooManyPendingRequests { limit: 8 }
            .to_string()
            .contains('8'));
    }
}
