//! Transport actor commands and errors.
//!
//! - `TransportCommand`: requests sent from a `TransportHandle` to the actor
//! - `TransportError`: failures a caller can observe
//!
//! Closure is not a command: it is signalled through the shared
//! cancellation token so it works even when the command queue is full.

use bridge_protocol::RemoteError;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

// ============================================================================
// Transport Commands
// ============================================================================

/// Commands sent to the transport actor.
#[derive(Debug)]
pub enum TransportCommand {
    /// Send a request and wait for its correlated response.
    ///
    /// # Errors
    /// - `TransportError::Timeout` if no response arrives before the deadline
    /// - `TransportError::Remote` if the peer answers with an error
    /// - `TransportError::Closed` if the socket closes first
    Call {
        method: String,
        params: Value,
        respond_to: oneshot::Sender<Result<Value, TransportError>>,
    },

    /// Report the number of calls awaiting a response.
    PendingCount { respond_to: oneshot::Sender<usize> },
}

// ============================================================================
// Transport Errors
// ============================================================================

/// Errors that can occur on the control connection.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// WebSocket handshake failed
    #[error("failed to connect: {0}")]
    Connect(String),

    /// No response before the call deadline
    #[error("{method} timed out")]
    Timeout { method: String },

    /// Peer answered with an error payload
    #[error("{method} failed: {error}")]
    Remote { method: String, error: RemoteError },

    /// Connection is closed; the call was never answered
    #[error("connection closed")]
    Closed,

    /// Request could not be encoded
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Returns true if the connection is gone and must be re-established.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::Timeout {
            method: "Runtime.evaluate".to_string(),
        };
        assert_eq!(err.to_string(), "Runtime.evaluate timed out");

        let err = TransportError::Remote {
            method: "Runtime.enable".to_string(),
            error: RemoteError {
                code: -32601,
                message: "method not found".to_string(),
                data: None,
            },
        };
        assert_eq!(
            err.to_string(),
            "Runtime.enable failed: method not found (code -32601)"
        );
    }

    #[test]
    fn test_only_closed_is_terminal() {
        assert!(TransportError::Closed.is_closed());
        assert!(!TransportError::Connect("refused".to_string()).is_closed());
        assert!(!TransportError::Timeout {
            method: "x".to_string()
        }
        .is_closed());
    }
}
