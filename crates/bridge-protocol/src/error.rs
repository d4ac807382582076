//! Protocol errors.

use thiserror::Error;

/// Errors raised while encoding or decoding wire frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame was not valid JSON or did not match the expected shape
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame carried neither a call id nor an event method
    #[error("frame has neither an id nor a method")]
    UnrecognizedFrame,

    /// A known event arrived with unusable params
    #[error("invalid params for {method}: {reason}")]
    InvalidEvent { method: String, reason: String },
}
