//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A captured payload was missing a required field
    #[error("Captured state is missing {field}")]
    MissingField { field: String },

    /// The remote capture reported its own failure
    #[error("Capture failed: {reason}")]
    CaptureFailed { reason: String },

    /// Parse error for incoming data
    #[error("Failed to parse {field}: {reason}")]
    ParseError { field: String, reason: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
