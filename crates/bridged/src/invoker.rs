//! Remote actions.
//!
//! An action is an expression evaluated in each execution context in turn
//! until one returns a value. Contexts that throw or return nothing are
//! skipped.

use bridge_protocol::{EvaluateOutcome, EvaluateParams};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::transport::{TransportError, TransportHandle};

/// Reason code reported when no context accepted an action.
pub const NO_CONTEXT: &str = "no_context";

/// Errors that can occur while running an action.
#[derive(Debug, Clone, Error)]
pub enum InvokeError {
    /// No context produced a value
    #[error("no context accepted the action{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    NoContext { reason: Option<String> },

    /// There is no live connection
    #[error("not connected")]
    NotConnected,

    /// The connection closed mid-action
    #[error("connection closed")]
    Closed,
}

impl InvokeError {
    /// Short reason sent back to the requesting subscriber.
    pub fn reason(&self) -> String {
        match self {
            Self::NoContext { reason: Some(r) } => r.clone(),
            Self::NoContext { reason: None } => NO_CONTEXT.to_string(),
            Self::NotConnected => "not_connected".to_string(),
            Self::Closed => "closed".to_string(),
        }
    }
}

/// Runs `expression` in each context until one returns a value.
///
/// # Errors
///
/// - `InvokeError::NoContext` with the last failure when no context
///   produced a value (or there were no contexts)
/// - `InvokeError::Closed` if the connection closed; iteration stops
pub async fn invoke(transport: &TransportHandle, expression: &str) -> Result<Value, InvokeError> {
    let mut last_reason = None;

    for ctx in transport.contexts() {
        let params = EvaluateParams::in_context(expression, ctx.id).awaiting();

        match transport.evaluate(params).await {
            Ok(EvaluateOutcome::Value(value)) => {
                debug!(context = %ctx, "Action accepted");
                return Ok(value);
            }
            Ok(EvaluateOutcome::Exception(text)) => last_reason = Some(text),
            Ok(EvaluateOutcome::NoValue) => last_reason = Some("no value returned".to_string()),
            Err(TransportError::Closed) => return Err(InvokeError::Closed),
            Err(e) => last_reason = Some(e.to_string()),
        }
    }

    Err(InvokeError::NoContext {
        reason: last_reason,
    })
}
