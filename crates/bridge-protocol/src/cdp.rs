//! Remote debug protocol frames.
//!
//! Outbound requests are `{id, method, params}`. Inbound frames are either
//! a response correlated by `id` (`result` or `error`) or an unsolicited
//! event (`method` + `params`, no `id`). Only the handful of methods the
//! bridge uses are modelled here.

use std::fmt;

use bridge_core::{ContextEvent, ContextId, ExecutionContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Correlation id linking a request to its response.
pub type CallId = u64;

/// Method and event names used by the bridge.
pub mod methods {
    pub const RUNTIME_ENABLE: &str = "Runtime.enable";
    pub const RUNTIME_EVALUATE: &str = "Runtime.evaluate";
    pub const CONTEXT_CREATED: &str = "Runtime.executionContextCreated";
    pub const CONTEXT_DESTROYED: &str = "Runtime.executionContextDestroyed";
    pub const CONTEXTS_CLEARED: &str = "Runtime.executionContextsCleared";
}

// ============================================================================
// Outbound
// ============================================================================

/// A request written to the control socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdpRequest {
    pub id: CallId,
    pub method: String,
    pub params: Value,
}

impl CdpRequest {
    /// Creates a request.
    pub fn new(id: CallId, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    /// Serializes the request into a text frame.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Parameters for `Runtime.evaluate`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateParams {
    pub expression: String,
    pub return_by_value: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub await_promise: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<ContextId>,
}

impl EvaluateParams {
    /// Evaluates `expression` in `context_id`, returning the value by value.
    pub fn in_context(expression: impl Into<String>, context_id: ContextId) -> Self {
        Self {
            expression: expression.into(),
            return_by_value: true,
            await_promise: false,
            context_id: Some(context_id),
        }
    }

    /// Also waits for a returned promise to settle.
    pub fn awaiting(mut self) -> Self {
        self.await_promise = true;
        self
    }

    /// Converts to the params value for a request.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// Structured error payload returned by the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)?;
        if let Some(data) = &self.data {
            write!(f, ": {data}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}

#[derive(Debug, Deserialize)]
struct RawFrame {
    id: Option<CallId>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Value,
    error: Option<RemoteError>,
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Response to the call with this id
    Response {
        id: CallId,
        outcome: Result<Value, RemoteError>,
    },

    /// Unsolicited event
    Event { method: String, params: Value },
}

impl InboundFrame {
    /// Parses and classifies a text frame.
    ///
    /// A frame carrying an `id` is always a response, even if it also has a
    /// `method`; only id-less frames are events.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawFrame = serde_json::from_str(text)?;

        match (raw.id, raw.method) {
            (Some(id), _) => {
                let outcome = match raw.error {
                    Some(error) => Err(error),
                    None => Ok(raw.result),
                };
                Ok(Self::Response { id, outcome })
            }
            (None, Some(method)) => Ok(Self::Event {
                method,
                params: raw.params,
            }),
            (None, None) => Err(ProtocolError::UnrecognizedFrame),
        }
    }
}

// ============================================================================
// Context Lifecycle Events
// ============================================================================

#[derive(Deserialize)]
struct ContextCreatedParams {
    context: ExecutionContext,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContextDestroyedParams {
    execution_context_id: ContextId,
}

/// Interprets an event as a context lifecycle change.
///
/// Returns `Ok(None)` for events that are not about contexts.
pub fn parse_context_event(
    method: &str,
    params: &Value,
) -> Result<Option<ContextEvent>, ProtocolError> {
    let invalid = |e: serde_json::Error| ProtocolError::InvalidEvent {
        method: method.to_string(),
        reason: e.to_string(),
    };

    match method {
        methods::CONTEXT_CREATED => {
            let p: ContextCreatedParams =
                serde_json::from_value(params.clone()).map_err(invalid)?;
            Ok(Some(ContextEvent::Created(p.context)))
        }
        methods::CONTEXT_DESTROYED => {
            let p: ContextDestroyedParams =
                serde_json::from_value(params.clone()).map_err(invalid)?;
            Ok(Some(ContextEvent::Destroyed(p.execution_context_id)))
        }
        methods::CONTEXTS_CLEARED => Ok(Some(ContextEvent::Cleared)),
        _ => Ok(None),
    }
}

// ============================================================================
// Evaluate Results
// ============================================================================

/// What a `Runtime.evaluate` result carried.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluateOutcome {
    /// The expression produced a value
    Value(Value),

    /// The expression threw
    Exception(String),

    /// The expression completed without a usable value
    NoValue,
}

impl EvaluateOutcome {
    /// Classifies the `result` member of an evaluate response.
    pub fn from_result(result: &Value) -> Self {
        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("exception");
            let description = details
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(Value::as_str);
            return match description {
                Some(d) => Self::Exception(format!("{text}: {d}")),
                None => Self::Exception(text.to_string()),
            };
        }

        match result.get("result").and_then(|r| r.get("value")) {
            Some(Value::Null) | None => Self::NoValue,
            Some(value) => Self::Value(value.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let req = CdpRequest::new(3, methods::RUNTIME_ENABLE, json!({}));
        let parsed: Value = serde_json::from_str(&req.to_json().unwrap()).unwrap();
        assert_eq!(parsed, json!({"id": 3, "method": "Runtime.enable", "params": {}}));
    }

    #[test]
    fn test_evaluate_params_shape() {
        let params = EvaluateParams::in_context("1 + 1", 4).awaiting().to_value();
        assert_eq!(
            params,
            json!({
                "expression": "1 + 1",
                "returnByValue": true,
                "awaitPromise": true,
                "contextId": 4
            })
        );

        let params = EvaluateParams::in_context("x", 1).to_value();
        assert!(params.get("awaitPromise").is_none());
    }

    #[test]
    fn test_parse_success_response() {
        let frame = InboundFrame::parse(r#"{"id": 5, "result": {"ok": true}}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Response {
                id: 5,
                outcome: Ok(json!({"ok": true}))
            }
        );
    }

    #[test]
    fn test_parse_error_response() {
        let frame =
            InboundFrame::parse(r#"{"id": 9, "error": {"code": -32000, "message": "nope"}}"#)
                .unwrap();
        match frame {
            InboundFrame::Response { id, outcome: Err(e) } => {
                assert_eq!(id, 9);
                assert_eq!(e.code, -32000);
                assert_eq!(e.message, "nope");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_parse_event() {
        let frame = InboundFrame::parse(
            r#"{"method": "Runtime.executionContextsCleared", "params": {}}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            InboundFrame::Event {
                method: methods::CONTEXTS_CLEARED.to_string(),
                params: json!({})
            }
        );
    }

    #[test]
    fn test_parse_unrecognized_frame() {
        assert!(matches!(
            InboundFrame::parse(r#"{"params": {}}"#),
            Err(ProtocolError::UnrecognizedFrame)
        ));
        assert!(matches!(
            InboundFrame::parse("not json"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_context_created_event() {
        let params = json!({"context": {"id": 7, "name": "", "origin": "vscode-file://vscode-app", "auxData": {}}});
        let event = parse_context_event(methods::CONTEXT_CREATED, &params).unwrap();
        match event {
            Some(ContextEvent::Created(ctx)) => assert_eq!(ctx.id, 7),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_context_destroyed_event() {
        let params = json!({"executionContextId": 7});
        let event = parse_context_event(methods::CONTEXT_DESTROYED, &params).unwrap();
        assert_eq!(event, Some(ContextEvent::Destroyed(7)));
    }

    #[test]
    fn test_context_event_bad_params() {
        let err = parse_context_event(methods::CONTEXT_DESTROYED, &json!({})).unwrap_err();
        assert!(err.to_string().contains(methods::CONTEXT_DESTROYED));
    }

    #[test]
    fn test_unrelated_event_is_ignored() {
        let event = parse_context_event("Page.loadEventFired", &json!({})).unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn test_evaluate_outcome_value() {
        let result = json!({"result": {"type": "object", "value": {"ok": true}}});
        assert_eq!(
            EvaluateOutcome::from_result(&result),
            EvaluateOutcome::Value(json!({"ok": true}))
        );
    }

    #[test]
    fn test_evaluate_outcome_exception() {
        let result = json!({
            "result": {"type": "object"},
            "exceptionDetails": {"text": "Uncaught", "exception": {"description": "ReferenceError: x"}}
        });
        assert_eq!(
            EvaluateOutcome::from_result(&result),
            EvaluateOutcome::Exception("Uncaught: ReferenceError: x".to_string())
        );
    }

    #[test]
    fn test_evaluate_outcome_no_value() {
        assert_eq!(
            EvaluateOutcome::from_result(&json!({"result": {"type": "undefined"}})),
            EvaluateOutcome::NoValue
        );
        assert_eq!(
            EvaluateOutcome::from_result(&json!({"result": {"type": "object", "value": null}})),
            EvaluateOutcome::NoValue
        );
    }
}
