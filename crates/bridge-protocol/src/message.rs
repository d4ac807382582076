//! Subscriber-facing message types.
//!
//! Broadcasts carry only coarse state: a status pair and a "content
//! changed" ping. Subscribers re-fetch the snapshot themselves with a
//! `fetch_snapshot` request. Every outgoing message is wrapped in a
//! [`Notification`] that adds a timestamp.

use bridge_core::Snapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Coarse bridge status shown to subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStatus {
    /// Whether the local companion peer answers on its probe port
    pub peer_reachable: bool,

    /// Whether the control socket to the remote app is open
    pub connected: bool,
}

/// Messages sent from the bridge to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    /// Peer reachability or connection state changed
    StatusUpdate {
        #[serde(rename = "apiConnected")]
        peer_reachable: bool,
        #[serde(rename = "cdpConnected")]
        connected: bool,
    },

    /// Remote content changed; fetch the snapshot to see it
    SnapshotUpdate,

    /// Reply to `fetch_snapshot`
    Snapshot {
        snapshot: Option<Box<Snapshot>>,
    },

    /// Reply to `invoke`
    ActionResult {
        request_id: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Reply to `ping`
    Pong { seq: u64 },

    /// Request could not be handled
    Error { message: String },
}

impl BridgeMessage {
    /// Creates a status update from a status pair.
    pub fn status(status: BridgeStatus) -> Self {
        Self::StatusUpdate {
            peer_reachable: status.peer_reachable,
            connected: status.connected,
        }
    }

    /// Creates a snapshot reply.
    pub fn snapshot(snapshot: Option<&Snapshot>) -> Self {
        Self::Snapshot {
            snapshot: snapshot.map(|s| Box::new(s.clone())),
        }
    }

    /// Creates a successful action reply.
    pub fn action_ok(request_id: u64, value: Value) -> Self {
        Self::ActionResult {
            request_id,
            ok: true,
            value: Some(value),
            reason: None,
        }
    }

    /// Creates a failed action reply.
    pub fn action_failed(request_id: u64, reason: impl Into<String>) -> Self {
        Self::ActionResult {
            request_id,
            ok: false,
            value: None,
            reason: Some(reason.into()),
        }
    }

    /// Creates a pong reply.
    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    /// Creates an error reply.
    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }
}

/// A message stamped with its send time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(flatten)]
    pub message: BridgeMessage,

    pub timestamp: DateTime<Utc>,
}

impl Notification {
    /// Stamps a message with the current time.
    pub fn now(message: BridgeMessage) -> Self {
        Self {
            message,
            timestamp: Utc::now(),
        }
    }

    /// Serializes to a text frame.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a text frame.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Requests a subscriber may send to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Ask for the current snapshot
    FetchSnapshot,

    /// Run an expression in the remote app
    Invoke { request_id: u64, expression: String },

    /// Liveness check
    Ping { seq: u64 },
}

impl ClientRequest {
    /// Creates an invoke request.
    pub fn invoke(request_id: u64, expression: impl Into<String>) -> Self {
        Self::Invoke {
            request_id,
            expression: expression.into(),
        }
    }

    /// Serializes to a text frame.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a text frame.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_update_wire_shape() {
        let msg = Notification::now(BridgeMessage::status(BridgeStatus {
            peer_reachable: true,
            connected: false,
        }));
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "status_update");
        assert_eq!(value["apiConnected"], true);
        assert_eq!(value["cdpConnected"], false);
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_snapshot_update_has_no_body() {
        let msg = Notification::now(BridgeMessage::SnapshotUpdate);
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys.len(), 2);
        assert_eq!(value["type"], "snapshot_update");
    }

    #[test]
    fn test_notification_parses_back() {
        let msg = Notification::now(BridgeMessage::action_failed(4, "no_context"));
        let parsed = Notification::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed.message, msg.message);
    }

    #[test]
    fn test_client_request_parsing() {
        let req = ClientRequest::from_json(r#"{"type":"fetch_snapshot"}"#).unwrap();
        assert_eq!(req, ClientRequest::FetchSnapshot);

        let req =
            ClientRequest::from_json(r#"{"type":"invoke","request_id":2,"expression":"1"}"#)
                .unwrap();
        assert_eq!(req, ClientRequest::invoke(2, "1"));

        assert!(ClientRequest::from_json(r#"{"type":"shutdown"}"#).is_err());
    }

    #[test]
    fn test_action_ok_includes_value() {
        let value = serde_json::to_value(BridgeMessage::action_ok(1, json!({"ok": true}))).unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(value["value"]["ok"], true);
        assert!(value.get("reason").is_none());
    }
}
