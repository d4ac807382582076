//! uibridge protocol - wire formats
//!
//! This crate provides the message types spoken on both sides of the
//! bridge:
//! - `cdp` - JSON frames exchanged with the remote debug endpoint
//! - `target` - debug target descriptors returned by `/json/list`
//! - `message` - notifications and replies sent to subscribers, and the
//!   requests subscribers may send back

pub mod cdp;
pub mod error;
pub mod message;
pub mod target;

pub use cdp::{
    parse_context_event, CallId, CdpRequest, EvaluateOutcome, EvaluateParams, InboundFrame,
    RemoteError,
};
pub use error::ProtocolError;
pub use message::{BridgeMessage, BridgeStatus, ClientRequest, Notification};
pub use target::TargetInfo;
