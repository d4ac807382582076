//! uibridge daemon - mirrors a remote app's UI to subscribers
//!
//! This crate provides the core infrastructure for the bridge daemon:
//! - `discovery` - finds the app's control socket on its debug ports
//! - `transport` - control connection actor (calls, deadlines, contexts)
//! - `supervisor` - keeps one connection alive and drives the poller
//! - `poller` - periodic capture and change detection
//! - `invoker` - runs remote actions
//! - `server` - subscriber WebSocket server and broadcast fan-out
//! - `pidfile` - marks the running daemon for `stop` and `status`
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         uibridged daemon                         │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  discover  ┌────────────┐                      │
//! │  │  Supervisor  │───────────▶│ Discoverer │──▶ GET /json/list    │
//! │  │ (state owner)│            └────────────┘                      │
//! │  └──────┬───────┘                                                │
//! │         │ open / closed                                          │
//! │         ▼                                                        │
//! │  ┌──────────────┐  calls     ┌────────────────┐                  │
//! │  │    Poller    │───────────▶│ TransportActor │◀══▶ remote app   │
//! │  │  (inline)    │            │ pending, ctxs  │                  │
//! │  └──────┬───────┘            └────────────────┘                  │
//! │         │ snapshot_update            ▲ invoke                    │
//! │         ▼                            │                           │
//! │  ┌──────────────┐            ┌───────┴─────────┐                 │
//! │  │ Broadcaster  │───────────▶│ConnectionHandler│◀══▶ subscribers │
//! │  └──────────────┘  frames    └─────────────────┘                 │
//! │                                                                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate avoids panics:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod bridge;
pub mod config;
pub mod discovery;
pub mod invoker;
pub mod pidfile;
pub mod poller;
pub mod server;
pub mod status;
pub mod supervisor;
pub mod transport;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use supervisor::{ConnectionState, Supervisor};
