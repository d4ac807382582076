//! Control connection using the Actor pattern.
//!
//! One actor task per connection owns the socket, the pending-call table,
//! and the context registry. Everything else holds a `TransportHandle`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  TransportCommand  ┌─────────────────┐   text frames   ┌──────────┐
//! │ TransportHandle │───────────────────▶│ TransportActor  │◀───────────────▶│  remote  │
//! │   (cloneable)   │◀───────────────────│ pending table   │                 │   app    │
//! └─────────────────┘  oneshot replies   │ context registry│                 └──────────┘
//!         ▲                              └────────┬────────┘
//!         │  watch<Vec<ExecutionContext>>         │
//!         └───────────────────────────────────────┘
//!                 CancellationToken (closed)
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - Channel operations handle closure gracefully

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod actor;
mod commands;
mod handle;

pub use actor::{TransportActor, WsStream};
pub use commands::{TransportCommand, TransportError};
pub use handle::TransportHandle;

/// Command channel buffer size.
const COMMAND_BUFFER: usize = 64;

/// Connection settings.
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    /// Deadline for each call; also bounds the WebSocket handshake
    pub call_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Opens a control connection and spawns its actor.
///
/// # Errors
///
/// Returns `TransportError::Connect` if the handshake fails or does not
/// finish within `call_timeout`.
pub async fn open(url: &str, options: TransportOptions) -> Result<TransportHandle, TransportError> {
    let (ws, _response) = tokio::time::timeout(options.call_timeout, connect_async(url))
        .await
        .map_err(|_| TransportError::Connect(format!("handshake with {url} timed out")))?
        .map_err(|e| TransportError::Connect(e.to_string()))?;

    info!(url, "Control connection open");
    Ok(spawn_transport(ws, url, options))
}

/// Spawns the actor for an already-open socket and returns its handle.
pub fn spawn_transport(ws: WsStream, url: &str, options: TransportOptions) -> TransportHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (contexts_tx, contexts_rx) = watch::channel(Vec::new());
    let closed = CancellationToken::new();

    let actor = TransportActor::new(
        ws,
        cmd_rx,
        contexts_tx,
        closed.clone(),
        options.call_timeout,
    );
    tokio::spawn(actor.run());

    TransportHandle::new(cmd_tx, contexts_rx, closed, url)
}
