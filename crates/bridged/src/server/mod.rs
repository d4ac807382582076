//! WebSocket server for subscribers.
//!
//! The server:
//! - Listens on a TCP address and upgrades each client to a WebSocket
//! - Spawns a ConnectionHandler for each client
//! - Fans broadcasts out through the shared `Broadcaster`
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ SubscriberServer │
//! │   TcpListener    │
//! └───────┬──────────┘
//!         │ accept() + WebSocket upgrade
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│     Bridge      │
//! │ (per subscriber)│     │ snapshot/invoke │
//! └───────▲─────────┘     └────────┬────────┘
//!         │ queued frames          │ broadcast
//!         └──────── Broadcaster ◀──┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept and handshake errors are logged and allow continued operation

mod connection;
mod fanout;

pub use connection::{ConnectionError, ConnectionHandler, SubscriberSocket};
pub use fanout::{Broadcaster, FrameSender, Subscription, SUBSCRIBER_QUEUE};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bridge::Bridge;

/// WebSocket server for subscriber connections.
pub struct SubscriberServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    bridge: Arc<Bridge>,
    cancel_token: CancellationToken,
}

impl SubscriberServer {
    /// Binds the listen address.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address to listen on (port 0 picks a free port)
    /// * `bridge` - Shared bridge state
    /// * `cancel_token` - Token for graceful shutdown
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Bind` if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        bridge: Arc<Bridge>,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| ServerError::Bind {
            addr,
            error: e.to_string(),
        })?;
        let local_addr = listener.local_addr().map_err(|e| ServerError::Bind {
            addr,
            error: e.to_string(),
        })?;

        Ok(Self {
            listener,
            local_addr,
            bridge,
            cancel_token,
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until the cancellation token is triggered.
    pub async fn run(self) {
        info!(addr = %self.local_addr, "Subscriber server listening");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.handle_connection(stream, peer),
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        info!("Server stopped");
    }

    /// Upgrades and serves one client on its own task.
    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let bridge = Arc::clone(&self.bridge);
        let cancel = self.cancel_token.clone();

        tokio::spawn(async move {
            let socket = match accept_async(stream).await {
                Ok(socket) => socket,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "WebSocket handshake failed");
                    return;
                }
            };

            let handler = match ConnectionHandler::accept(socket, bridge, peer).await {
                Ok(handler) => handler,
                Err(e) => {
                    info!(peer = %peer, error = %e, "Subscriber rejected");
                    return;
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = handler.run() => {}
            }
        });
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },

    #[error("Too many subscribers (max: {max})")]
    TooManyClients { max: usize },
}
