//! Connection handler for individual subscriber connections.
//!
//! Each subscriber gets its own `ConnectionHandler` that:
//! - Registers with the broadcaster and sends the current status
//! - Parses incoming requests and replies on the same queue as broadcasts
//! - Unregisters when the socket closes or goes idle
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Malformed requests get an `error` reply; the connection continues
//! - Connection errors are logged and result in graceful disconnect

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bridge_protocol::{BridgeMessage, ClientRequest, Notification};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use super::fanout::{FrameSender, Subscription};
use crate::bridge::Bridge;

/// Server-side subscriber socket.
pub type SubscriberSocket = WebSocketStream<TcpStream>;

/// Maximum request size (1 MB)
const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection handler for a single subscriber.
pub struct ConnectionHandler {
    stream: SplitStream<SubscriberSocket>,
    sender: FrameSender,
    bridge: Arc<Bridge>,
    subscriber_id: u64,
    peer: SocketAddr,
}

impl ConnectionHandler {
    /// Registers `socket` with the broadcaster and spawns its writer task.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Rejected` if the subscriber limit is
    /// reached; the client is told why before the socket is closed.
    pub async fn accept(
        socket: SubscriberSocket,
        bridge: Arc<Bridge>,
        peer: SocketAddr,
    ) -> Result<Self, ConnectionError> {
        let (mut sink, stream) = socket.split();

        let subscription = match bridge.broadcaster().add().await {
            Ok(subscription) => subscription,
            Err(e) => {
                let reason = e.to_string();
                if let Ok(json) = Notification::now(BridgeMessage::error(&reason)).to_json() {
                    let _ = timeout(WRITE_TIMEOUT, sink.send(Message::Text(json.into()))).await;
                }
                let _ = timeout(WRITE_TIMEOUT, sink.close()).await;
                return Err(ConnectionError::Rejected(reason));
            }
        };

        let Subscription {
            id,
            sender,
            receiver,
        } = subscription;
        tokio::spawn(write_frames(sink, receiver, id));

        Ok(Self {
            stream,
            sender,
            bridge,
            subscriber_id: id,
            peer,
        })
    }

    /// Runs the connection until it closes, then unregisters it.
    pub async fn run(mut self) {
        info!(subscriber = self.subscriber_id, peer = %self.peer, "Subscriber connected");

        let status = self.bridge.status().await;
        if let Err(e) = self.reply(BridgeMessage::status(status)).await {
            debug!(subscriber = self.subscriber_id, error = %e, "Failed to send initial status");
        } else if let Err(e) = self.process_messages().await {
            debug!(subscriber = self.subscriber_id, error = %e, "Connection closed");
        }

        self.bridge.broadcaster().remove(self.subscriber_id).await;
        info!(subscriber = self.subscriber_id, "Subscriber disconnected");
    }

    /// Reads requests until the socket closes or goes idle.
    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            let frame = match timeout(READ_TIMEOUT, self.stream.next()).await {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => return Err(ConnectionError::Io(e.to_string())),
                Ok(None) => return Ok(()),
                Err(_) => {
                    debug!(subscriber = self.subscriber_id, "Read timeout");
                    return Err(ConnectionError::Timeout);
                }
            };

            match frame {
                Message::Text(text) => self.handle_text(text.as_str()).await?,
                Message::Close(_) => return Ok(()),
                Message::Binary(_) => {
                    self.reply(BridgeMessage::error("binary frames are not supported"))
                        .await?;
                }
                _ => {}
            }
        }
    }

    async fn handle_text(&mut self, text: &str) -> Result<(), ConnectionError> {
        if text.len() > MAX_MESSAGE_SIZE {
            let err = ConnectionError::MessageTooLarge {
                size: text.len(),
                max: MAX_MESSAGE_SIZE,
            };
            return self.reply(BridgeMessage::error(&err.to_string())).await;
        }

        let request = match ClientRequest::from_json(text) {
            Ok(request) => request,
            Err(e) => {
                debug!(subscriber = self.subscriber_id, error = %e, "Malformed request");
                return self
                    .reply(BridgeMessage::error(&format!("malformed request: {e}")))
                    .await;
            }
        };

        self.handle_request(request).await
    }

    async fn handle_request(&mut self, request: ClientRequest) -> Result<(), ConnectionError> {
        match request {
            ClientRequest::FetchSnapshot => {
                let snapshot = self.bridge.snapshot().await;
                self.reply(BridgeMessage::snapshot(snapshot.as_deref())).await
            }
            ClientRequest::Invoke {
                request_id,
                expression,
            } => {
                debug!(subscriber = self.subscriber_id, request_id, "Invoke requested");
                // Runs off the read loop so pings and fetches are not held up
                let bridge = Arc::clone(&self.bridge);
                let sender = self.sender.clone();
                tokio::spawn(async move {
                    let reply = match bridge.invoke(&expression).await {
                        Ok(value) => BridgeMessage::action_ok(request_id, value),
                        Err(e) => {
                            warn!(request_id, error = %e, "Action failed");
                            BridgeMessage::action_failed(request_id, e.reason())
                        }
                    };
                    if let Err(e) = queue_reply(&sender, reply).await {
                        debug!(request_id, error = %e, "Subscriber gone before action result");
                    }
                });
                Ok(())
            }
            ClientRequest::Ping { seq } => self.reply(BridgeMessage::pong(seq)).await,
        }
    }

    async fn reply(&self, message: BridgeMessage) -> Result<(), ConnectionError> {
        queue_reply(&self.sender, message).await
    }
}

/// Queues a direct reply behind any pending broadcasts.
async fn queue_reply(sender: &FrameSender, message: BridgeMessage) -> Result<(), ConnectionError> {
    let json = Notification::now(message)
        .to_json()
        .map_err(|e| ConnectionError::ParseError(e.to_string()))?;

    sender
        .send(Arc::from(json))
        .await
        .map_err(|_| ConnectionError::Eof)
}

/// Forwards queued frames to the socket until the queue or socket closes.
async fn write_frames(
    mut sink: SplitSink<SubscriberSocket, Message>,
    mut receiver: mpsc::Receiver<Arc<str>>,
    subscriber_id: u64,
) {
    while let Some(frame) = receiver.recv().await {
        match timeout(WRITE_TIMEOUT, sink.send(Message::Text(frame.to_string().into()))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(subscriber = subscriber_id, error = %e, "Write failed");
                break;
            }
            Err(_) => {
                warn!(subscriber = subscriber_id, "Write timeout");
                break;
            }
        }
    }

    let _ = timeout(WRITE_TIMEOUT, sink.close()).await;
}

/// Errors that can occur on a subscriber connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection rejected: {0}")]
    Rejected(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}
