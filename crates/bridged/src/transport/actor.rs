//! Transport actor - owns the control socket, pending calls, and contexts.
//!
//! The actor is the single owner of the WebSocket, the pending-call table,
//! and the context registry. Every mutation of those happens here, in one
//! task: commands from handles, inbound frames, and deadline expiries are
//! multiplexed with `select!`.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Reply send failures are ignored (the caller gave up)
//! - Socket errors end the actor; they never propagate as panics

use std::collections::HashMap;
use std::time::Duration;

use bridge_core::{ContextEvent, ContextRegistry, ExecutionContext};
use bridge_protocol::{parse_context_event, CallId, CdpRequest, InboundFrame};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, trace, warn};

use super::commands::{TransportCommand, TransportError};

/// Client-side control socket.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait for the close handshake before dropping the socket.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// A call awaiting its response.
struct PendingCall {
    method: String,
    respond_to: oneshot::Sender<Result<Value, TransportError>>,
    deadline: delay_queue::Key,
}

// ============================================================================
// Transport Actor
// ============================================================================

/// The transport actor.
///
/// # Ownership
///
/// - `pending`: calls awaiting a response, keyed by correlation id
/// - `deadlines`: one timer per pending call; an entry is in `pending`
///   exactly as long as its key is in `deadlines`
/// - `contexts`: the live execution contexts, published to handles
///   through `contexts_tx` after every change
pub struct TransportActor {
    receiver: mpsc::Receiver<TransportCommand>,
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,

    pending: HashMap<CallId, PendingCall>,
    deadlines: DelayQueue<CallId>,
    call_timeout: Duration,

    /// Next correlation id; starts at 1 and only grows
    next_id: CallId,

    contexts: ContextRegistry,
    contexts_tx: watch::Sender<Vec<ExecutionContext>>,

    /// Fired once the connection is terminal
    closed: CancellationToken,
}

impl TransportActor {
    /// Creates a new transport actor over an open socket.
    ///
    /// # Arguments
    ///
    /// * `ws` - The connected control socket
    /// * `receiver` - Channel for receiving commands
    /// * `contexts_tx` - Publisher for the context list
    /// * `closed` - Token cancelled when the connection ends
    /// * `call_timeout` - Deadline applied to every call
    pub fn new(
        ws: WsStream,
        receiver: mpsc::Receiver<TransportCommand>,
        contexts_tx: watch::Sender<Vec<ExecutionContext>>,
        closed: CancellationToken,
        call_timeout: Duration,
    ) -> Self {
        let (sink, stream) = ws.split();
        Self {
            receiver,
            sink,
            stream,
            pending: HashMap::new(),
            deadlines: DelayQueue::new(),
            call_timeout,
            next_id: 1,
            contexts: ContextRegistry::new(),
            contexts_tx,
            closed,
        }
    }

    /// Runs the actor until the socket closes or the token is cancelled.
    pub async fn run(mut self) {
        debug!("Transport actor starting");

        let reason = loop {
            tokio::select! {
                biased;

                _ = self.closed.cancelled() => break "closed locally".to_string(),

                cmd = self.receiver.recv() => {
                    let Some(cmd) = cmd else {
                        break "all handles dropped".to_string();
                    };
                    if let Err(reason) = self.handle_command(cmd).await {
                        break reason;
                    }
                }

                frame = self.stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => break "closed by peer".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("socket error: {e}"),
                },

                Some(expired) = self.deadlines.next(), if !self.deadlines.is_empty() => {
                    self.handle_expired(expired.into_inner());
                }
            }
        };

        self.shutdown(&reason).await;
    }

    /// Dispatches a command.
    ///
    /// Returns `Err(reason)` if the socket can no longer be written.
    async fn handle_command(&mut self, cmd: TransportCommand) -> Result<(), String> {
        match cmd {
            TransportCommand::Call {
                method,
                params,
                respond_to,
            } => self.handle_call(method, params, respond_to).await,
            TransportCommand::PendingCount { respond_to } => {
                let _ = respond_to.send(self.pending.len());
                Ok(())
            }
        }
    }

    async fn handle_call(
        &mut self,
        method: String,
        params: Value,
        respond_to: oneshot::Sender<Result<Value, TransportError>>,
    ) -> Result<(), String> {
        let id = self.next_id;
        self.next_id += 1;

        let text = match CdpRequest::new(id, method.as_str(), params).to_json() {
            Ok(text) => text,
            Err(e) => {
                let _ = respond_to.send(Err(TransportError::Protocol(e.to_string())));
                return Ok(());
            }
        };

        let deadline = self.deadlines.insert(id, self.call_timeout);
        trace!(id, method = %method, "Sending call");
        self.pending.insert(
            id,
            PendingCall {
                method,
                respond_to,
                deadline,
            },
        );

        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| format!("write failed: {e}"))
    }

    /// Routes one inbound text frame.
    fn handle_frame(&mut self, text: &str) {
        match InboundFrame::parse(text) {
            Ok(InboundFrame::Response { id, outcome }) => {
                let Some(call) = self.pending.remove(&id) else {
                    debug!(id, "Dropping response for unknown call");
                    return;
                };
                let _ = self.deadlines.try_remove(&call.deadline);

                let result = outcome.map_err(|error| TransportError::Remote {
                    method: call.method,
                    error,
                });
                let _ = call.respond_to.send(result);
            }
            Ok(InboundFrame::Event { method, params }) => self.handle_event(&method, &params),
            Err(e) => debug!(error = %e, "Dropping unparseable frame"),
        }
    }

    fn handle_event(&mut self, method: &str, params: &Value) {
        match parse_context_event(method, params) {
            Ok(Some(event)) => {
                debug!(?event, "Context event");
                if self.contexts.apply(event) {
                    self.publish_contexts();
                }
            }
            Ok(None) => trace!(method, "Ignoring event"),
            Err(e) => debug!(error = %e, "Dropping malformed context event"),
        }
    }

    fn handle_expired(&mut self, id: CallId) {
        if let Some(call) = self.pending.remove(&id) {
            warn!(id, method = %call.method, "Call timed out");
            let _ = call.respond_to.send(Err(TransportError::Timeout {
                method: call.method,
            }));
        }
    }

    fn publish_contexts(&self) {
        self.contexts_tx.send_replace(self.contexts.to_vec());
    }

    /// Makes the connection terminal.
    ///
    /// Every pending and queued call is rejected with `Closed`, the context
    /// view is emptied, and the closed token fires.
    async fn shutdown(mut self, reason: &str) {
        info!(
            reason,
            pending = self.pending.len(),
            "Control connection closed"
        );

        self.receiver.close();
        while let Ok(cmd) = self.receiver.try_recv() {
            match cmd {
                TransportCommand::Call { respond_to, .. } => {
                    let _ = respond_to.send(Err(TransportError::Closed));
                }
                TransportCommand::PendingCount { respond_to } => {
                    let _ = respond_to.send(0);
                }
            }
        }

        for (_, call) in self.pending.drain() {
            let _ = call.respond_to.send(Err(TransportError::Closed));
        }
        self.deadlines.clear();

        if self.contexts.apply(ContextEvent::Cleared) {
            self.publish_contexts();
        }

        // Owners may inspect contexts as soon as this fires
        self.closed.cancel();

        let _ = tokio::time::timeout(CLOSE_GRACE, self.sink.close()).await;
    }
}
