//! Client interface for interacting with the TransportActor.
//!
//! The `TransportHandle` is cheap to clone and shared by the supervisor,
//! the poller, the invoker, and subscriber connections.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `TransportError::Closed`

use std::sync::Arc;

use bridge_core::ExecutionContext;
use bridge_protocol::cdp::methods;
use bridge_protocol::{EvaluateOutcome, EvaluateParams};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::commands::{TransportCommand, TransportError};

// ============================================================================
// Transport Handle
// ============================================================================

/// Handle for one control connection.
///
/// # Usage
///
/// ```ignore
/// let handle = transport::open(&endpoint.ws_url, options).await?;
/// handle.enable_runtime().await?;
///
/// for ctx in handle.contexts() {
///     let outcome = handle.evaluate(EvaluateParams::in_context("1", ctx.id)).await?;
/// }
///
/// handle.closed().await; // resolves when the socket goes away
/// ```
#[derive(Clone)]
pub struct TransportHandle {
    sender: mpsc::Sender<TransportCommand>,
    contexts: watch::Receiver<Vec<ExecutionContext>>,
    closed: CancellationToken,
    url: Arc<str>,
}

impl TransportHandle {
    /// Creates a new handle.
    ///
    /// # Arguments
    ///
    /// * `sender` - The command channel to the actor
    /// * `contexts` - Receiver side of the actor's context publisher
    /// * `closed` - Token the actor cancels when the connection ends
    /// * `url` - Control socket URL, for logging
    pub fn new(
        sender: mpsc::Sender<TransportCommand>,
        contexts: watch::Receiver<Vec<ExecutionContext>>,
        closed: CancellationToken,
        url: &str,
    ) -> Self {
        Self {
            sender,
            contexts,
            closed,
            url: Arc::from(url),
        }
    }

    /// Control socket URL this handle talks to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sends `method` with `params` and waits for the response.
    ///
    /// # Errors
    ///
    /// - `TransportError::Timeout` if the deadline passes
    /// - `TransportError::Remote` if the peer returns an error
    /// - `TransportError::Closed` if the connection is or becomes closed
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let (tx, rx) = oneshot::channel();

        self.sender
            .send(TransportCommand::Call {
                method: method.to_string(),
                params,
                respond_to: tx,
            })
            .await
            .map_err(|_| TransportError::Closed)?;

        rx.await.map_err(|_| TransportError::Closed)?
    }

    /// Enables runtime events so the peer announces its contexts.
    pub async fn enable_runtime(&self) -> Result<(), TransportError> {
        self.call(methods::RUNTIME_ENABLE, json!({})).await?;
        Ok(())
    }

    /// Evaluates an expression and classifies the result.
    pub async fn evaluate(&self, params: EvaluateParams) -> Result<EvaluateOutcome, TransportError> {
        let result = self
            .call(methods::RUNTIME_EVALUATE, params.to_value())
            .await?;
        Ok(EvaluateOutcome::from_result(&result))
    }

    /// Returns a point-in-time copy of the live contexts, in creation order.
    pub fn contexts(&self) -> Vec<ExecutionContext> {
        self.contexts.borrow().clone()
    }

    /// Resolves once the connection is terminal.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Returns true once the connection is terminal.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Closes the connection. Safe to call repeatedly from any holder.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Number of calls awaiting a response (0 once closed).
    pub async fn pending_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(TransportCommand::PendingCount { respond_to: tx })
            .await
            .is_err()
        {
            return 0;
        }

        rx.await.unwrap_or(0)
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("url", &self.url)
            .field("closed", &self.is_closed())
            .finish()
    }
}
