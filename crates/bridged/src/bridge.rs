//! The bridge aggregate.
//!
//! One `Bridge` is created per daemon and shared by `Arc` between the
//! supervisor, the poller, and subscriber connections. It holds the live
//! connection (if any), the last snapshot, the connection state, and the
//! status tracker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bridge_core::{CapturedState, ChangeDetector, Snapshot};
use bridge_protocol::{BridgeMessage, BridgeStatus};
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex, Notify, RwLock};
use tracing::{debug, info};

use crate::config::BridgeConfig;
use crate::invoker::{self, InvokeError};
use crate::server::Broadcaster;
use crate::status::{probe_port, StatusTracker};
use crate::supervisor::ConnectionState;
use crate::transport::TransportHandle;

/// State changes kept for slow transition subscribers.
const TRANSITION_BUFFER: usize = 32;

/// Shared bridge state.
#[derive(Debug)]
pub struct Bridge {
    config: BridgeConfig,
    broadcaster: Broadcaster,

    connection: RwLock<Option<TransportHandle>>,
    state: watch::Sender<ConnectionState>,

    /// Every state change, in order; the watch above keeps only the latest
    transitions: broadcast::Sender<ConnectionState>,

    detector: RwLock<ChangeDetector>,
    status: Mutex<StatusTracker>,

    /// Last probe result, or whether discovery found an endpoint when no
    /// probe port is configured
    peer_reachable: AtomicBool,

    /// Wakes the poller early after a remote action
    nudge: Notify,
}

impl Bridge {
    /// Creates the bridge in the `Disconnected` state.
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        let broadcaster = Broadcaster::new(config.max_subscribers);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);

        Arc::new(Self {
            config,
            broadcaster,
            connection: RwLock::new(None),
            state,
            transitions,
            detector: RwLock::new(ChangeDetector::new()),
            status: Mutex::new(StatusTracker::new()),
            peer_reachable: AtomicBool::new(false),
            nudge: Notify::new(),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Returns the open connection, if any.
    pub async fn connection(&self) -> Option<TransportHandle> {
        self.connection
            .read()
            .await
            .as_ref()
            .filter(|t| !t.is_closed())
            .cloned()
    }

    /// Installs a freshly established connection.
    pub async fn install(&self, transport: TransportHandle) {
        let previous = self.connection.write().await.replace(transport);
        if let Some(old) = previous {
            old.close();
        }
    }

    /// Drops the current connection, closing it.
    pub async fn uninstall(&self) {
        if let Some(old) = self.connection.write().await.take() {
            old.close();
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribes to connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Subscribes to every state change, in the order they happen.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Connection state");
            let _ = self.transitions.send(next);
        }
    }

    // ------------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------------

    /// Returns the last snapshot taken.
    pub async fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.detector.read().await.current()
    }

    /// Stores a capture; returns true if its content changed.
    pub async fn observe(&self, captured: CapturedState) -> bool {
        let changed = self.detector.write().await.observe(captured);
        match changed {
            Some(snapshot) => {
                debug!(hash = %snapshot.hash, "Snapshot changed");
                true
            }
            None => false,
        }
    }

    /// Asks the poller to run its next tick early.
    pub fn nudge(&self) {
        self.nudge.notify_one();
    }

    /// Resolves when a nudge is pending.
    pub async fn nudged(&self) {
        self.nudge.notified().await;
    }

    // ------------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------------

    /// Runs `expression` against the live connection.
    ///
    /// A successful action nudges the poller so its effect shows up quickly.
    ///
    /// # Errors
    ///
    /// - `InvokeError::NotConnected` if there is no live connection
    /// - `InvokeError::NoContext` if no context produced a value
    /// - `InvokeError::Closed` if the connection closed mid-action
    pub async fn invoke(&self, expression: &str) -> Result<Value, InvokeError> {
        let transport = self.connection().await.ok_or(InvokeError::NotConnected)?;
        let value = invoker::invoke(&transport, expression).await?;
        self.nudge();
        Ok(value)
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    /// Current `(peer_reachable, connected)` pair.
    pub async fn status(&self) -> BridgeStatus {
        BridgeStatus {
            peer_reachable: self.peer_reachable.load(Ordering::Relaxed),
            connected: self.connection().await.is_some(),
        }
    }

    /// Sets the reachability flag directly.
    pub(crate) fn set_peer_reachable(&self, reachable: bool) {
        self.peer_reachable.store(reachable, Ordering::Relaxed);
    }

    /// Re-probes the companion port if one is configured.
    pub async fn refresh_peer(&self) {
        if let Some(port) = self.config.peer_probe_port() {
            let reachable =
                probe_port(&self.config.host, port, self.config.probe_timeout()).await;
            self.set_peer_reachable(reachable);
        }
    }

    /// Broadcasts the status if it changed since the last broadcast.
    pub async fn publish_status(&self) {
        let status = self.status().await;
        let changed = self.status.lock().await.update(status);
        if let Some(status) = changed {
            info!(
                peer_reachable = status.peer_reachable,
                connected = status.connected,
                "Status changed"
            );
            self.broadcaster.broadcast(BridgeMessage::status(status)).await;
        }
    }

    /// Closes the live connection and marks the bridge terminal.
    pub async fn teardown(&self) {
        self.set_state(ConnectionState::Closing);
        self.uninstall().await;
        info!("Bridge torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn captured(content: &str) -> CapturedState {
        CapturedState::from_value(json!({ "content": content })).unwrap()
    }

    #[tokio::test]
    async fn test_new_bridge_is_disconnected() {
        let bridge = Bridge::new(BridgeConfig::default());
        assert_eq!(bridge.state(), ConnectionState::Disconnected);
        assert!(bridge.connection().await.is_none());
        assert!(bridge.snapshot().await.is_none());
        assert_eq!(bridge.status().await, BridgeStatus::default());
    }

    #[tokio::test]
    async fn test_observe_reports_changes_only() {
        let bridge = Bridge::new(BridgeConfig::default());
        assert!(bridge.observe(captured("<p>a</p>")).await);
        assert!(!bridge.observe(captured("<p>a</p>")).await);
        assert!(bridge.observe(captured("<p>b</p>")).await);
        assert_eq!(bridge.snapshot().await.unwrap().content, "<p>b</p>");
    }

    #[tokio::test]
    async fn test_invoke_without_connection() {
        let bridge = Bridge::new(BridgeConfig::default());
        assert!(matches!(
            bridge.invoke("1").await,
            Err(InvokeError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_publish_status_deduplicates() {
        let bridge = Bridge::new(BridgeConfig::default());
        let mut sub = bridge.broadcaster().add().await.unwrap();

        bridge.publish_status().await;
        bridge.publish_status().await;
        bridge.set_peer_reachable(true);
        bridge.publish_status().await;

        let first = sub.receiver.recv().await.unwrap();
        assert!(first.contains("\"apiConnected\":false"));
        let second = sub.receiver.recv().await.unwrap();
        assert!(second.contains("\"apiConnected\":true"));
        assert!(sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transitions_keep_every_change() {
        let bridge = Bridge::new(BridgeConfig::default());
        let mut transitions = bridge.subscribe_transitions();

        bridge.set_state(ConnectionState::Discovering);
        bridge.set_state(ConnectionState::Discovering);
        bridge.set_state(ConnectionState::Disconnected);
        bridge.set_state(ConnectionState::Discovering);

        assert_eq!(transitions.recv().await.unwrap(), ConnectionState::Discovering);
        assert_eq!(transitions.recv().await.unwrap(), ConnectionState::Disconnected);
        assert_eq!(transitions.recv().await.unwrap(), ConnectionState::Discovering);
        assert!(transitions.try_recv().is_err());
        assert_eq!(bridge.state(), ConnectionState::Discovering);
    }

    #[tokio::test]
    async fn test_nudge_is_remembered() {
        let bridge = Bridge::new(BridgeConfig::default());
        bridge.nudge();
        tokio::time::timeout(std::time::Duration::from_millis(100), bridge.nudged())
            .await
            .unwrap();
    }
}
