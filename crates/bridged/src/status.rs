//! Peer reachability probe and status deduplication.

use std::time::Duration;

use bridge_protocol::BridgeStatus;
use tokio::net::TcpStream;
use tracing::trace;

/// Returns true if a TCP connection to `host:port` succeeds within `timeout`.
pub async fn probe_port(host: &str, port: u16, timeout: Duration) -> bool {
    let reachable = matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    );
    trace!(host, port, reachable, "Probed peer port");
    reachable
}

/// Remembers the last emitted status so only changes are broadcast.
#[derive(Debug, Default)]
pub struct StatusTracker {
    last: Option<BridgeStatus>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `status`; returns it only if it differs from the last one.
    pub fn update(&mut self, status: BridgeStatus) -> Option<BridgeStatus> {
        if self.last == Some(status) {
            return None;
        }
        self.last = Some(status);
        Some(status)
    }

    /// Last emitted status, or the all-false default before the first one.
    pub fn current(&self) -> BridgeStatus {
        self.last.unwrap_or_default()
    }
}
