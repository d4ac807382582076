//! Connection supervisor - keeps one control connection alive.
//!
//! ```text
//!             ┌──────────────┐  start / connection lost
//!   ┌────────▶│ Disconnected │──────────────────────┐
//!   │         └──────────────┘                      ▼
//!   │ retry          ▲  discovery failed    ┌──────────────┐
//!   │ delay          └──────────────────────│ Discovering  │
//!   │                                       └──────┬───────┘
//!   │ handshake / enable failed                    │ endpoint found
//!   │         ┌──────────────┐                     ▼
//!   └─────────│  Connecting  │◀────────────────────┘
//!             └──────┬───────┘
//!                    │ open + Runtime.enable + settle
//!                    ▼
//!             ┌──────────────┐  transport closed
//!             │  Connected   │──────────▶ Disconnected ──▶ Discovering
//!             └──────────────┘
//!   any state ──shutdown──▶ Closing
//! ```
//!
//! While Connected the poller runs inline, so there is never more than one
//! capture cycle per connection.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Discovery and connection failures become scheduled retries

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::config::ConfigError;
use crate::discovery::{Discoverer, DiscoveryError};
use crate::poller::{Poller, RateLimitedLog};
use crate::transport::{self, TransportError, TransportHandle, TransportOptions};

// ============================================================================
// Connection State
// ============================================================================

/// Lifecycle of the control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Discovering,
    Connecting,
    Connected,
    /// Terminal; entered on shutdown
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Discovering => "discovering",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Retry delay schedule.
///
/// Each delay is the previous one times `multiplier`, capped at `max`. A
/// multiplier of 1.0 gives a fixed cadence.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: multiplier.max(1.0),
            current: initial,
        }
    }

    /// Returns the delay to wait now and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next_ms = (delay.as_millis() as f64 * self.multiplier) as u64;
        self.current = Duration::from_millis(next_ms).min(self.max);
        delay
    }

    /// Restarts the schedule after a success.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors that prevent the supervisor from starting.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Why one connection attempt failed.
#[derive(Debug, Error)]
enum EstablishError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ============================================================================
// Supervisor
// ============================================================================

/// Drives the connection state machine.
pub struct Supervisor {
    bridge: Arc<Bridge>,
    discoverer: Discoverer,
    expression: Arc<str>,
    backoff: Backoff,
    failure_log: RateLimitedLog,
}

impl Supervisor {
    /// Creates a supervisor for `bridge`.
    ///
    /// # Errors
    ///
    /// - `SupervisorError::Discovery` if the HTTP client cannot be built
    /// - `SupervisorError::Config` if the capture script cannot be read
    pub fn new(bridge: Arc<Bridge>) -> Result<Self, SupervisorError> {
        let config = bridge.config();
        let discoverer = Discoverer::new(
            config.host.clone(),
            config.discovery_timeout(),
            config.targets.clone(),
        )?;
        let expression: Arc<str> = Arc::from(config.capture_expression()?);
        let backoff = config.backoff();
        let failure_log = RateLimitedLog::new(config.error_log_interval());

        Ok(Self {
            bridge,
            discoverer,
            expression,
            backoff,
            failure_log,
        })
    }

    /// Runs until `cancel` fires, then tears the bridge down.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Supervisor starting");
        self.bridge.refresh_peer().await;
        self.bridge.publish_status().await;

        loop {
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.establish() => result,
            };

            let transport = match attempt {
                Ok(transport) => {
                    self.backoff.reset();
                    self.failure_log.reset();
                    transport
                }
                Err(e) => {
                    self.bridge.set_state(ConnectionState::Disconnected);
                    self.bridge.publish_status().await;

                    let delay = self.backoff.next_delay();
                    if self.failure_log.should_log(Instant::now()) {
                        warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Connection attempt failed");
                    } else {
                        debug!(error = %e, "Connection attempt failed");
                    }

                    let cancelled = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => true,
                        _ = sleep(delay) => false,
                    };
                    if cancelled {
                        break;
                    }
                    continue;
                }
            };

            if !self.serve(transport, &cancel).await {
                break;
            }
        }

        self.bridge.teardown().await;
        self.bridge.publish_status().await;
        info!("Supervisor stopped");
    }

    /// Discovers, connects, enables the runtime, and waits for contexts to
    /// settle.
    async fn establish(&self) -> Result<TransportHandle, EstablishError> {
        let config = self.bridge.config();
        let probe_configured = config.peer_probe_port().is_some();

        self.bridge.set_state(ConnectionState::Discovering);
        let found = self.discoverer.discover(&config.ports).await;
        if !probe_configured {
            self.bridge.set_peer_reachable(found.is_ok());
        }
        self.bridge.refresh_peer().await;
        self.bridge.publish_status().await;
        let endpoint = found?;

        self.bridge.set_state(ConnectionState::Connecting);
        let options = TransportOptions {
            call_timeout: config.call_timeout(),
        };
        let transport = transport::open(&endpoint.ws_url, options).await?;

        if let Err(e) = transport.enable_runtime().await {
            transport.close();
            return Err(e.into());
        }

        tokio::select! {
            _ = sleep(config.settle_delay()) => {}
            _ = transport.closed() => return Err(TransportError::Closed.into()),
        }

        info!(
            port = endpoint.port,
            title = %endpoint.title,
            contexts = transport.contexts().len(),
            "Connected"
        );
        Ok(transport)
    }

    /// Serves one connection until it closes.
    ///
    /// Returns false if shutdown was requested.
    async fn serve(&self, transport: TransportHandle, cancel: &CancellationToken) -> bool {
        self.bridge.install(transport.clone()).await;
        self.bridge.set_state(ConnectionState::Connected);
        self.bridge.publish_status().await;

        let poller = Poller::from_config(self.bridge.config(), Arc::clone(&self.expression));

        let keep_running = tokio::select! {
            _ = cancel.cancelled() => {
                transport.close();
                false
            }
            _ = transport.closed() => true,
            _ = poller.run(&transport, &self.bridge) => true,
        };

        self.bridge.uninstall().await;
        if keep_running {
            self.bridge.set_state(ConnectionState::Disconnected);
            self.bridge.publish_status().await;
            info!("Connection lost, rediscovering");
        }
        keep_running
    }
}
