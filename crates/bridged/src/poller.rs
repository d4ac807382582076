//! Snapshot poller.
//!
//! While a connection is up, the poller evaluates the capture expression on
//! a fixed interval and broadcasts `snapshot_update` whenever the canonical
//! content hash changes. Ticks never overlap: the next one is scheduled only
//! after the current one has fully finished.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Capture failures are logged (rate limited) and never stop the loop

use std::sync::Arc;
use std::time::{Duration, Instant};

use bridge_core::CapturedState;
use bridge_protocol::{BridgeMessage, EvaluateOutcome, EvaluateParams};
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::transport::{TransportError, TransportHandle};

/// Built-in capture expression.
///
/// Returns the page body markup, the text of every readable stylesheet, the
/// document scroll position, and a few size counters.
pub const DEFAULT_CAPTURE_EXPRESSION: &str = r#"(() => {
  const root = document.body;
  if (!root) return { error: 'document body not ready' };
  const rules = [];
  for (const sheet of Array.from(document.styleSheets)) {
    try {
      for (const rule of Array.from(sheet.cssRules)) rules.push(rule.cssText);
    } catch (e) {}
  }
  const scroller = document.scrollingElement || document.documentElement;
  const content = root.outerHTML;
  const style = rules.join('\n');
  return {
    content,
    style,
    scrollMetrics: {
      scrollTop: scroller.scrollTop,
      scrollHeight: scroller.scrollHeight,
      clientHeight: scroller.clientHeight
    },
    stats: {
      nodes: root.getElementsByTagName('*').length,
      contentSize: content.length,
      styleSize: style.length
    }
  };
})()"#;

// ============================================================================
// Rate-Limited Logging
// ============================================================================

/// Lets a repeated message through at most once per interval.
#[derive(Debug, Clone)]
pub struct RateLimitedLog {
    interval: Duration,
    last: Option<Instant>,
}

impl RateLimitedLog {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Returns true if a message may be logged at `now`.
    pub fn should_log(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Forgets the last message so the next failure logs immediately.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

// ============================================================================
// Capture
// ============================================================================

/// Result of one capture attempt across all contexts.
#[derive(Debug)]
pub enum CaptureOutcome {
    /// A context returned usable state
    Captured(CapturedState),

    /// Every context failed; carries the first failure
    Failed(String),

    /// No contexts were available
    NoContext,

    /// The connection closed mid-capture
    Closed,
}

/// Periodic capture loop for one connection.
#[derive(Debug, Clone)]
pub struct Poller {
    expression: Arc<str>,
    interval: Duration,
    nudge_delay: Duration,
    error_log: RateLimitedLog,
}

impl Poller {
    /// Creates a poller.
    ///
    /// # Arguments
    ///
    /// * `expression` - Capture expression evaluated in each context
    /// * `interval` - Delay between ticks
    /// * `nudge_delay` - Delay before a nudged tick
    /// * `error_log_interval` - Minimum spacing of capture-failure logs
    pub fn new(
        expression: impl Into<Arc<str>>,
        interval: Duration,
        nudge_delay: Duration,
        error_log_interval: Duration,
    ) -> Self {
        Self {
            expression: expression.into(),
            interval,
            nudge_delay,
            error_log: RateLimitedLog::new(error_log_interval),
        }
    }

    /// Creates a poller with the timings from `config`.
    pub fn from_config(config: &BridgeConfig, expression: impl Into<Arc<str>>) -> Self {
        Self::new(
            expression,
            config.poll_interval(),
            config.nudge_delay(),
            config.error_log_interval(),
        )
    }

    /// Evaluates the capture expression in each context, in order.
    ///
    /// The first usable state wins. When every context fails, the first
    /// failure is kept for diagnostics.
    pub async fn capture(&self, transport: &TransportHandle) -> CaptureOutcome {
        let contexts = transport.contexts();
        let mut first_error: Option<String> = None;

        for ctx in contexts {
            let params = EvaluateParams::in_context(self.expression.as_ref(), ctx.id).awaiting();

            let failure = match transport.evaluate(params).await {
                Ok(EvaluateOutcome::Value(value)) => match CapturedState::from_value(value) {
                    Ok(state) => return CaptureOutcome::Captured(state),
                    Err(e) => e.to_string(),
                },
                Ok(EvaluateOutcome::Exception(text)) => text,
                Ok(EvaluateOutcome::NoValue) => "no value returned".to_string(),
                Err(TransportError::Closed) => return CaptureOutcome::Closed,
                Err(e) => e.to_string(),
            };

            debug!(context = %ctx, reason = %failure, "Capture attempt failed");
            first_error.get_or_insert_with(|| format!("context {ctx}: {failure}"));
        }

        match first_error {
            Some(reason) => CaptureOutcome::Failed(reason),
            None => CaptureOutcome::NoContext,
        }
    }

    /// Runs one tick: capture, compare, broadcast, refresh status.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` if the connection closed.
    pub async fn tick(
        &mut self,
        transport: &TransportHandle,
        bridge: &Bridge,
    ) -> Result<(), TransportError> {
        match self.capture(transport).await {
            CaptureOutcome::Captured(state) => {
                self.error_log.reset();
                if bridge.observe(state).await {
                    let delivered = bridge
                        .broadcaster()
                        .broadcast(BridgeMessage::SnapshotUpdate)
                        .await;
                    debug!(delivered, "Broadcast snapshot update");
                }
            }
            CaptureOutcome::Failed(reason) => {
                if self.error_log.should_log(Instant::now()) {
                    warn!(%reason, "Capture failed");
                }
            }
            CaptureOutcome::NoContext => {
                if self.error_log.should_log(Instant::now()) {
                    warn!("No execution context available for capture");
                }
            }
            CaptureOutcome::Closed => return Err(TransportError::Closed),
        }

        bridge.refresh_peer().await;
        bridge.publish_status().await;
        Ok(())
    }

    /// Polls until the connection closes.
    ///
    /// On closure the transport is closed explicitly and the loop returns,
    /// so the owner can reconnect right away.
    pub async fn run(mut self, transport: &TransportHandle, bridge: &Bridge) {
        info!(interval_ms = self.interval.as_millis() as u64, "Poller started");

        loop {
            if self.tick(transport, bridge).await.is_err() {
                info!("Poller stopping: connection closed");
                transport.close();
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = bridge.nudged() => {
                    tokio::time::sleep(self.nudge_delay).await;
                }
            }
        }
    }
}
