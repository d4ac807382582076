//! Endpoint discovery - finds the remote app's control socket.
//!
//! Probes each candidate debug port in order, fetches its `/json/list`
//! target list, and picks a target with a three-tier policy. The first
//! port with any match wins; ports are never compared against each other.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` outside tests
//! - HTTP and parse failures are recorded per port, never fatal

use std::fmt;
use std::time::Duration;

use bridge_protocol::TargetInfo;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

// ============================================================================
// Target Policy
// ============================================================================

/// Markers used to rank targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetPolicy {
    /// URL substring of the preferred page
    pub primary_url_marker: String,

    /// URL substring that disqualifies a page from the primary tier
    pub excluded_marker: String,

    /// URL substring of the fallback target
    pub fallback_url_marker: String,

    /// Exact title of the fallback target
    pub fallback_title: String,
}

impl Default for TargetPolicy {
    fn default() -> Self {
        Self {
            primary_url_marker: "workbench.html".to_string(),
            excluded_marker: "jetski".to_string(),
            fallback_url_marker: "jetski".to_string(),
            fallback_title: "Launchpad".to_string(),
        }
    }
}

/// Which policy tier a target matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TargetTier {
    Primary,
    Fallback,
    Generic,
}

impl fmt::Display for TargetTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
            Self::Generic => "generic",
        };
        f.write_str(name)
    }
}

impl TargetPolicy {
    fn is_primary(&self, target: &TargetInfo) -> bool {
        target.is_page()
            && target.url.contains(&self.primary_url_marker)
            && !target.url.contains(&self.excluded_marker)
    }

    fn is_fallback(&self, target: &TargetInfo) -> bool {
        target.url.contains(&self.fallback_url_marker) || target.title == self.fallback_title
    }
}

/// Picks the best attachable target from one port's list.
///
/// Targets without a control socket URL are never selected.
pub fn select_target<'a>(
    targets: &'a [TargetInfo],
    policy: &TargetPolicy,
) -> Option<(TargetTier, &'a TargetInfo)> {
    let attachable = || targets.iter().filter(|t| t.socket_url().is_some());

    if let Some(t) = attachable().find(|t| policy.is_primary(t)) {
        return Some((TargetTier::Primary, t));
    }
    if let Some(t) = attachable().find(|t| policy.is_fallback(t)) {
        return Some((TargetTier::Fallback, t));
    }
    attachable()
        .find(|t| t.is_page())
        .map(|t| (TargetTier::Generic, t))
}

// ============================================================================
// Results and Errors
// ============================================================================

/// A selected control endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub port: u16,
    pub ws_url: String,
    pub title: String,
    pub url: String,
    pub tier: TargetTier,
}

/// Why one port produced no endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortFailureKind {
    /// HTTP request or JSON parse failed
    Unreachable(String),

    /// Target list had nothing attachable
    NoMatch { targets: usize },
}

/// Per-port discovery failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortFailure {
    pub port: u16,
    pub kind: PortFailureKind,
}

impl fmt::Display for PortFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            PortFailureKind::Unreachable(reason) => {
                write!(f, "{}: unreachable ({reason})", self.port)
            }
            PortFailureKind::NoMatch { targets } => {
                write!(f, "{}: no match among {targets} targets", self.port)
            }
        }
    }
}

/// Errors that can occur during discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// No port yielded an attachable target
    #[error("no debug target found [{}]", summarize(.0))]
    NotFound(Vec<PortFailure>),

    /// HTTP client could not be built
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

fn summarize(failures: &[PortFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Target list, or the failure text, for one port.
#[derive(Debug, Clone)]
pub struct PortTargets {
    pub port: u16,
    pub targets: Result<Vec<TargetInfo>, String>,
}

// ============================================================================
// Discoverer
// ============================================================================

/// Probes debug ports over HTTP.
#[derive(Debug, Clone)]
pub struct Discoverer {
    client: reqwest::Client,
    host: String,
    policy: TargetPolicy,
}

impl Discoverer {
    /// Creates a discoverer with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::Client` if the HTTP client cannot be built.
    pub fn new(
        host: impl Into<String>,
        timeout: Duration,
        policy: TargetPolicy,
    ) -> Result<Self, DiscoveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DiscoveryError::Client(e.to_string()))?;

        Ok(Self {
            client,
            host: host.into(),
            policy,
        })
    }

    /// Returns the first endpoint found, probing `ports` in order.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::NotFound` with one entry per port when no
    /// port has an attachable target.
    pub async fn discover(&self, ports: &[u16]) -> Result<Endpoint, DiscoveryError> {
        let mut failures = Vec::with_capacity(ports.len());

        for &port in ports {
            let targets = match self.fetch_targets(port).await {
                Ok(targets) => targets,
                Err(reason) => {
                    debug!(port, %reason, "Debug port unreachable");
                    failures.push(PortFailure {
                        port,
                        kind: PortFailureKind::Unreachable(reason),
                    });
                    continue;
                }
            };

            match select_target(&targets, &self.policy) {
                Some((tier, target)) => {
                    let endpoint = Endpoint {
                        port,
                        ws_url: target.socket_url().unwrap_or_default().to_string(),
                        title: target.title.clone(),
                        url: target.url.clone(),
                        tier,
                    };
                    info!(port, %tier, title = %endpoint.title, "Found debug target");
                    return Ok(endpoint);
                }
                None => {
                    debug!(port, targets = targets.len(), "No matching target");
                    failures.push(PortFailure {
                        port,
                        kind: PortFailureKind::NoMatch {
                            targets: targets.len(),
                        },
                    });
                }
            }
        }

        Err(DiscoveryError::NotFound(failures))
    }

    /// Returns the raw target list of every port.
    pub async fn list_targets(&self, ports: &[u16]) -> Vec<PortTargets> {
        let mut out = Vec::with_capacity(ports.len());
        for &port in ports {
            out.push(PortTargets {
                port,
                targets: self.fetch_targets(port).await,
            });
        }
        out
    }

    async fn fetch_targets(&self, port: u16) -> Result<Vec<TargetInfo>, String> {
        let url = format!("http://{}:{port}/json/list", self.host);

        let response = self.client.get(&url).send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }

        response
            .json::<Vec<TargetInfo>>()
            .await
            .map_err(|e| e.to_string())
    }
}
