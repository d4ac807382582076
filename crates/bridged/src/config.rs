//! Bridge configuration.
//!
//! Loaded from TOML (`$XDG_CONFIG_HOME/uibridge/config.toml` by default),
//! then overridden from the environment. Every field has a default, so an
//! empty or missing default file yields a working configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::discovery::TargetPolicy;
use crate::supervisor::Backoff;

// ============================================================================
// Constants
// ============================================================================

/// Ports probed for a debug endpoint, in order.
pub const DEFAULT_PORTS: [u16; 4] = [9000, 9001, 9002, 9003];

/// Default subscriber listen address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:3000";

/// Companion service port whose reachability is reported to subscribers.
pub const DEFAULT_PEER_PROBE_PORT: u16 = 8000;

/// Environment override for the candidate port list (comma separated).
pub const ENV_PORTS: &str = "UIBRIDGE_PORTS";

/// Environment override for the subscriber listen address.
pub const ENV_LISTEN: &str = "UIBRIDGE_LISTEN";

/// Environment override for the debug endpoint host.
pub const ENV_HOST: &str = "UIBRIDGE_HOST";

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read {}: {error}", path.display())]
    Read { path: PathBuf, error: String },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Config
// ============================================================================

/// Runtime configuration for the bridge daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Host the debug endpoints listen on
    pub host: String,

    /// Candidate debug ports, probed in order
    pub ports: Vec<u16>,

    /// Address the subscriber WebSocket server binds to
    pub listen: SocketAddr,

    /// Companion port probed for the `apiConnected` flag (0 disables)
    pub peer_probe_port: u16,

    pub probe_timeout_ms: u64,
    pub discovery_timeout_ms: u64,
    pub call_timeout_ms: u64,

    /// Wait after `Runtime.enable` so the peer can announce its contexts
    pub settle_delay_ms: u64,

    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,

    /// Growth factor between retries; 1.0 keeps a fixed cadence
    pub retry_multiplier: f64,

    pub poll_interval_ms: u64,

    /// Delay before the extra tick that follows a remote action
    pub nudge_delay_ms: u64,

    /// Minimum spacing between repeated capture-failure logs
    pub error_log_interval_ms: u64,

    pub max_subscribers: usize,

    /// File holding the capture expression; built-in expression if unset
    pub capture_script: Option<PathBuf>,

    /// Target selection markers
    pub targets: TargetPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            ports: DEFAULT_PORTS.to_vec(),
            listen: SocketAddr::from(([127, 0, 0, 1], 3000)),
            peer_probe_port: DEFAULT_PEER_PROBE_PORT,
            probe_timeout_ms: 500,
            discovery_timeout_ms: 1_000,
            call_timeout_ms: 30_000,
            settle_delay_ms: 2_500,
            retry_delay_ms: 2_000,
            retry_max_delay_ms: 2_000,
            retry_multiplier: 1.0,
            poll_interval_ms: 1_500,
            nudge_delay_ms: 300,
            error_log_interval_ms: 10_000,
            max_subscribers: 32,
            capture_script: None,
            targets: TargetPolicy::default(),
        }
    }
}

impl BridgeConfig {
    /// Loads configuration.
    ///
    /// With an explicit `path`, the file must exist. Without one, the
    /// default path is used if present and defaults otherwise. Environment
    /// overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default_path = default_config_path();
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::from_toml(&content)
    }

    /// Parses TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Applies overrides from a variable lookup (the process environment
    /// in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ports) = lookup(ENV_PORTS) {
            self.ports = parse_port_list(&ports)?;
        }

        if let Some(listen) = lookup(ENV_LISTEN) {
            self.listen = listen
                .trim()
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("{ENV_LISTEN}={listen}: {e}")))?;
        }

        if let Some(host) = lookup(ENV_HOST) {
            let host = host.trim();
            if !host.is_empty() {
                self.host = host.to_string();
            }
        }

        Ok(())
    }

    /// Rejects configurations the bridge cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.is_empty() {
            return Err(ConfigError::Invalid("at least one port is required".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        if self.call_timeout_ms == 0 {
            return Err(ConfigError::Invalid("call_timeout_ms must be positive".into()));
        }
        if self.retry_multiplier.is_nan() || self.retry_multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry_multiplier must be >= 1.0".into()));
        }
        if self.max_subscribers == 0 {
            return Err(ConfigError::Invalid("max_subscribers must be positive".into()));
        }
        Ok(())
    }

    /// Companion probe port, if enabled.
    pub fn peer_probe_port(&self) -> Option<u16> {
        (self.peer_probe_port != 0).then_some(self.peer_probe_port)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn nudge_delay(&self) -> Duration {
        Duration::from_millis(self.nudge_delay_ms)
    }

    pub fn error_log_interval(&self) -> Duration {
        Duration::from_millis(self.error_log_interval_ms)
    }

    /// Retry schedule for discovery and connection failures.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.retry_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms.max(self.retry_delay_ms)),
            self.retry_multiplier,
        )
    }

    /// Returns the capture expression to evaluate each poll tick.
    pub fn capture_expression(&self) -> Result<String, ConfigError> {
        match &self.capture_script {
            Some(path) => std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                path: path.clone(),
                error: e.to_string(),
            }),
            None => Ok(crate::poller::DEFAULT_CAPTURE_EXPRESSION.to_string()),
        }
    }
}

/// Returns the default configuration directory.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("uibridge")
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

fn parse_port_list(raw: &str) -> Result<Vec<u16>, ConfigError> {
    let ports = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u16>()
                .map_err(|e| ConfigError::Invalid(format!("{ENV_PORTS}: bad port {s:?}: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if ports.is_empty() {
        return Err(ConfigError::Invalid(format!("{ENV_PORTS} is empty")));
    }
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.ports, vec![9000, 9001, 9002, 9003]);
        assert_eq!(config.listen.to_string(), DEFAULT_LISTEN);
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
        assert_eq!(config.peer_probe_port(), Some(8000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = BridgeConfig::from_toml(
            r#"
            ports = [9222]
            poll_interval_ms = 2000

            [targets]
            primary_url_marker = "index.html"
            "#,
        )
        .unwrap();

        assert_eq!(config.ports, vec![9222]);
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.targets.primary_url_marker, "index.html");
        assert_eq!(config.targets.fallback_title, "Launchpad");
        assert_eq!(config.retry_delay_ms, 2_000);
    }

    #[test]
    fn test_unparseable_toml() {
        assert!(matches!(
            BridgeConfig::from_toml("ports = \"nine\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = BridgeConfig::from_file(Path::new("/nonexistent/uibridge.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_file_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "listen = \"0.0.0.0:4000\"\npeer_probe_port = 0\n").unwrap();

        let config = BridgeConfig::from_file(&path).unwrap();
        assert_eq!(config.listen.port(), 4000);
        assert_eq!(config.peer_probe_port(), None);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BridgeConfig::default();
        config
            .apply_overrides(lookup(&[
                (ENV_PORTS, "9222, 9229"),
                (ENV_LISTEN, "127.0.0.1:3100"),
                (ENV_HOST, "localhost"),
            ]))
            .unwrap();

        assert_eq!(config.ports, vec![9222, 9229]);
        assert_eq!(config.listen.port(), 3100);
        assert_eq!(config.host, "localhost");
    }

    #[test]
    fn test_bad_env_port_is_rejected() {
        let mut config = BridgeConfig::default();
        let err = config
            .apply_overrides(lookup(&[(ENV_PORTS, "9000,abc")]))
            .unwrap_err();
        assert!(err.to_string().contains("abc"));

        let err = config.apply_overrides(lookup(&[(ENV_PORTS, " , ")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_validate_rejects_nonsense() {
        let config = BridgeConfig {
            ports: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BridgeConfig {
            retry_multiplier: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_backoff_is_fixed() {
        let mut backoff = BridgeConfig::default().backoff();
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_capture_expression_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.js");
        std::fs::write(&path, "(() => ({content: 'x'}))()").unwrap();

        let config = BridgeConfig {
            capture_script: Some(path),
            ..Default::default()
        };
        assert_eq!(config.capture_expression().unwrap(), "(() => ({content: 'x'}))()");

        let builtin = BridgeConfig::default().capture_expression().unwrap();
        assert!(builtin.contains("scrollMetrics"));
    }
}
