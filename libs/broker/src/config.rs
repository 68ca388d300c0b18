//! Broker configuration
//!
//! Serde-backed configuration with sensible defaults for every knob, plus
//! TOML loading for deployments that keep broker settings in files. All
//! durations are stored as integers in their natural unit and exposed as
//! `Duration` through accessor methods.

use crate::strategy::Strategy;
use flock_types::BrokerError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level broker options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Node identity; defaults to the lowercased hostname when unset.
    pub node_id: Option<String>,

    /// Default tracing filter installed by [`crate::init_tracing`].
    pub log_level: String,

    /// Default call timeout in milliseconds; 0 disables the timeout.
    pub request_timeout_ms: u64,

    /// Default number of transparent retries for retryable failures.
    pub request_retry: u32,

    /// Maximum context nesting depth; 0 means unlimited.
    pub max_call_level: u32,

    /// Seconds between HEARTBEAT broadcasts.
    pub heartbeat_interval_secs: u64,

    /// Seconds of heartbeat silence before a node counts as disconnected.
    pub heartbeat_timeout_secs: u64,

    pub registry: RegistryConfig,
    pub circuit_breaker: CircuitBreakerConfig,

    /// Enables metric span events for sampled calls.
    pub metrics: bool,

    /// Fraction of root calls that are sampled, in `[0.0, 1.0]`.
    pub metrics_rate: f64,

    /// Enables per-action request statistics (`$node.stats`).
    pub statistics: bool,

    /// Enables parameter validation for actions that declare a schema.
    pub validation: bool,

    /// Registers the `$node.*` introspection actions at startup.
    pub internal_actions: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            log_level: "info".to_string(),
            request_timeout_ms: 0,
            request_retry: 0,
            max_call_level: 0,
            heartbeat_interval_secs: 10,
            heartbeat_timeout_secs: 30,
            registry: RegistryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            metrics: false,
            metrics_rate: 1.0,
            statistics: false,
            validation: true,
            internal_actions: true,
        }
    }
}

impl BrokerConfig {
    /// Parse configuration from a TOML string.
    pub fn from_toml_str(text: &str) -> Result<Self, BrokerError> {
        let config: Self =
            toml::from_str(text).map_err(|e| BrokerError::serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, BrokerError> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            BrokerError::custom(
                format!("cannot read config file '{}': {}", path.as_ref().display(), e),
                500,
            )
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject configurations the runtime cannot honor.
    pub fn validate(&self) -> Result<(), BrokerError> {
        if !(0.0..=1.0).contains(&self.metrics_rate) {
            return Err(BrokerError::custom(
                format!("metrics_rate must be within [0, 1], got {}", self.metrics_rate),
                500,
            ));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(BrokerError::custom(
                "heartbeat_interval_secs must be at least 1",
                500,
            ));
        }
        if self.heartbeat_timeout_secs < self.heartbeat_interval_secs {
            return Err(BrokerError::custom(
                "heartbeat_timeout_secs must not be shorter than heartbeat_interval_secs",
                500,
            ));
        }
        Ok(())
    }

    /// Effective node identity: configured value, else lowercased hostname,
    /// else a pid-qualified fallback.
    pub fn resolve_node_id(&self) -> String {
        if let Some(id) = &self.node_id {
            if !id.is_empty() {
                return id.clone();
            }
        }
        match std::env::var("HOSTNAME") {
            Ok(host) if !host.trim().is_empty() => host.trim().to_lowercase(),
            _ => format!("node-{}", std::process::id()),
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

/// Endpoint selection options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub strategy: Strategy,
    /// Prefer a local endpoint over remote ones when one is callable.
    pub prefer_local: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::RoundRobin,
            prefer_local: true,
        }
    }
}

/// Per-endpoint circuit breaker policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Failures needed to trip CLOSED -> OPEN.
    pub max_failures: u32,
    /// Milliseconds an endpoint stays OPEN before a recovery probe.
    pub half_open_time_ms: u64,
    /// Count timeouts as breaker failures.
    pub failure_on_timeout: bool,
    /// Count 5xx rejections as breaker failures.
    pub failure_on_reject: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_failures: 5,
            half_open_time_ms: 10_000,
            failure_on_timeout: true,
            failure_on_reject: true,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn half_open_time(&self) -> Duration {
        Duration::from_millis(self.half_open_time_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.heartbeat_interval_secs, 10);
        assert_eq!(config.heartbeat_timeout_secs, 30);
        assert_eq!(config.max_call_level, 0);
        assert!(config.request_timeout().is_none());
        assert!(config.registry.prefer_local);
        assert_eq!(config.registry.strategy, Strategy::RoundRobin);
        assert!(!config.circuit_breaker.enabled);
        assert!(config.internal_actions);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_toml() {
        let config = BrokerConfig::from_toml_str(
            r#"
            node_id = "server-1"
            request_timeout_ms = 5000
            request_retry = 2

            [registry]
            strategy = "random"
            prefer_local = false

            [circuit_breaker]
            enabled = true
            max_failures = 2
            half_open_time_ms = 500
        "#,
        )
        .unwrap();

        assert_eq!(config.node_id.as_deref(), Some("server-1"));
        assert_eq!(config.request_timeout(), Some(Duration::from_millis(5000)));
        assert_eq!(config.registry.strategy, Strategy::Random);
        assert!(!config.registry.prefer_local);
        assert!(config.circuit_breaker.enabled);
        assert_eq!(config.circuit_breaker.max_failures, 2);
        assert_eq!(
            config.circuit_breaker.half_open_time(),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_invalid_metrics_rate() {
        let mut config = BrokerConfig::default();
        config.metrics_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_sanity() {
        let mut config = BrokerConfig::default();
        config.heartbeat_timeout_secs = 5;
        config.heartbeat_interval_secs = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_node_id_prefers_config() {
        let mut config = BrokerConfig::default();
        config.node_id = Some("broker-7".into());
        assert_eq!(config.resolve_node_id(), "broker-7");
    }
}
