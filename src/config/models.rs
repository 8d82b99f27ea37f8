//! Configuration data structures for Gantry.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! intentionally serde‑friendly and include defaults so that minimal configs remain concise.
//! Hooks such as `on_upstream_unhealthy` cannot live in a file; they are attached
//! programmatically through [`crate::core::GatewayHooks`].
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::scope::MiddlewareScope;

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_true() -> bool {
    true
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_weight() -> u32 {
    1
}

fn default_health_path() -> String {
    crate::core::upstream::DEFAULT_HEALTH_PATH.to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub load_balancing: LoadBalanceStrategy,
    /// Run periodic liveness probes
    #[serde(default = "default_true")]
    pub health_check: bool,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Default bound for calls and probes of upstreams without their own
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub middleware: MiddlewareConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Create a new gateway configuration builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstreams: Vec::new(),
            load_balancing: LoadBalanceStrategy::default(),
            health_check: true,
            health_check_interval_ms: default_health_check_interval_ms(),
            circuit_breaker: CircuitBreakerConfig::default(),
            timeout_ms: default_timeout_ms(),
            middleware: MiddlewareConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Builder for GatewayConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Add an upstream
    pub fn upstream(mut self, upstream: UpstreamConfig) -> Self {
        self.config.upstreams.push(upstream);
        self
    }

    pub fn load_balancing(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.config.load_balancing = strategy;
        self
    }

    /// Enable or disable periodic probing with the given interval
    pub fn health_check(mut self, enabled: bool, interval_ms: u64) -> Self {
        self.config.health_check = enabled;
        self.config.health_check_interval_ms = interval_ms;
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = config;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.timeout_ms = timeout_ms;
        self
    }

    pub fn middleware(mut self, config: MiddlewareConfig) -> Self {
        self.config.middleware = config;
        self
    }

    /// Build the final GatewayConfig
    pub fn build(self) -> Result<GatewayConfig, String> {
        if self.config.upstreams.is_empty() {
            return Err("At least one upstream must be configured".to_string());
        }
        Ok(self.config)
    }
}

/// One backend server as written in configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UpstreamConfig {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub tool_prefix: Option<String>,
    #[serde(default)]
    pub resource_prefix: Option<String>,
    #[serde(default)]
    pub prompt_prefix: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_true")]
    pub health_check_enabled: bool,
    /// Overrides the global `timeout_ms`
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Passed to the transport; the gateway core never retries
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            endpoint: String::new(),
            tool_prefix: None,
            resource_prefix: None,
            prompt_prefix: None,
            weight: default_weight(),
            health_check_enabled: true,
            timeout_ms: None,
            retries: 0,
            headers: HashMap::new(),
            health_path: default_health_path(),
        }
    }
}

impl UpstreamConfig {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub failure_window_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            failure_window_ms: 60_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    #[serde(rename = "round_robin", alias = "round-robin")]
    RoundRobin,
    #[serde(rename = "random")]
    Random,
    #[serde(rename = "least_connections", alias = "least-connections")]
    LeastConnections,
    #[serde(rename = "weighted")]
    Weighted,
}

/// Built-in middlewares registered by the server binary.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MiddlewareConfig {
    /// Attach a per-request UUID (`X-Request-ID`)
    pub request_id: bool,
    /// Log request start / completion with latency
    pub timing: bool,
    /// Deadline for the whole chain, terminal included
    pub request_timeout_ms: Option<u64>,
    pub custom_headers: Option<CustomHeadersConfig>,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            request_id: true,
            timing: true,
            request_timeout_ms: None,
            custom_headers: None,
        }
    }
}

/// Response headers added to every request within `scope`.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CustomHeadersConfig {
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub scope: MiddlewareScope,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{"upstreams": [{"name": "weather", "endpoint": "http://weather:9000"}]}"#,
        )
        .unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:8080");
        assert_eq!(config.load_balancing, LoadBalanceStrategy::RoundRobin);
        assert!(config.health_check);
        assert_eq!(config.circuit_breaker, CircuitBreakerConfig::default());
        assert!(config.middleware.request_id);

        let upstream = &config.upstreams[0];
        assert_eq!(upstream.weight, 1);
        assert!(upstream.health_check_enabled);
        assert_eq!(upstream.health_path, "/health");
    }

    #[test]
    fn test_strategy_accepts_hyphenated_aliases() {
        let strategy: LoadBalanceStrategy = serde_json::from_str(r#""least-connections""#).unwrap();
        assert_eq!(strategy, LoadBalanceStrategy::LeastConnections);
        let strategy: LoadBalanceStrategy = serde_json::from_str(r#""weighted""#).unwrap();
        assert_eq!(strategy, LoadBalanceStrategy::Weighted);
    }

    #[test]
    fn test_builder_requires_upstream() {
        assert!(GatewayConfig::builder().build().is_err());

        let config = GatewayConfig::builder()
            .listen_addr("0.0.0.0:9000")
            .upstream(UpstreamConfig::new("weather", "http://weather:9000"))
            .load_balancing(LoadBalanceStrategy::Weighted)
            .health_check(false, 1_000)
            .build()
            .unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.upstreams.len(), 1);
        assert!(!config.health_check);
    }
}
