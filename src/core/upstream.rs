use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::UpstreamConfig;

/// Default probe path appended to an upstream endpoint
pub const DEFAULT_HEALTH_PATH: &str = "/health";

/// Errors related to upstream descriptors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum UpstreamError {
    /// Error when the endpoint is not a usable URL
    #[error("Invalid upstream endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Upstream name must not be empty")]
    EmptyName,
}

/// Result type for upstream operations
pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// A type-safe representation of an upstream endpoint URL
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamEndpoint {
    url: String,
}

impl UpstreamEndpoint {
    /// Creates a new endpoint if the provided string is an absolute http(s) URL
    pub fn new(url: &str) -> UpstreamResult<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| UpstreamError::InvalidEndpoint(format!("{url}: {e}")))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(UpstreamError::InvalidEndpoint(format!(
                "Upstream endpoint must use http:// or https://, got scheme '{}' in {url}",
                parsed.scheme()
            )));
        }

        if parsed.host_str().is_none() {
            return Err(UpstreamError::InvalidEndpoint(format!(
                "Upstream endpoint has no host: {url}"
            )));
        }

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// Join a path onto the endpoint
    pub fn join(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.url, path)
        } else {
            format!("{}/{}", self.url, path)
        }
    }
}

impl FromStr for UpstreamEndpoint {
    type Err = UpstreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UpstreamEndpoint::new(s)
    }
}

impl fmt::Display for UpstreamEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// The family an operation name belongs to; each has its own routing prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Tool,
    Resource,
    Prompt,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Tool => write!(f, "tool"),
            OperationKind::Resource => write!(f, "resource"),
            OperationKind::Prompt => write!(f, "prompt"),
        }
    }
}

/// Static description of a backend server. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamDescriptor {
    pub name: String,
    pub endpoint: UpstreamEndpoint,
    pub tool_prefix: Option<String>,
    pub resource_prefix: Option<String>,
    pub prompt_prefix: Option<String>,
    /// Relative share for weighted balancing, at least 1
    pub weight: u32,
    pub health_check_enabled: bool,
    /// Bound for both forwarded calls and probes
    pub timeout: Duration,
    /// Extra attempts the transport may make; the gateway itself never retries
    pub retries: u32,
    pub headers: HashMap<String, String>,
    pub health_path: String,
}

impl UpstreamDescriptor {
    /// Create a descriptor with default settings.
    pub fn new(name: impl Into<String>, endpoint: &str) -> UpstreamResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(UpstreamError::EmptyName);
        }
        Ok(Self {
            name,
            endpoint: UpstreamEndpoint::new(endpoint)?,
            tool_prefix: None,
            resource_prefix: None,
            prompt_prefix: None,
            weight: 1,
            health_check_enabled: true,
            timeout: Duration::from_secs(30),
            retries: 0,
            headers: HashMap::new(),
            health_path: DEFAULT_HEALTH_PATH.to_string(),
        })
    }

    /// Build a descriptor from configuration, using `default_timeout` when the
    /// upstream does not set its own.
    pub fn from_config(config: &UpstreamConfig, default_timeout: Duration) -> UpstreamResult<Self> {
        let mut descriptor = Self::new(config.name.clone(), &config.endpoint)?
            .weight(config.weight)
            .health_check_enabled(config.health_check_enabled)
            .timeout(
                config
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(default_timeout),
            )
            .retries(config.retries);
        descriptor.tool_prefix = config.tool_prefix.clone();
        descriptor.resource_prefix = config.resource_prefix.clone();
        descriptor.prompt_prefix = config.prompt_prefix.clone();
        descriptor.headers = config.headers.clone();
        descriptor.health_path = config.health_path.clone();
        Ok(descriptor)
    }

    pub fn tool_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tool_prefix = Some(prefix.into());
        self
    }

    pub fn resource_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.resource_prefix = Some(prefix.into());
        self
    }

    pub fn prompt_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prompt_prefix = Some(prefix.into());
        self
    }

    /// Set the weight; zero is raised to 1
    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    pub fn health_check_enabled(mut self, enabled: bool) -> Self {
        self.health_check_enabled = enabled;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// The routing prefix configured for an operation kind
    pub fn prefix_for(&self, kind: OperationKind) -> Option<&str> {
        match kind {
            OperationKind::Tool => self.tool_prefix.as_deref(),
            OperationKind::Resource => self.resource_prefix.as_deref(),
            OperationKind::Prompt => self.prompt_prefix.as_deref(),
        }
    }
}

/// Circuit breaker state of one upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "half-open")]
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Mutable runtime health of one upstream.
///
/// `healthy` is driven by probes and `circuit_state` by call outcomes; the
/// two are independent.
#[derive(Debug, Clone)]
pub struct HealthState {
    pub healthy: bool,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub circuit_state: CircuitState,
    pub failure_count: u32,
    pub failure_window_start: Option<Instant>,
    pub last_opened_at: Option<Instant>,
    /// A half-open trial call is currently in flight
    pub trial_in_flight: bool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            healthy: true,
            last_check_at: None,
            last_error: None,
            circuit_state: CircuitState::Closed,
            failure_count: 0,
            failure_window_start: None,
            last_opened_at: None,
            trial_in_flight: false,
        }
    }
}

impl HealthState {
    /// Eligible for load balancing: healthy and not open
    pub fn is_eligible(&self) -> bool {
        self.healthy && self.circuit_state != CircuitState::Open
    }

    /// Whether load balancing may pick this upstream at `now`.
    ///
    /// Narrower than [`is_eligible`](Self::is_eligible) for a half-open
    /// upstream whose trial is already in flight. For an upstream no prober
    /// revisits (`probed == false`), an open circuit whose reset timeout has
    /// elapsed is selectable so the next call can be its trial.
    pub fn is_selectable(&self, now: Instant, reset_timeout: Duration, probed: bool) -> bool {
        match self.circuit_state {
            CircuitState::Closed => self.healthy,
            CircuitState::HalfOpen => !self.trial_in_flight && (self.healthy || !probed),
            CircuitState::Open => {
                !probed
                    && self
                        .last_opened_at
                        .is_none_or(|at| now.saturating_duration_since(at) >= reset_timeout)
            }
        }
    }

    /// Apply a successful probe. An open circuit is only downgraded to
    /// half-open; closing it takes a successful real call.
    ///
    /// Returns true when the upstream was previously unhealthy.
    pub fn record_probe_success(&mut self, at: DateTime<Utc>) -> bool {
        let recovered = !self.healthy;
        self.healthy = true;
        self.last_error = None;
        self.last_check_at = Some(at);
        if self.circuit_state == CircuitState::Open {
            self.circuit_state = CircuitState::HalfOpen;
            self.trial_in_flight = false;
        }
        recovered
    }

    /// Apply a failed probe. The circuit state is left untouched.
    ///
    /// Returns true when the upstream was previously healthy.
    pub fn record_probe_failure(&mut self, error: impl Into<String>, at: DateTime<Utc>) -> bool {
        let lost = self.healthy;
        self.healthy = false;
        self.last_error = Some(error.into());
        self.last_check_at = Some(at);
        lost
    }
}

/// Tracks the health and circuit state of an upstream.
///
/// All mutation of [`HealthState`] is serialized through one mutex; the
/// active connection counter is a separate atomic so load balancing can read
/// it without locking.
#[derive(Debug, Default)]
pub struct UpstreamHealth {
    state: Mutex<HealthState>,
    active_connections: AtomicUsize,
}

impl UpstreamHealth {
    fn lock(&self) -> MutexGuard<'_, HealthState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive access to the state
    pub fn with_state<R>(&self, f: impl FnOnce(&mut HealthState) -> R) -> R {
        f(&mut self.lock())
    }

    /// Copy of the current state
    pub fn state(&self) -> HealthState {
        self.lock().clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.lock().healthy
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.lock().circuit_state
    }

    pub fn is_eligible(&self) -> bool {
        self.lock().is_eligible()
    }

    pub fn is_selectable(&self, now: Instant, reset_timeout: Duration, probed: bool) -> bool {
        self.lock().is_selectable(now, reset_timeout, probed)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    pub(crate) fn increment_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrement_connections(&self) {
        // Paired with increment_connections by CallPermit, so never underflows
        let _ = self.active_connections.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |current| Some(current.saturating_sub(1)),
        );
    }
}

/// A registered upstream: immutable descriptor plus runtime health.
#[derive(Debug)]
pub struct Upstream {
    descriptor: UpstreamDescriptor,
    health: UpstreamHealth,
}

impl Upstream {
    pub fn new(descriptor: UpstreamDescriptor) -> Self {
        Self {
            descriptor,
            health: UpstreamHealth::default(),
        }
    }

    pub fn descriptor(&self) -> &UpstreamDescriptor {
        &self.descriptor
    }

    pub fn health(&self) -> &UpstreamHealth {
        &self.health
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn weight(&self) -> u32 {
        self.descriptor.weight
    }

    pub fn active_connections(&self) -> usize {
        self.health.active_connections()
    }

    pub fn is_eligible(&self) -> bool {
        self.health.is_eligible()
    }

    /// Serializable view of the current health
    pub fn snapshot(&self) -> HealthSnapshot {
        let state = self.health.state();
        HealthSnapshot {
            upstream: self.descriptor.name.clone(),
            endpoint: self.descriptor.endpoint.to_string(),
            healthy: state.healthy,
            circuit_state: state.circuit_state,
            active_connections: self.health.active_connections(),
            failure_count: state.failure_count,
            last_check_at: state.last_check_at,
            last_error: state.last_error,
            opened_for_ms: state
                .last_opened_at
                .filter(|_| state.circuit_state != CircuitState::Closed)
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }
}

/// Point-in-time health report for one upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub upstream: String,
    pub endpoint: String,
    pub healthy: bool,
    pub circuit_state: CircuitState,
    pub active_connections: usize,
    pub failure_count: u32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Milliseconds since the circuit last opened, while not closed
    pub opened_for_ms: Option<u64>,
}
