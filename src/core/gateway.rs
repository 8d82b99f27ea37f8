//! Core gateway orchestration service.
//!
//! The `GatewayService` owns the registered upstreams and their runtime
//! health. It provides:
//! * Prefix routing of tool, resource and prompt names to an owning upstream
//! * Load-balanced selection over the eligible set when no prefix matches
//! * Forwarding through the per-upstream circuit breaker
//! * Lifecycle of the periodic health prober
//! * Health snapshots for diagnostics
//!
//! The network itself is reached only through the injected
//! [`UpstreamTransport`], so the service is testable with in-process mocks.
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use arc_swap::ArcSwap;
use eyre::{Result, WrapErr};
use scc::HashMap;
use serde_json::Value;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    adapters::health_checker::HealthProber,
    config::GatewayConfig,
    core::{
        circuit_breaker::{CallPermit, CircuitBreaker, Transition},
        error::{GatewayError, GatewayResult},
        load_balancer::{LoadBalancerFactory, LoadBalancingStrategy},
        upstream::{CircuitState, HealthSnapshot, OperationKind, Upstream, UpstreamDescriptor},
    },
    ports::upstream_transport::{TransportError, UpstreamTransport},
    tracing_setup::create_upstream_span,
};

/// Callback invoked when an upstream is found unhealthy, with the error seen
pub type UnhealthyHook = Arc<dyn Fn(&UpstreamDescriptor, &str) + Send + Sync>;

/// Callback invoked when an upstream becomes usable again
pub type RecoveredHook = Arc<dyn Fn(&UpstreamDescriptor) + Send + Sync>;

/// Notification callbacks for health transitions.
///
/// `on_upstream_unhealthy` fires when a probe first fails or when the circuit
/// opens; `on_upstream_recovered` fires when a probe succeeds for an upstream
/// whose circuit is closed, or when a half-open trial call closes the circuit.
/// Hooks run after the upstream's state lock has been released.
#[derive(Clone, Default)]
pub struct GatewayHooks {
    on_upstream_unhealthy: Option<UnhealthyHook>,
    on_upstream_recovered: Option<RecoveredHook>,
}

impl GatewayHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_upstream_unhealthy(
        mut self,
        hook: impl Fn(&UpstreamDescriptor, &str) + Send + Sync + 'static,
    ) -> Self {
        self.on_upstream_unhealthy = Some(Arc::new(hook));
        self
    }

    pub fn on_upstream_recovered(
        mut self,
        hook: impl Fn(&UpstreamDescriptor) + Send + Sync + 'static,
    ) -> Self {
        self.on_upstream_recovered = Some(Arc::new(hook));
        self
    }

    fn unhealthy(&self, descriptor: &UpstreamDescriptor, error: &str) {
        if let Some(hook) = &self.on_upstream_unhealthy {
            hook(descriptor, error);
        }
    }

    fn recovered(&self, descriptor: &UpstreamDescriptor) {
        if let Some(hook) = &self.on_upstream_recovered {
            hook(descriptor);
        }
    }
}

impl fmt::Debug for GatewayHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayHooks")
            .field("on_upstream_unhealthy", &self.on_upstream_unhealthy.is_some())
            .field("on_upstream_recovered", &self.on_upstream_recovered.is_some())
            .finish()
    }
}

/// Runtime settings of the gateway, derived from [`GatewayConfig`].
#[derive(Debug, Clone, Copy)]
pub struct GatewaySettings {
    pub health_check: bool,
    pub health_check_interval: Duration,
    /// Bound for upstreams built from configuration without their own timeout
    pub default_timeout: Duration,
    pub circuit_breaker: CircuitBreaker,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

impl GatewaySettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            health_check: config.health_check,
            health_check_interval: Duration::from_millis(config.health_check_interval_ms),
            default_timeout: Duration::from_millis(config.timeout_ms),
            circuit_breaker: CircuitBreaker::from_config(&config.circuit_breaker),
        }
    }
}

/// Where an operation will be sent.
#[derive(Debug, Clone)]
pub struct Route {
    pub upstream: Arc<Upstream>,
    /// Operation name as the upstream knows it, prefix stripped
    pub operation: String,
    /// Whether the upstream was chosen by prefix rather than load balancing
    pub by_prefix: bool,
}

struct ProberHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Central orchestrator for upstream routing, selection, forwarding and
/// health tracking.
///
/// Build with [`GatewayService::new`] or [`GatewayService::from_config`] and
/// share behind an `Arc`; [`GatewayService::start`] needs one to hand the
/// prober a weak reference.
pub struct GatewayService {
    /// Registration order is routing order
    upstreams: ArcSwap<Vec<Arc<Upstream>>>,
    index: HashMap<String, Arc<Upstream>>,
    strategy: Box<dyn LoadBalancingStrategy>,
    settings: GatewaySettings,
    hooks: GatewayHooks,
    transport: Arc<dyn UpstreamTransport>,
    prober: Mutex<Option<ProberHandle>>,
}

impl GatewayService {
    /// Create an empty gateway.
    pub fn new(
        settings: GatewaySettings,
        strategy: Box<dyn LoadBalancingStrategy>,
        transport: Arc<dyn UpstreamTransport>,
    ) -> Self {
        Self {
            upstreams: ArcSwap::from_pointee(Vec::new()),
            index: HashMap::new(),
            strategy,
            settings,
            hooks: GatewayHooks::default(),
            transport,
            prober: Mutex::new(None),
        }
    }

    /// Attach health transition callbacks
    pub fn with_hooks(mut self, hooks: GatewayHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Build a gateway and register every configured upstream.
    pub async fn from_config(
        config: &GatewayConfig,
        transport: Arc<dyn UpstreamTransport>,
        hooks: GatewayHooks,
    ) -> Result<Arc<Self>> {
        let settings = GatewaySettings::from_config(config);
        let gateway = Self::new(
            settings,
            LoadBalancerFactory::create_strategy(&config.load_balancing),
            transport,
        )
        .with_hooks(hooks);

        for upstream in &config.upstreams {
            let descriptor = UpstreamDescriptor::from_config(upstream, settings.default_timeout)
                .wrap_err_with(|| format!("Invalid upstream '{}'", upstream.name))?;
            gateway.register(descriptor).await?;
        }

        tracing::info!(
            "Gateway built with {} upstreams using {} load balancing",
            gateway.upstream_count(),
            gateway.strategy.name()
        );
        Ok(Arc::new(gateway))
    }

    /// Register an upstream with fresh health state.
    pub async fn register(&self, descriptor: UpstreamDescriptor) -> GatewayResult<Arc<Upstream>> {
        let name = descriptor.name.clone();
        let upstream = Arc::new(Upstream::new(descriptor));

        if self
            .index
            .insert_async(name.clone(), upstream.clone())
            .await
            .is_err()
        {
            return Err(GatewayError::DuplicateUpstream(name));
        }

        self.upstreams.rcu(|current| {
            let mut updated = current.as_ref().clone();
            updated.push(upstream.clone());
            updated
        });

        tracing::info!(
            "Registered upstream {} at {}",
            name,
            upstream.descriptor().endpoint
        );
        Ok(upstream)
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn transport(&self) -> &Arc<dyn UpstreamTransport> {
        &self.transport
    }

    /// Look up an upstream by name
    pub async fn upstream(&self, name: &str) -> Option<Arc<Upstream>> {
        self.index
            .get_async(name)
            .await
            .map(|entry| entry.get().clone())
    }

    /// All upstreams in registration order
    pub fn upstreams(&self) -> Arc<Vec<Arc<Upstream>>> {
        self.upstreams.load_full()
    }

    pub fn upstream_count(&self) -> usize {
        self.upstreams.load().len()
    }

    /// Count of upstreams currently eligible for load balancing
    pub fn healthy_upstream_count(&self) -> usize {
        self.upstreams
            .load()
            .iter()
            .filter(|upstream| upstream.is_eligible())
            .count()
    }

    /// Point-in-time health of every upstream, in registration order
    pub fn get_upstream_health(&self) -> Vec<HealthSnapshot> {
        self.upstreams
            .load()
            .iter()
            .map(|upstream| upstream.snapshot())
            .collect()
    }

    /// Pick one upstream among those that are healthy and not open.
    ///
    /// A half-open upstream already running its trial is skipped. An
    /// upstream that is never probed becomes a candidate again once its
    /// reset timeout has elapsed, since no probe will bring it back.
    pub fn select_upstream(&self) -> GatewayResult<Arc<Upstream>> {
        let now = Instant::now();
        let reset_timeout = self.settings.circuit_breaker.reset_timeout();
        let eligible: Vec<Arc<Upstream>> = self
            .upstreams
            .load()
            .iter()
            .filter(|upstream| {
                upstream
                    .health()
                    .is_selectable(now, reset_timeout, self.is_probed(upstream))
            })
            .cloned()
            .collect();

        self.strategy
            .select_target(&eligible)
            .ok_or(GatewayError::NoEligibleUpstream)
    }

    fn is_probed(&self, upstream: &Upstream) -> bool {
        self.settings.health_check && upstream.descriptor().health_check_enabled
    }

    pub fn find_upstream_for_tool(&self, name: &str) -> GatewayResult<Route> {
        self.find_route(OperationKind::Tool, name)
    }

    pub fn find_upstream_for_resource(&self, name: &str) -> GatewayResult<Route> {
        self.find_route(OperationKind::Resource, name)
    }

    pub fn find_upstream_for_prompt(&self, name: &str) -> GatewayResult<Route> {
        self.find_route(OperationKind::Prompt, name)
    }

    /// Resolve the owning upstream of an operation.
    ///
    /// The first upstream, in registration order, whose prefix for `kind` is a
    /// prefix of `name` owns it regardless of its health; the circuit breaker
    /// decides whether the call goes out. Otherwise the load balancer chooses
    /// among all eligible upstreams and the name is forwarded unchanged.
    pub fn find_route(&self, kind: OperationKind, name: &str) -> GatewayResult<Route> {
        let owner = self.upstreams.load().iter().find_map(|upstream| {
            let prefix = upstream.descriptor().prefix_for(kind)?;
            name.strip_prefix(prefix)
                .map(|stripped| (upstream.clone(), stripped.to_string()))
        });

        if let Some((upstream, operation)) = owner {
            tracing::debug!("{} {} routed to {} by prefix", kind, name, upstream.name());
            return Ok(Route {
                upstream,
                operation,
                by_prefix: true,
            });
        }

        let upstream = self.select_upstream()?;
        tracing::debug!(
            "{} {} routed to {} by {}",
            kind,
            name,
            upstream.name(),
            self.strategy.name()
        );
        Ok(Route {
            upstream,
            operation: name.to_string(),
            by_prefix: false,
        })
    }

    /// Route an operation and call it through the circuit breaker.
    ///
    /// `CircuitOpen` and `NoEligibleUpstream` are returned immediately without
    /// any network attempt. The call is bounded by the upstream's timeout; the
    /// gateway makes exactly one attempt.
    pub async fn forward_call(
        &self,
        kind: OperationKind,
        name: &str,
        arguments: Value,
    ) -> GatewayResult<Value> {
        let route = self.find_route(kind, name)?;
        let permit = CallPermit::acquire(
            &self.settings.circuit_breaker,
            &route.upstream,
            Instant::now(),
        )?;

        let upstream = route.upstream;
        let descriptor = upstream.descriptor();
        let span = create_upstream_span(upstream.name(), &kind.to_string(), &route.operation);

        let outcome = tokio::time::timeout(
            descriptor.timeout,
            self.transport
                .call(descriptor, kind, &route.operation, arguments),
        )
        .instrument(span)
        .await;

        match outcome {
            Ok(Ok(value)) => {
                let transition = permit.succeed();
                self.report(&upstream, transition);
                Ok(value)
            }
            Ok(Err(source)) => {
                let transition = permit.fail(&source.to_string(), Instant::now());
                self.report(&upstream, transition);
                Err(GatewayError::Transport {
                    upstream: upstream.name().to_string(),
                    source,
                })
            }
            Err(_) => {
                let error = TransportError::Timeout(descriptor.timeout.as_millis() as u64);
                let transition = permit.fail(&error.to_string(), Instant::now());
                self.report(&upstream, transition);
                Err(GatewayError::Timeout {
                    upstream: upstream.name().to_string(),
                    after: descriptor.timeout,
                })
            }
        }
    }

    /// Apply one probe outcome to an upstream and fire hooks on health edges.
    pub fn record_probe(&self, upstream: &Upstream, outcome: Result<(), String>) {
        let now = chrono::Utc::now();
        match outcome {
            Ok(()) => {
                let (was_unhealthy, circuit) = upstream.health().with_state(|state| {
                    let was_unhealthy = state.record_probe_success(now);
                    (was_unhealthy, state.circuit_state)
                });
                tracing::debug!("Probe of {} succeeded", upstream.name());
                if was_unhealthy {
                    tracing::info!(
                        "Upstream {} is now HEALTHY (circuit {})",
                        upstream.name(),
                        circuit
                    );
                    if circuit == CircuitState::Closed {
                        self.hooks.recovered(upstream.descriptor());
                    }
                }
            }
            Err(error) => {
                let was_healthy = upstream
                    .health()
                    .with_state(|state| state.record_probe_failure(error.clone(), now));
                tracing::warn!("Probe of {} failed: {}", upstream.name(), error);
                if was_healthy {
                    tracing::warn!("Upstream {} is now UNHEALTHY", upstream.name());
                    self.hooks.unhealthy(upstream.descriptor(), &error);
                }
            }
        }
    }

    fn report(&self, upstream: &Upstream, transition: Option<Transition>) {
        match transition {
            Some(Transition::Opened { error }) => {
                self.hooks.unhealthy(upstream.descriptor(), &error);
            }
            Some(Transition::Recovered) => self.hooks.recovered(upstream.descriptor()),
            Some(Transition::Reopened { .. }) | None => {}
        }
    }

    /// Run one probe round immediately.
    pub async fn probe_now(&self) -> usize {
        HealthProber::probe_round(self).await
    }

    /// Begin periodic probing. Idempotent; does nothing when health checking
    /// is disabled.
    pub fn start(self: &Arc<Self>) {
        if !self.settings.health_check {
            tracing::info!("Health checking is disabled");
            return;
        }

        let mut prober = self.prober.lock().unwrap_or_else(PoisonError::into_inner);
        if prober.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            HealthProber::new(Arc::downgrade(self), self.settings.health_check_interval)
                .run(cancel.clone()),
        );
        *prober = Some(ProberHandle { cancel, task });
    }

    /// Stop periodic probing and wait for the prober task to exit.
    pub async fn stop(&self) {
        let handle = self
            .prober
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(ProberHandle { cancel, task }) = handle {
            cancel.cancel();
            if let Err(e) = task.await {
                tracing::error!("Health prober task failed: {}", e);
            }
        }
    }

    /// Whether the prober task is currently running
    pub fn is_probing(&self) -> bool {
        self.prober
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{
        config::{LoadBalanceStrategy, UpstreamConfig},
        core::load_balancer::RoundRobinStrategy,
        ports::upstream_transport::TransportResult,
    };

    /// Echoes the upstream and operation it was called with.
    #[derive(Default)]
    struct EchoTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UpstreamTransport for EchoTransport {
        async fn call(
            &self,
            upstream: &UpstreamDescriptor,
            kind: OperationKind,
            name: &str,
            arguments: Value,
        ) -> TransportResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({
                "upstream": upstream.name,
                "kind": kind,
                "name": name,
                "arguments": arguments,
            }))
        }

        async fn probe(&self, _upstream: &UpstreamDescriptor) -> TransportResult<()> {
            Ok(())
        }
    }

    fn descriptor(name: &str, prefix: &str) -> UpstreamDescriptor {
        UpstreamDescriptor::new(name, &format!("http://{name}:9000"))
            .unwrap()
            .tool_prefix(prefix)
    }

    async fn weather_and_news() -> GatewayService {
        let gateway = GatewayService::new(
            GatewaySettings::default(),
            RoundRobinStrategy::new().boxed(),
            Arc::new(EchoTransport::default()),
        );
        gateway
            .register(descriptor("weather", "weather_"))
            .await
            .unwrap();
        gateway.register(descriptor("news", "news_")).await.unwrap();
        gateway
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let gateway = weather_and_news().await;
        let err = gateway
            .register(descriptor("weather", "other_"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::DuplicateUpstream(name) if name == "weather"));
        assert_eq!(gateway.upstream_count(), 2);
        assert!(gateway.upstream("news").await.is_some());
        assert!(gateway.upstream("sports").await.is_none());
    }

    #[tokio::test]
    async fn test_prefix_routing_strips_prefix() {
        let gateway = weather_and_news().await;

        let route = gateway.find_upstream_for_tool("weather_forecast").unwrap();
        assert_eq!(route.upstream.name(), "weather");
        assert_eq!(route.operation, "forecast");
        assert!(route.by_prefix);

        let route = gateway.find_upstream_for_tool("news_headlines").unwrap();
        assert_eq!(route.upstream.name(), "news");
    }

    #[tokio::test]
    async fn test_unprefixed_name_falls_back_to_load_balancer() {
        let gateway = weather_and_news().await;

        let picks: Vec<String> = (0..4)
            .map(|_| {
                let route = gateway.find_upstream_for_tool("generic_tool").unwrap();
                assert!(!route.by_prefix);
                assert_eq!(route.operation, "generic_tool");
                route.upstream.name().to_string()
            })
            .collect();
        assert_eq!(picks, vec!["weather", "news", "weather", "news"]);

        // Tool prefixes do not apply to resources
        let route = gateway.find_upstream_for_resource("weather_map").unwrap();
        assert!(!route.by_prefix);
    }

    #[tokio::test]
    async fn test_first_registered_prefix_wins() {
        let gateway = weather_and_news().await;
        gateway
            .register(descriptor("weather_eu", "weather_eu_"))
            .await
            .unwrap();

        let route = gateway.find_upstream_for_tool("weather_eu_rain").unwrap();
        assert_eq!(route.upstream.name(), "weather");
        assert_eq!(route.operation, "eu_rain");
    }

    #[tokio::test]
    async fn test_select_skips_ineligible_upstreams() {
        let gateway = weather_and_news().await;
        let weather = gateway.upstream("weather").await.unwrap();
        gateway.record_probe(&weather, Err("refused".to_string()));

        for _ in 0..4 {
            assert_eq!(gateway.select_upstream().unwrap().name(), "news");
        }
        assert_eq!(gateway.healthy_upstream_count(), 1);

        let news = gateway.upstream("news").await.unwrap();
        news.health()
            .with_state(|state| state.circuit_state = CircuitState::Open);
        assert!(matches!(
            gateway.select_upstream(),
            Err(GatewayError::NoEligibleUpstream)
        ));
        assert!(matches!(
            gateway.find_upstream_for_prompt("summary"),
            Err(GatewayError::NoEligibleUpstream)
        ));
    }

    #[tokio::test]
    async fn test_select_skips_half_open_upstream_with_trial_in_flight() {
        let gateway = weather_and_news().await;
        let weather = gateway.upstream("weather").await.unwrap();
        weather.health().with_state(|state| {
            state.circuit_state = CircuitState::HalfOpen;
            state.trial_in_flight = true;
        });

        for _ in 0..4 {
            assert_eq!(gateway.select_upstream().unwrap().name(), "news");
        }
        // Still counted as eligible; only selection avoids the busy trial
        assert_eq!(gateway.healthy_upstream_count(), 2);

        weather
            .health()
            .with_state(|state| state.trial_in_flight = false);
        let picks: Vec<String> = (0..2)
            .map(|_| gateway.select_upstream().unwrap().name().to_string())
            .collect();
        assert!(picks.contains(&"weather".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unprobed_open_upstream_returns_after_reset_timeout() {
        let gateway = GatewayService::new(
            GatewaySettings {
                health_check: false,
                ..GatewaySettings::default()
            },
            RoundRobinStrategy::new().boxed(),
            Arc::new(EchoTransport::default()),
        );
        gateway.register(descriptor("weather", "weather_")).await.unwrap();
        let weather = gateway.upstream("weather").await.unwrap();
        weather.health().with_state(|state| {
            state.healthy = false;
            state.circuit_state = CircuitState::Open;
            state.last_opened_at = Some(Instant::now());
        });

        assert!(matches!(
            gateway.select_upstream(),
            Err(GatewayError::NoEligibleUpstream)
        ));

        tokio::time::advance(gateway.settings().circuit_breaker.reset_timeout()).await;
        assert_eq!(gateway.select_upstream().unwrap().name(), "weather");
    }

    #[tokio::test]
    async fn test_forward_call_reaches_owning_upstream() {
        let gateway = weather_and_news().await;
        let result = gateway
            .forward_call(OperationKind::Tool, "weather_forecast", json!({"city": "Oslo"}))
            .await
            .unwrap();

        assert_eq!(result["upstream"], "weather");
        assert_eq!(result["name"], "forecast");
        assert_eq!(result["kind"], "tool");
        assert_eq!(result["arguments"]["city"], "Oslo");

        let weather = gateway.upstream("weather").await.unwrap();
        assert_eq!(weather.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_probe_hooks_fire_on_edges_only() {
        let unhealthy = Arc::new(AtomicUsize::new(0));
        let recovered = Arc::new(AtomicUsize::new(0));
        let hooks = GatewayHooks::new()
            .on_upstream_unhealthy({
                let unhealthy = unhealthy.clone();
                move |_, _| {
                    unhealthy.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_upstream_recovered({
                let recovered = recovered.clone();
                move |_| {
                    recovered.fetch_add(1, Ordering::SeqCst);
                }
            });

        let gateway = weather_and_news().await.with_hooks(hooks);
        let weather = gateway.upstream("weather").await.unwrap();

        gateway.record_probe(&weather, Err("refused".to_string()));
        gateway.record_probe(&weather, Err("refused".to_string()));
        assert_eq!(unhealthy.load(Ordering::SeqCst), 1);
        assert_eq!(
            weather.health().state().last_error.as_deref(),
            Some("refused")
        );

        gateway.record_probe(&weather, Ok(()));
        gateway.record_probe(&weather, Ok(()));
        assert_eq!(recovered.load(Ordering::SeqCst), 1);
        assert!(weather.health().is_healthy());
    }

    #[tokio::test]
    async fn test_from_config_registers_upstreams() {
        let config = GatewayConfig::builder()
            .upstream(UpstreamConfig::new("weather", "http://weather:9000"))
            .upstream(UpstreamConfig {
                timeout_ms: Some(500),
                ..UpstreamConfig::new("news", "http://news:9000")
            })
            .load_balancing(LoadBalanceStrategy::LeastConnections)
            .timeout_ms(2_000)
            .build()
            .unwrap();

        let transport = Arc::new(EchoTransport::default());
        let gateway = GatewayService::from_config(&config, transport, GatewayHooks::new())
            .await
            .unwrap();

        let snapshots = gateway.get_upstream_health();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].upstream, "weather");
        let weather = gateway.upstream("weather").await.unwrap();
        assert_eq!(weather.descriptor().timeout, Duration::from_secs(2));
        let news = gateway.upstream("news").await.unwrap();
        assert_eq!(news.descriptor().timeout, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_from_config_rejects_duplicate_names() {
        let config = GatewayConfig::builder()
            .upstream(UpstreamConfig::new("weather", "http://weather:9000"))
            .upstream(UpstreamConfig::new("weather", "http://weather-2:9000"))
            .build()
            .unwrap();

        let transport = Arc::new(EchoTransport::default());
        let result = GatewayService::from_config(&config, transport, GatewayHooks::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_joins() {
        let gateway = Arc::new(weather_and_news().await);
        gateway.start();
        gateway.start();
        assert!(gateway.is_probing());

        gateway.stop().await;
        assert!(!gateway.is_probing());
        // Stopping twice is harmless
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_start_is_noop_when_health_check_disabled() {
        let settings = GatewaySettings {
            health_check: false,
            ..GatewaySettings::default()
        };
        let gateway = Arc::new(GatewayService::new(
            settings,
            RoundRobinStrategy::new().boxed(),
            Arc::new(EchoTransport::default()),
        ));
        gateway.start();
        assert!(!gateway.is_probing());
    }
}
