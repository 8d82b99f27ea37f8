use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use futures_util::future::join_all;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    core::{GatewayService, upstream::Upstream},
    ports::upstream_transport::TransportError,
};

/// Periodic liveness prober for the upstreams of a gateway.
///
/// Holds only a weak reference so a gateway that is dropped without `stop()`
/// ends the loop at the next tick.
pub struct HealthProber {
    gateway: Weak<GatewayService>,
    interval: Duration,
}

impl HealthProber {
    pub fn new(gateway: Weak<GatewayService>, interval: Duration) -> Self {
        Self { gateway, interval }
    }

    /// Run probe rounds every `interval` until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            "Starting health prober with interval: {}ms",
            self.interval.as_millis()
        );

        // First round one interval after start, like the rounds that follow
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(gateway) = self.gateway.upgrade() else {
                        break;
                    };
                    let probed = Self::probe_round(&gateway).await;
                    tracing::debug!("Health probe round completed for {} upstreams", probed);
                }
            }
        }

        tracing::info!("Health prober stopped");
    }

    /// Probe every upstream with health checking enabled, all concurrently.
    ///
    /// Each probe is bounded by its upstream's timeout; a timeout is recorded
    /// as an ordinary probe failure. Returns the number of upstreams probed.
    pub async fn probe_round(gateway: &GatewayService) -> usize {
        let upstreams = gateway.upstreams();
        let targets: Vec<&Arc<Upstream>> = upstreams
            .iter()
            .filter(|upstream| upstream.descriptor().health_check_enabled)
            .collect();

        join_all(
            targets
                .iter()
                .map(|upstream| Self::probe_upstream(gateway, upstream)),
        )
        .await;

        targets.len()
    }

    async fn probe_upstream(gateway: &GatewayService, upstream: &Upstream) {
        let descriptor = upstream.descriptor();
        tracing::debug!(
            "Health checking: {}{}",
            descriptor.endpoint,
            descriptor.health_path
        );

        let outcome =
            match tokio::time::timeout(descriptor.timeout, gateway.transport().probe(descriptor))
                .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err.to_string()),
                Err(_) => Err(TransportError::Timeout(descriptor.timeout.as_millis() as u64)
                    .to_string()),
            };

        gateway.record_probe(upstream, outcome);
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Mutex};

    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::{
        core::{
            GatewaySettings,
            load_balancer::{LoadBalancingStrategy, RoundRobinStrategy},
            upstream::{CircuitState, OperationKind, UpstreamDescriptor},
        },
        ports::upstream_transport::{TransportResult, UpstreamTransport},
    };

    /// Probes fail for names in `down`, hang for names in `hanging`.
    #[derive(Default)]
    struct ScriptedProbes {
        down: Mutex<HashSet<String>>,
        hanging: HashSet<String>,
    }

    #[async_trait]
    impl UpstreamTransport for ScriptedProbes {
        async fn call(
            &self,
            _upstream: &UpstreamDescriptor,
            _kind: OperationKind,
            _name: &str,
            _arguments: Value,
        ) -> TransportResult<Value> {
            Ok(Value::Null)
        }

        async fn probe(&self, upstream: &UpstreamDescriptor) -> TransportResult<()> {
            if self.hanging.contains(&upstream.name) {
                std::future::pending::<()>().await;
            }
            if self.down.lock().unwrap().contains(&upstream.name) {
                return Err(TransportError::ConnectionError("refused".to_string()));
            }
            Ok(())
        }
    }

    async fn gateway_with(transport: ScriptedProbes) -> Arc<GatewayService> {
        let gateway = GatewayService::new(
            GatewaySettings {
                health_check_interval: Duration::from_secs(5),
                ..GatewaySettings::default()
            },
            RoundRobinStrategy::new().boxed(),
            Arc::new(transport),
        );
        for name in ["weather", "news"] {
            gateway
                .register(
                    UpstreamDescriptor::new(name, &format!("http://{name}:9000"))
                        .unwrap()
                        .timeout(Duration::from_secs(1)),
                )
                .await
                .unwrap();
        }
        Arc::new(gateway)
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_marks_upstream_unhealthy() {
        let transport = ScriptedProbes {
            hanging: HashSet::from(["weather".to_string()]),
            ..ScriptedProbes::default()
        };
        let gateway = gateway_with(transport).await;

        assert_eq!(HealthProber::probe_round(&gateway).await, 2);

        let weather = gateway.upstream("weather").await.unwrap();
        let state = weather.health().state();
        assert!(!state.healthy);
        assert_eq!(state.circuit_state, CircuitState::Closed);
        assert!(state.last_error.unwrap().contains("Timeout"));

        // The hanging probe did not hold up the other upstream
        assert!(gateway.upstream("news").await.unwrap().health().is_healthy());
        for _ in 0..4 {
            assert_eq!(gateway.select_upstream().unwrap().name(), "news");
        }
    }

    #[tokio::test]
    async fn test_probe_skips_disabled_upstreams() {
        let gateway = gateway_with(ScriptedProbes::default()).await;
        gateway
            .register(
                UpstreamDescriptor::new("archive", "http://archive:9000")
                    .unwrap()
                    .health_check_enabled(false),
            )
            .await
            .unwrap();

        assert_eq!(HealthProber::probe_round(&gateway).await, 2);
        let archive = gateway.upstream("archive").await.unwrap();
        assert!(archive.health().state().last_check_at.is_none());
    }

    #[tokio::test]
    async fn test_probe_success_downgrades_open_circuit() {
        let gateway = gateway_with(ScriptedProbes::default()).await;
        let weather = gateway.upstream("weather").await.unwrap();
        weather.health().with_state(|state| {
            state.healthy = false;
            state.circuit_state = CircuitState::Open;
            state.last_opened_at = Some(Instant::now());
        });

        gateway.probe_now().await;

        let state = weather.health().state();
        assert!(state.healthy);
        assert_eq!(state.circuit_state, CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_probes_on_interval_until_cancelled() {
        let transport = ScriptedProbes::default();
        transport.down.lock().unwrap().insert("news".to_string());
        let gateway = gateway_with(transport).await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            HealthProber::new(Arc::downgrade(&gateway), Duration::from_secs(5)).run(cancel.clone()),
        );

        // Nothing happens before the first interval elapses
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(gateway.upstream("news").await.unwrap().health().is_healthy());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!gateway.upstream("news").await.unwrap().health().is_healthy());

        cancel.cancel();
        task.await.unwrap();
    }
}
