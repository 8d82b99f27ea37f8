use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use rand::Rng;

use crate::{config::LoadBalanceStrategy, core::upstream::Upstream};

/// Trait defining the interface for load balancing strategies.
///
/// Callers pass only eligible candidates, in registration order.
pub trait LoadBalancingStrategy: Send + Sync + 'static {
    /// Select a target from a list of candidates
    fn select_target(&self, candidates: &[Arc<Upstream>]) -> Option<Arc<Upstream>>;

    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Create a new instance of this strategy as a boxed trait object
    fn boxed(self) -> Box<dyn LoadBalancingStrategy>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}

/// Round-robin load balancing strategy
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinStrategy {
    /// Create a new round-robin strategy
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select_target(&self, candidates: &[Arc<Upstream>]) -> Option<Arc<Upstream>> {
        if candidates.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::SeqCst);
        Some(candidates[count % candidates.len()].clone())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Random selection load balancing strategy
pub struct RandomStrategy;

impl Default for RandomStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomStrategy {
    /// Create a new random selection strategy
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancingStrategy for RandomStrategy {
    fn select_target(&self, candidates: &[Arc<Upstream>]) -> Option<Arc<Upstream>> {
        if candidates.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..candidates.len());
        Some(candidates[index].clone())
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Picks the candidate with the fewest active connections; ties go to the
/// earliest registered.
#[derive(Default)]
pub struct LeastConnectionsStrategy;

impl LoadBalancingStrategy for LeastConnectionsStrategy {
    fn select_target(&self, candidates: &[Arc<Upstream>]) -> Option<Arc<Upstream>> {
        candidates
            .iter()
            .min_by_key(|upstream| upstream.active_connections())
            .cloned()
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

/// Random draw proportional to each candidate's configured weight.
#[derive(Default)]
pub struct WeightedStrategy;

impl LoadBalancingStrategy for WeightedStrategy {
    fn select_target(&self, candidates: &[Arc<Upstream>]) -> Option<Arc<Upstream>> {
        let total: u64 = candidates
            .iter()
            .map(|upstream| u64::from(upstream.weight().max(1)))
            .sum();
        if total == 0 {
            return None;
        }

        let mut draw = rand::rng().random_range(0..total);
        for upstream in candidates {
            let weight = u64::from(upstream.weight().max(1));
            if draw < weight {
                return Some(upstream.clone());
            }
            draw -= weight;
        }
        candidates.last().cloned()
    }

    fn name(&self) -> &'static str {
        "weighted"
    }
}

/// Factory for creating load balancing strategies from configuration
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    /// Create a new load balancing strategy based on configuration
    pub fn create_strategy(strategy: &LoadBalanceStrategy) -> Box<dyn LoadBalancingStrategy> {
        match strategy {
            LoadBalanceStrategy::RoundRobin => RoundRobinStrategy::new().boxed(),
            LoadBalanceStrategy::Random => RandomStrategy::new().boxed(),
            LoadBalanceStrategy::LeastConnections => LeastConnectionsStrategy.boxed(),
            LoadBalanceStrategy::Weighted => WeightedStrategy.boxed(),
        }
    }
}
