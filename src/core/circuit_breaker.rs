//! Per-upstream circuit breaker.
//!
//! # States
//! - Closed: calls pass through, failures are counted inside a window
//! - Open: calls fail fast with [`GatewayError::CircuitOpen`], no attempt made
//! - Half-open: exactly one trial call may be in flight
//!
//! # Transitions
//! ```text
//! Closed    -> Open:      failure_count >= threshold within the failure window
//! Open      -> Half-open: reset timeout elapsed since last_opened_at (or a probe succeeded)
//! Half-open -> Closed:    the trial call succeeds
//! Half-open -> Open:      the trial call fails
//! ```
//!
//! The breaker itself is stateless: it operates on the [`HealthState`] of the
//! upstream under that upstream's lock, so every transition is serialized per
//! upstream. Times are passed in explicitly.
use std::{sync::Arc, time::Duration};

use tokio::time::Instant;

use crate::{
    config::CircuitBreakerConfig,
    core::{
        error::GatewayError,
        upstream::{CircuitState, HealthState, Upstream},
    },
};

/// How a call was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed
    Normal,
    /// The single half-open trial call
    Trial,
}

/// A state change worth reporting to hooks and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Closed -> open after too many failures
    Opened { error: String },
    /// Half-open -> open after a failed trial
    Reopened { error: String },
    /// Half-open -> closed after a successful trial
    Recovered,
}

/// Thresholds of the breaker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    failure_window: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::from_config(&CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration, failure_window: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            failure_window,
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(
            config.failure_threshold,
            Duration::from_millis(config.reset_timeout_ms),
            Duration::from_millis(config.failure_window_ms),
        )
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }

    /// Decide whether a call may be attempted.
    pub fn admit(
        &self,
        state: &mut HealthState,
        upstream: &str,
        now: Instant,
    ) -> Result<Admission, GatewayError> {
        match state.circuit_state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let elapsed = state
                    .last_opened_at
                    .map(|opened| now.saturating_duration_since(opened));
                match elapsed {
                    Some(elapsed) if elapsed < self.reset_timeout => {
                        Err(GatewayError::CircuitOpen {
                            upstream: upstream.to_string(),
                            retry_after: Some(self.reset_timeout - elapsed),
                        })
                    }
                    _ => {
                        tracing::info!(
                            "Circuit for upstream {} is now HALF-OPEN, admitting trial call",
                            upstream
                        );
                        state.circuit_state = CircuitState::HalfOpen;
                        state.trial_in_flight = true;
                        Ok(Admission::Trial)
                    }
                }
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    Err(GatewayError::CircuitOpen {
                        upstream: upstream.to_string(),
                        retry_after: None,
                    })
                } else {
                    state.trial_in_flight = true;
                    Ok(Admission::Trial)
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(
        &self,
        state: &mut HealthState,
        admission: Admission,
        upstream: &str,
    ) -> Option<Transition> {
        match (admission, state.circuit_state) {
            (Admission::Trial, CircuitState::HalfOpen) => {
                state.circuit_state = CircuitState::Closed;
                state.trial_in_flight = false;
                state.failure_count = 0;
                state.failure_window_start = None;
                state.healthy = true;
                state.last_error = None;
                tracing::info!("Circuit for upstream {} is now CLOSED", upstream);
                Some(Transition::Recovered)
            }
            (Admission::Normal, CircuitState::Closed) => {
                state.failure_count = 0;
                state.failure_window_start = None;
                None
            }
            // Outcome of a call admitted under an earlier state
            _ => None,
        }
    }

    /// Record a failed call.
    pub fn record_failure(
        &self,
        state: &mut HealthState,
        admission: Admission,
        upstream: &str,
        error: &str,
        now: Instant,
    ) -> Option<Transition> {
        state.last_error = Some(error.to_string());

        match (admission, state.circuit_state) {
            (Admission::Trial, CircuitState::HalfOpen) => {
                state.circuit_state = CircuitState::Open;
                state.trial_in_flight = false;
                state.last_opened_at = Some(now);
                tracing::warn!(
                    "Trial call to upstream {} failed, circuit is OPEN again: {}",
                    upstream,
                    error
                );
                Some(Transition::Reopened {
                    error: error.to_string(),
                })
            }
            (Admission::Normal, CircuitState::Closed) => {
                let window_expired = state.failure_window_start.is_none_or(|start| {
                    now.saturating_duration_since(start) >= self.failure_window
                });
                if window_expired {
                    state.failure_count = 0;
                    state.failure_window_start = Some(now);
                }
                state.failure_count += 1;

                tracing::debug!(
                    "Call to upstream {} failed ({}/{}): {}",
                    upstream,
                    state.failure_count,
                    self.failure_threshold,
                    error
                );

                if state.failure_count >= self.failure_threshold {
                    state.circuit_state = CircuitState::Open;
                    state.last_opened_at = Some(now);
                    state.healthy = false;
                    tracing::warn!(
                        "Circuit for upstream {} is now OPEN (after {} failures): {}",
                        upstream,
                        state.failure_count,
                        error
                    );
                    Some(Transition::Opened {
                        error: error.to_string(),
                    })
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Give up a trial slot whose call never reported an outcome.
    fn release_trial(&self, state: &mut HealthState) {
        if state.circuit_state == CircuitState::HalfOpen {
            state.trial_in_flight = false;
        }
    }
}

/// Guard for one admitted call.
///
/// Creating the permit increments the upstream's active connection count and
/// dropping it decrements the count, whatever the call's outcome. A trial
/// permit dropped without an outcome (for example when the caller's future is
/// cancelled) frees the trial slot.
#[derive(Debug)]
pub struct CallPermit {
    upstream: Arc<Upstream>,
    breaker: CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl CallPermit {
    /// Ask the breaker for permission to call `upstream`.
    pub fn acquire(
        breaker: &CircuitBreaker,
        upstream: &Arc<Upstream>,
        now: Instant,
    ) -> Result<Self, GatewayError> {
        let admission = upstream
            .health()
            .with_state(|state| breaker.admit(state, upstream.name(), now))?;

        upstream.health().increment_connections();
        Ok(Self {
            upstream: upstream.clone(),
            breaker: *breaker,
            admission,
            settled: false,
        })
    }

    pub fn is_trial(&self) -> bool {
        self.admission == Admission::Trial
    }

    /// Report success and release the permit.
    pub fn succeed(mut self) -> Option<Transition> {
        self.settled = true;
        let (breaker, admission) = (self.breaker, self.admission);
        let name = self.upstream.name().to_string();
        self.upstream
            .health()
            .with_state(|state| breaker.record_success(state, admission, &name))
    }

    /// Report failure and release the permit.
    pub fn fail(mut self, error: &str, now: Instant) -> Option<Transition> {
        self.settled = true;
        let (breaker, admission) = (self.breaker, self.admission);
        let name = self.upstream.name().to_string();
        self.upstream
            .health()
            .with_state(|state| breaker.record_failure(state, admission, &name, error, now))
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Trial {
            let breaker = self.breaker;
            self.upstream
                .health()
                .with_state(|state| breaker.release_trial(state));
        }
        self.upstream.health().decrement_connections();
    }
}
