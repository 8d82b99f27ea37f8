use std::time::Duration;

use thiserror::Error;

use crate::ports::upstream_transport::TransportError;

/// Errors returned by the gateway's routing and forwarding operations.
///
/// `CircuitOpen` and `NoEligibleUpstream` are never retried inside the
/// gateway; they are handed straight back to the caller.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum GatewayError {
    /// The upstream's circuit is open; no attempt was made
    #[error("Circuit open for upstream '{upstream}'")]
    CircuitOpen {
        upstream: String,
        /// Time left until a trial call would be admitted, when known
        retry_after: Option<Duration>,
    },

    /// Every candidate is unhealthy or has an open circuit
    #[error("No eligible upstream available")]
    NoEligibleUpstream,

    #[error("Upstream '{0}' is already registered")]
    DuplicateUpstream(String),

    #[error("Call to upstream '{upstream}' timed out after {after:?}")]
    Timeout { upstream: String, after: Duration },

    #[error("Call to upstream '{upstream}' failed: {source}")]
    Transport {
        upstream: String,
        #[source]
        source: TransportError,
    },
}

impl GatewayError {
    /// Whether callers should answer with a service-unavailable class response
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            GatewayError::CircuitOpen { .. } | GatewayError::NoEligibleUpstream
        )
    }
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;
