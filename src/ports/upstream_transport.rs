use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::core::upstream::{OperationKind, UpstreamDescriptor};

/// Custom error type for upstream transport operations
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TransportError {
    /// Error when connection to the upstream fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when the upstream does not answer in time
    #[error("Timeout error after {0} ms")]
    Timeout(u64),

    /// Error when the outgoing call cannot be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Error when the upstream answers with a failure status
    #[error("Upstream returned error status: {status}, url: {url}")]
    UpstreamError {
        /// The URL that was requested
        url: String,
        /// The status code returned by the upstream
        status: u16,
    },

    /// Error when the upstream answer cannot be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Result type alias for upstream transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// UpstreamTransport defines the port (interface) the gateway uses to reach
/// backend servers. Wire framing is owned entirely by the implementation.
#[async_trait]
pub trait UpstreamTransport: Send + Sync + 'static {
    /// Forward a named operation to an upstream
    ///
    /// # Arguments
    /// * `upstream` - Descriptor of the chosen upstream
    /// * `kind` - Whether the operation is a tool, resource or prompt
    /// * `name` - Operation name with any routing prefix already stripped
    /// * `arguments` - Opaque call arguments
    ///
    /// # Returns
    /// A future that resolves to the upstream's result payload or an error
    async fn call(
        &self,
        upstream: &UpstreamDescriptor,
        kind: OperationKind,
        name: &str,
        arguments: Value,
    ) -> TransportResult<Value>;

    /// Perform one liveness probe against an upstream
    ///
    /// The caller bounds the probe with the upstream's timeout; an `Ok(())`
    /// means the upstream is alive.
    async fn probe(&self, upstream: &UpstreamDescriptor) -> TransportResult<()>;
}
