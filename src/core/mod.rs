pub mod circuit_breaker;
pub mod context;
pub mod error;
pub mod gateway;
pub mod load_balancer;
pub mod pipeline;
pub mod scope;
pub mod upstream;

pub use circuit_breaker::{CallPermit, CircuitBreaker, Transition};
pub use context::{MiddlewareContext, RequestFacts, StateBag};
pub use error::{GatewayError, GatewayResult};
pub use gateway::{GatewayHooks, GatewayService, GatewaySettings, Route};
pub use load_balancer::{LoadBalancerFactory, LoadBalancingStrategy};
pub use pipeline::{
    Middleware, MiddlewareEntry, Next, Parallel, Pipeline, PipelineError, PipelineOutcome,
    PipelineResult, RegistrationError, Terminal, WithTimeout,
};
pub use scope::{MiddlewareScope, ScopeConfigError, ScopeMatcher};
pub use upstream::{
    CircuitState, HealthSnapshot, HealthState, OperationKind, Upstream, UpstreamDescriptor,
    UpstreamEndpoint,
};
