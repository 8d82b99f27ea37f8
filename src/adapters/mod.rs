pub mod health_checker;
pub mod http_handler;
pub mod http_transport;
pub mod middleware;

/// Re-export commonly used types from adapters
pub use health_checker::HealthProber;
pub use http_handler::{ForwardingTerminal, HttpHandler};
pub use http_transport::HttpTransport;
pub use middleware::{
    CustomHeadersMiddleware, RequestIdMiddleware, RequestTimingMiddleware,
    register_builtin_middlewares,
};
