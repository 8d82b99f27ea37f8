//! Gantry - a middleware pipeline and multi-upstream gateway.
//!
//! Gantry puts a single endpoint in front of several backend servers. Every
//! request runs through an ordered, path-scoped **middleware pipeline** and then
//! reaches a terminal handler that forwards the call to one of the registered
//! **upstreams**, chosen by operation-name prefix or by a load balancer over the
//! healthy set. The crate follows a **hexagonal architecture**: the network is
//! reached only through ports, so the core is testable with in-process mocks.
//!
//! # Features
//! - Ordered middleware chain with `/exact`, `/dir/*` and `/prefix/**` scopes
//! - Parallel fan-out and per-middleware deadlines as composable middlewares
//! - Prefix routing of tool, resource and prompt names with prefix stripping
//! - Load balancing: round-robin, random, least-connections, weighted
//! - Per-upstream circuit breaker (closed / open / half-open)
//! - Periodic liveness probes with unhealthy / recovered notification hooks
//! - Structured tracing via `tracing` and graceful shutdown
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use gantry::{GatewayHooks, GatewayService, HttpHandler, HttpTransport, Pipeline};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let cfg = gantry::config::loader::load_config("config.toml").await?;
//! let transport = Arc::new(HttpTransport::new()?);
//! let gateway = GatewayService::from_config(&cfg, transport, GatewayHooks::new()).await?;
//! gateway.start();
//!
//! let pipeline = Pipeline::new();
//! gantry::adapters::register_builtin_middlewares(&pipeline, &cfg.middleware)?;
//! let app = HttpHandler::new(gateway, Arc::new(pipeline)).router();
//! let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
//! axum::serve(listener, app).await?;
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Domain operations return typed errors (`GatewayError`, `PipelineError`,
//! `TransportError`); setup paths return `eyre::Result<T>` with context
//! attached through `WrapErr`.
//!
//! # Concurrency & Data Structures
//! The upstream registry is an `ArcSwap` snapshot plus an `scc::HashMap` name
//! index, so routing never blocks on registration.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{HealthProber, HttpHandler, HttpTransport},
    core::{
        GatewayError, GatewayHooks, GatewayService, Middleware, MiddlewareContext,
        MiddlewareEntry, MiddlewareScope, Next, Pipeline, PipelineError, UpstreamDescriptor,
    },
    ports::UpstreamTransport,
    utils::GracefulShutdown,
};
