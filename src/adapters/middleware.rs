//! Built-in pipeline middlewares registered by the server binary.
//!
//! Each one is a small [`Middleware`] implementation that enriches the
//! response or adds diagnostics around the rest of the chain. They keep no
//! per-request state of their own; everything flows through the context.
use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tokio::time::Instant;

use crate::{
    config::MiddlewareConfig,
    core::{
        context::MiddlewareContext,
        pipeline::{
            Middleware, MiddlewareEntry, Next, Pipeline, PipelineResult, RegistrationError,
            WithTimeout,
        },
        scope::MiddlewareScope,
    },
};

/// State key holding the request id
pub const REQUEST_ID_KEY: &str = "request_id";

/// Response header carrying the request id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Assigns a UUID v4 to every request, stores it in the state bag and echoes
/// it as `X-Request-ID`.
#[derive(Debug, Default)]
pub struct RequestIdMiddleware;

#[async_trait]
impl Middleware for RequestIdMiddleware {
    async fn handle(&self, ctx: &MiddlewareContext, next: Next<'_>) -> PipelineResult {
        let request_id = uuid::Uuid::new_v4().to_string();
        ctx.state()
            .insert(REQUEST_ID_KEY, Value::String(request_id.clone()));

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            let mut headers = HeaderMap::new();
            headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
            ctx.response().write_headers(&headers);
        }

        next.run(ctx).await
    }
}

/// Log start/end of a request including latency, on the error path too.
#[derive(Debug, Default)]
pub struct RequestTimingMiddleware;

#[async_trait]
impl Middleware for RequestTimingMiddleware {
    async fn handle(&self, ctx: &MiddlewareContext, next: Next<'_>) -> PipelineResult {
        let start = Instant::now();
        let request_id = ctx
            .state()
            .get(REQUEST_ID_KEY)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();

        tracing::info!(
            "Started processing {} {} {}",
            ctx.method(),
            ctx.url(),
            request_id
        );

        let result = next.run(ctx).await;
        let duration = start.elapsed();

        match &result {
            Ok(()) => tracing::info!(
                "Completed {} {} {} in {:?}",
                ctx.method(),
                ctx.url(),
                request_id,
                duration
            ),
            Err(e) => tracing::warn!(
                "Failed {} {} {} in {:?}: {}",
                ctx.method(),
                ctx.url(),
                request_id,
                duration,
                e
            ),
        }

        result
    }
}

/// Adds configured response headers. Invalid pairs are skipped with a warning
/// when the middleware is built.
#[derive(Debug, Clone)]
pub struct CustomHeadersMiddleware {
    headers: HeaderMap,
}

impl CustomHeadersMiddleware {
    pub fn new(headers: &HashMap<String, String>) -> Self {
        let mut map = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.insert(name, value);
                }
                _ => tracing::warn!("Skipping invalid custom header {}: {}", name, value),
            }
        }
        Self { headers: map }
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

#[async_trait]
impl Middleware for CustomHeadersMiddleware {
    async fn handle(&self, ctx: &MiddlewareContext, next: Next<'_>) -> PipelineResult {
        ctx.response().write_headers(&self.headers);
        next.run(ctx).await
    }
}

/// Register the built-in middlewares enabled in `config`.
///
/// Request id runs first so timing can log it; the request deadline is
/// registered last with the highest order, so it bounds only the terminal.
pub fn register_builtin_middlewares(
    pipeline: &Pipeline,
    config: &MiddlewareConfig,
) -> Result<(), RegistrationError> {
    if config.request_id {
        pipeline.register(
            MiddlewareEntry::new(RequestIdMiddleware)
                .named("request_id")
                .order(0),
        )?;
    }

    if config.timing {
        pipeline.register(
            MiddlewareEntry::new(RequestTimingMiddleware)
                .named("request_timing")
                .order(10),
        )?;
    }

    if let Some(custom) = &config.custom_headers {
        pipeline.register(
            MiddlewareEntry::from_shared(Arc::new(CustomHeadersMiddleware::new(&custom.headers)))
                .named("custom_headers")
                .scope(custom.scope.clone()),
        )?;
    }

    if let Some(timeout_ms) = config.request_timeout_ms {
        pipeline.register(
            MiddlewareEntry::new(WithTimeout::deadline(
                "request_timeout",
                Duration::from_millis(timeout_ms),
            ))
            .named("request_timeout")
            .scope(MiddlewareScope::default().order(i32::MAX)),
        )?;
    }

    Ok(())
}
