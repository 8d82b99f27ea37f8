use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
    routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tokio::time::Instant;
use tracing::Instrument;

use crate::{
    core::{
        GatewayService,
        context::{MiddlewareContext, RequestFacts},
        error::GatewayError,
        pipeline::{Pipeline, PipelineError, PipelineOutcome, PipelineResult, Terminal},
        upstream::OperationKind,
    },
    ports::response_sink::{BufferedResponse, ResponseSink},
    tracing_setup::{create_request_span, record_request_outcome},
};

/// Largest request body accepted by the front door
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Header carrying the caller's session id
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// Path of the health snapshot endpoint
pub const UPSTREAMS_PATH: &str = "/_gantry/upstreams";

/// State key holding the parse error of a request body that was not JSON
pub const BODY_ERROR_KEY: &str = "body_error";

/// Body of a forwarded call.
#[derive(Debug, Deserialize)]
pub struct CallRequest {
    pub kind: OperationKind,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Terminal handler that forwards the call described by the request body to
/// the gateway and writes the result as JSON.
pub struct ForwardingTerminal {
    gateway: Arc<GatewayService>,
}

impl ForwardingTerminal {
    pub fn new(gateway: Arc<GatewayService>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Terminal for ForwardingTerminal {
    async fn call(&self, ctx: &MiddlewareContext) -> PipelineResult {
        if let Some(error) = ctx.state().get(BODY_ERROR_KEY) {
            let message = format!("Invalid JSON body: {}", error.as_str().unwrap_or_default());
            write_json(
                ctx.response(),
                StatusCode::BAD_REQUEST,
                &json!({ "error": message }),
            );
            return Ok(());
        }

        let call = match ctx
            .body()
            .map(|body| CallRequest::deserialize(body))
            .transpose()
        {
            Ok(Some(call)) => call,
            Ok(None) => {
                write_json(
                    ctx.response(),
                    StatusCode::BAD_REQUEST,
                    &json!({"error": "Missing call body"}),
                );
                return Ok(());
            }
            Err(e) => {
                write_json(
                    ctx.response(),
                    StatusCode::BAD_REQUEST,
                    &json!({"error": format!("Invalid call body: {e}")}),
                );
                return Ok(());
            }
        };

        tracing::debug!(
            "Forwarding {} {} for session {}",
            call.kind,
            call.name,
            ctx.session_id().unwrap_or("-")
        );

        let result = self
            .gateway
            .forward_call(call.kind, &call.name, call.arguments)
            .await?;
        write_json(ctx.response(), StatusCode::OK, &result);
        Ok(())
    }
}

fn write_json(sink: &dyn ResponseSink, status: StatusCode, value: &Value) {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    sink.write_status(status);
    sink.write_headers(&headers);
    sink.end(Bytes::from(value.to_string()));
}

/// HTTP front door: turns requests into pipeline runs.
#[derive(Clone)]
pub struct HttpHandler {
    gateway: Arc<GatewayService>,
    pipeline: Arc<Pipeline>,
}

impl HttpHandler {
    pub fn new(gateway: Arc<GatewayService>, pipeline: Arc<Pipeline>) -> Self {
        Self { gateway, pipeline }
    }

    /// Build the axum router serving the health snapshot and every other
    /// path through the pipeline.
    pub fn router(self) -> Router {
        Router::new()
            .route(UPSTREAMS_PATH, get(upstream_health))
            .fallback(handle)
            .with_state(Arc::new(self))
            .layer(TraceLayer::new_for_http())
    }

    /// Health snapshot of every upstream, bypassing the pipeline
    pub fn handle_upstream_health(&self) -> Response {
        let snapshots = self.gateway.get_upstream_health();
        let body = serde_json::to_value(&snapshots).unwrap_or_else(|e| {
            tracing::error!("Failed to serialize upstream health: {}", e);
            Value::Array(Vec::new())
        });
        json_response(StatusCode::OK, HeaderMap::new(), &body)
    }

    /// Main request handler: builds request facts and runs the pipeline
    pub async fn handle_request(&self, req: Request) -> Response {
        let started = Instant::now();
        let (parts, body) = req.into_parts();
        let url = parts
            .uri
            .path_and_query()
            .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string());

        tracing::debug!("Handling {} request to {}", parts.method, url);

        let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Failed to read request body: {}", e);
                return error_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    HeaderMap::new(),
                    "Request body too large",
                );
            }
        };

        let mut facts = RequestFacts::new(parts.method, url);
        if let Some(session_id) = parts
            .headers
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            facts = facts.with_session_id(session_id);
        }
        // A body that is not JSON still runs the pipeline, without a body
        let mut body_error = None;
        if !bytes.is_empty() {
            match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => facts = facts.with_body(value),
                Err(e) => {
                    tracing::debug!("Request body is not JSON: {}", e);
                    body_error = Some(e.to_string());
                }
            }
        }

        let caller_request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        let span = create_request_span(facts.method.as_str(), &facts.path, caller_request_id);

        let sink = Arc::new(BufferedResponse::new());
        let ctx = MiddlewareContext::new(facts, sink.clone());
        if let Some(error) = body_error {
            ctx.state().insert(BODY_ERROR_KEY, Value::String(error));
        }
        let terminal = ForwardingTerminal::new(self.gateway.clone());
        let result = self
            .pipeline
            .execute_in(&ctx, &terminal)
            .instrument(span.clone())
            .await;

        let response = match result {
            Ok(outcome) => {
                if outcome == PipelineOutcome::ShortCircuited && !sink.is_ended() {
                    tracing::debug!("Pipeline short-circuited without a response body");
                }
                let status = sink.status().unwrap_or(StatusCode::OK);
                let body = sink.body().unwrap_or_default();
                let mut response = Response::new(Body::from(body));
                *response.status_mut() = status;
                response.headers_mut().extend(sink.headers());
                response
            }
            Err(e) => {
                let (status, mut headers) = status_for(&e);
                // Headers written before the failure, such as the request id
                for (name, value) in &sink.headers() {
                    headers.insert(name.clone(), value.clone());
                }
                error_response(status, headers, &e.to_string())
            }
        };
        record_request_outcome(&span, response.status().as_u16(), started.elapsed());
        response
    }
}

async fn upstream_health(State(handler): State<Arc<HttpHandler>>) -> Response {
    handler.handle_upstream_health()
}

async fn handle(State(handler): State<Arc<HttpHandler>>, req: Request) -> Response {
    handler.handle_request(req).await
}

/// Map a pipeline failure to a status code and any extra headers.
pub fn status_for(error: &PipelineError) -> (StatusCode, HeaderMap) {
    let mut headers = HeaderMap::new();
    let status = match error {
        PipelineError::Gateway(GatewayError::CircuitOpen { retry_after, .. }) => {
            if let Some(after) = retry_after {
                let secs = after.as_secs() + u64::from(after.subsec_nanos() > 0);
                headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
            }
            StatusCode::SERVICE_UNAVAILABLE
        }
        PipelineError::Gateway(e) if e.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::Gateway(GatewayError::Transport { .. }) => StatusCode::BAD_GATEWAY,
        PipelineError::Gateway(GatewayError::Timeout { .. }) | PipelineError::Timeout { .. } => {
            StatusCode::GATEWAY_TIMEOUT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, headers)
}

fn json_response(status: StatusCode, mut headers: HeaderMap, body: &Value) -> Response {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().extend(headers);
    response
}

fn error_response(status: StatusCode, headers: HeaderMap, message: &str) -> Response {
    tracing::debug!("Responding {}: {}", status, message);
    json_response(status, headers, &json!({ "error": message }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        adapters::middleware::{REQUEST_ID_HEADER, register_builtin_middlewares},
        config::MiddlewareConfig,
        core::{
            GatewaySettings,
            load_balancer::{LoadBalancingStrategy, RoundRobinStrategy},
            upstream::{CircuitState, UpstreamDescriptor},
        },
        ports::upstream_transport::{TransportError, TransportResult, UpstreamTransport},
    };

    /// Answers for "weather", refuses for "news".
    struct MockTransport;

    #[async_trait]
    impl UpstreamTransport for MockTransport {
        async fn call(
            &self,
            upstream: &UpstreamDescriptor,
            _kind: OperationKind,
            name: &str,
            arguments: Value,
        ) -> TransportResult<Value> {
            if upstream.name == "news" {
                return Err(TransportError::ConnectionError("refused".to_string()));
            }
            Ok(json!({ "upstream": upstream.name, "name": name, "arguments": arguments }))
        }

        async fn probe(&self, _upstream: &UpstreamDescriptor) -> TransportResult<()> {
            Ok(())
        }
    }

    async fn create_test_router() -> (Router, Arc<GatewayService>) {
        let gateway = GatewayService::new(
            GatewaySettings::default(),
            RoundRobinStrategy::new().boxed(),
            Arc::new(MockTransport),
        );
        for (name, prefix) in [("weather", "weather_"), ("news", "news_")] {
            gateway
                .register(
                    UpstreamDescriptor::new(name, &format!("http://{name}:9000"))
                        .unwrap()
                        .tool_prefix(prefix),
                )
                .await
                .unwrap();
        }
        let gateway = Arc::new(gateway);

        let pipeline = Pipeline::new();
        register_builtin_middlewares(&pipeline, &MiddlewareConfig::default()).unwrap();

        let router = HttpHandler::new(gateway.clone(), Arc::new(pipeline)).router();
        (router, gateway)
    }

    fn call(body: &str) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri("/mcp?trace=1")
            .header(header::CONTENT_TYPE, "application/json")
            .header(SESSION_ID_HEADER, "session-1")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_upstream_health_endpoint() {
        let (router, _) = create_test_router().await;
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri(UPSTREAMS_PATH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        // The health endpoint bypasses the pipeline
        assert!(response.headers().get(REQUEST_ID_HEADER).is_none());

        let body = json_body(response).await;
        assert_eq!(body.as_array().unwrap().len(), 2);
        assert_eq!(body[0]["upstream"], "weather");
        assert_eq!(body[0]["circuit_state"], "closed");
    }

    #[tokio::test]
    async fn test_forwarded_call_returns_result() {
        let (router, _) = create_test_router().await;
        let response = router
            .oneshot(call(
                r#"{"kind":"tool","name":"weather_forecast","arguments":{"city":"Oslo"}}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(REQUEST_ID_HEADER).is_some());
        let body = json_body(response).await;
        assert_eq!(body["upstream"], "weather");
        assert_eq!(body["name"], "forecast");
        assert_eq!(body["arguments"]["city"], "Oslo");
    }

    #[tokio::test]
    async fn test_malformed_bodies_are_bad_requests() {
        let (router, _) = create_test_router().await;

        let response = router.clone().oneshot(call("{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        // The pipeline still ran for the unparseable body
        assert!(response.headers().get(REQUEST_ID_HEADER).is_some());
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().starts_with("Invalid JSON body"));

        let response = router
            .clone()
            .oneshot(call(r#"{"kind":"widget","name":"x"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router.oneshot(call("")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_transport_failure_is_bad_gateway() {
        let (router, _) = create_test_router().await;
        let response = router
            .oneshot(call(r#"{"kind":"tool","name":"news_headlines"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response.headers().get(REQUEST_ID_HEADER).is_some());
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("news"));
    }

    #[tokio::test]
    async fn test_no_eligible_upstream_is_unavailable() {
        let (router, gateway) = create_test_router().await;
        for upstream in gateway.upstreams().iter() {
            gateway.record_probe(upstream, Err("down".to_string()));
        }

        let response = router
            .oneshot(call(r#"{"kind":"prompt","name":"summary"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_open_circuit_sets_retry_after() {
        let (router, gateway) = create_test_router().await;
        let weather = gateway.upstream("weather").await.unwrap();
        weather.health().with_state(|state| {
            state.circuit_state = CircuitState::Open;
            state.last_opened_at = Some(tokio::time::Instant::now());
        });

        let response = router
            .oneshot(call(r#"{"kind":"tool","name":"weather_forecast"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "30");
    }

    #[test]
    fn test_status_mapping() {
        let timeout = PipelineError::Timeout {
            name: "request_timeout".to_string(),
            after: Duration::from_secs(1),
        };
        assert_eq!(status_for(&timeout).0, StatusCode::GATEWAY_TIMEOUT);

        let handler = PipelineError::Handler(eyre::eyre!("boom"));
        assert_eq!(status_for(&handler).0, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
