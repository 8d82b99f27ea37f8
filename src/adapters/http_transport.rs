use std::time::Duration;

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use reqwest::{
    Client,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use serde_json::{Value, json};

use crate::{
    core::upstream::{OperationKind, UpstreamDescriptor},
    ports::upstream_transport::{TransportError, TransportResult, UpstreamTransport},
};

/// Upstream transport over HTTP using `reqwest` (rustls).
///
/// Responsibilities:
/// * Sends each call as a JSON `POST` of `{kind, name, arguments}` to the endpoint
/// * Attaches the upstream's configured headers
/// * Probes liveness with `GET endpoint + health_path`, any 2xx is alive
/// * Re-attempts connection failures up to the upstream's `retries`
///
/// Status errors and timeouts are never retried here.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a new HTTP transport.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("gantry/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .wrap_err("Failed to build HTTP client")?;

        tracing::info!("Created HTTP upstream transport");
        Ok(Self { client })
    }

    fn headers_for(upstream: &UpstreamDescriptor) -> TransportResult<HeaderMap> {
        let mut headers = HeaderMap::with_capacity(upstream.headers.len());
        for (name, value) in &upstream.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                TransportError::InvalidRequest(format!("header name '{name}': {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                TransportError::InvalidRequest(format!("header value for '{name}': {e}"))
            })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    fn classify(error: reqwest::Error, timeout: Duration) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout(timeout.as_millis() as u64)
        } else if error.is_builder() {
            TransportError::InvalidRequest(error.to_string())
        } else if error.is_decode() {
            TransportError::InvalidResponse(error.to_string())
        } else {
            TransportError::ConnectionError(error.to_string())
        }
    }
}

#[async_trait]
impl UpstreamTransport for HttpTransport {
    async fn call(
        &self,
        upstream: &UpstreamDescriptor,
        kind: OperationKind,
        name: &str,
        arguments: Value,
    ) -> TransportResult<Value> {
        let url = upstream.endpoint.as_str();
        let headers = Self::headers_for(upstream)?;
        let body = json!({
            "kind": kind,
            "name": name,
            "arguments": arguments,
        });

        let mut attempt = 0;
        let response = loop {
            let sent = self
                .client
                .post(url)
                .headers(headers.clone())
                .timeout(upstream.timeout)
                .json(&body)
                .send()
                .await;

            match sent {
                Ok(response) => break response,
                Err(e) if e.is_connect() && attempt < upstream.retries => {
                    attempt += 1;
                    tracing::debug!(
                        "Connection to {} failed, retrying ({}/{}): {}",
                        upstream.name,
                        attempt,
                        upstream.retries,
                        e
                    );
                }
                Err(e) => return Err(Self::classify(e, upstream.timeout)),
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::UpstreamError {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }

    async fn probe(&self, upstream: &UpstreamDescriptor) -> TransportResult<()> {
        let url = upstream.endpoint.join(&upstream.health_path);
        let response = self
            .client
            .get(&url)
            .headers(Self::headers_for(upstream)?)
            .timeout(upstream.timeout)
            .send()
            .await
            .map_err(|e| Self::classify(e, upstream.timeout))?;

        let status = response.status();
        tracing::debug!("Probe of {} answered {}", url, status);
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::UpstreamError {
                url,
                status: status.as_u16(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use axum::{
        Json, Router,
        extract::State,
        http::{HeaderMap as AxumHeaderMap, StatusCode},
        routing::{get, post},
    };

    use super::*;

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn descriptor(addr: SocketAddr) -> UpstreamDescriptor {
        UpstreamDescriptor::new("weather", &format!("http://{addr}"))
            .unwrap()
            .timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_call_posts_operation_as_json() {
        let router = Router::new().route(
            "/",
            post(|headers: AxumHeaderMap, Json(body): Json<Value>| async move {
                Json(json!({
                    "echo": body,
                    "token": headers
                        .get("x-api-key")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default(),
                }))
            }),
        );
        let addr = serve(router).await;
        let transport = HttpTransport::new().unwrap();

        let result = transport
            .call(
                &descriptor(addr).header("x-api-key", "secret"),
                OperationKind::Tool,
                "forecast",
                json!({"city": "Oslo"}),
            )
            .await
            .unwrap();

        assert_eq!(result["echo"]["kind"], "tool");
        assert_eq!(result["echo"]["name"], "forecast");
        assert_eq!(result["echo"]["arguments"]["city"], "Oslo");
        assert_eq!(result["token"], "secret");
    }

    #[tokio::test]
    async fn test_status_errors_are_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/",
                post(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    StatusCode::INTERNAL_SERVER_ERROR
                }),
            )
            .with_state(hits.clone());
        let addr = serve(router).await;
        let transport = HttpTransport::new().unwrap();

        let err = transport
            .call(
                &descriptor(addr).retries(3),
                OperationKind::Tool,
                "forecast",
                Value::Null,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::UpstreamError { status: 500, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_probe_uses_health_path() {
        let router = Router::new().route("/health", get(|| async { "ok" }));
        let addr = serve(router).await;
        let transport = HttpTransport::new().unwrap();

        assert!(transport.probe(&descriptor(addr)).await.is_ok());

        let mut missing = descriptor(addr);
        missing.health_path = "/ready".to_string();
        assert!(matches!(
            transport.probe(&missing).await,
            Err(TransportError::UpstreamError { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_refused_connection_is_a_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new().unwrap();
        let err = transport
            .call(&descriptor(addr).retries(1), OperationKind::Prompt, "greet", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionError(_)));
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let upstream = UpstreamDescriptor::new("weather", "http://weather:9000")
            .unwrap()
            .header("bad header", "value");
        assert!(matches!(
            HttpTransport::headers_for(&upstream),
            Err(TransportError::InvalidRequest(_))
        ));
    }
}
