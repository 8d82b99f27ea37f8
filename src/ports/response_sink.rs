use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

/// ResponseSink defines the port through which middlewares and terminal
/// handlers write a response back to the transport that owns the request.
///
/// Methods take `&self` so a sink can be shared by middlewares running in
/// parallel against the same context.
pub trait ResponseSink: Send + Sync + 'static {
    /// Set the response status code
    fn write_status(&self, status: StatusCode);

    /// Merge headers into the response, replacing existing values by name
    fn write_headers(&self, headers: &HeaderMap);

    /// Finish the response with the given body. Only the first call wins.
    fn end(&self, body: Bytes);

    /// Whether `end` has already been called
    fn is_ended(&self) -> bool;
}

#[derive(Debug, Default, Clone)]
struct RecordedResponse {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Option<Bytes>,
}

/// In-memory sink that records what was written so the owning transport can
/// turn it into its own response type once the pipeline has finished.
#[derive(Debug, Default)]
pub struct BufferedResponse {
    inner: Mutex<RecordedResponse>,
}

impl BufferedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RecordedResponse> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Status written so far, if any
    pub fn status(&self) -> Option<StatusCode> {
        self.lock().status
    }

    /// Snapshot of the headers written so far
    pub fn headers(&self) -> HeaderMap {
        self.lock().headers.clone()
    }

    /// Body passed to `end`, if the response was ended
    pub fn body(&self) -> Option<Bytes> {
        self.lock().body.clone()
    }
}

impl ResponseSink for BufferedResponse {
    fn write_status(&self, status: StatusCode) {
        let mut inner = self.lock();
        if inner.body.is_some() {
            tracing::debug!("Ignoring status {} written after response end", status);
            return;
        }
        inner.status = Some(status);
    }

    fn write_headers(&self, headers: &HeaderMap) {
        let mut inner = self.lock();
        if inner.body.is_some() {
            tracing::debug!("Ignoring headers written after response end");
            return;
        }
        for (name, value) in headers {
            inner.headers.insert(name.clone(), value.clone());
        }
    }

    fn end(&self, body: Bytes) {
        let mut inner = self.lock();
        if inner.body.is_none() {
            inner.body = Some(body);
        }
    }

    fn is_ended(&self) -> bool {
        self.lock().body.is_some()
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn test_buffered_response_records_writes() {
        let sink = BufferedResponse::new();
        assert!(!sink.is_ended());

        let mut headers = HeaderMap::new();
        headers.insert("x-test", HeaderValue::from_static("one"));
        sink.write_status(StatusCode::ACCEPTED);
        sink.write_headers(&headers);
        sink.end(Bytes::from_static(b"done"));

        assert!(sink.is_ended());
        assert_eq!(sink.status(), Some(StatusCode::ACCEPTED));
        assert_eq!(sink.headers().get("x-test").unwrap(), "one");
        assert_eq!(sink.body(), Some(Bytes::from_static(b"done")));
    }

    #[test]
    fn test_writes_after_end_are_ignored() {
        let sink = BufferedResponse::new();
        sink.write_status(StatusCode::OK);
        sink.end(Bytes::from_static(b"first"));

        sink.write_status(StatusCode::INTERNAL_SERVER_ERROR);
        sink.end(Bytes::from_static(b"second"));

        assert_eq!(sink.status(), Some(StatusCode::OK));
        assert_eq!(sink.body(), Some(Bytes::from_static(b"first")));
    }
}
