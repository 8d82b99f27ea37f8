//! Per-request context shared by every middleware in a pipeline run.
//!
//! Request facts are immutable once the context is built. The [`StateBag`] is
//! the only surface middlewares use to hand data to each other; the response
//! sink is owned by the transport and only written through its port.
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use http::Method;
use serde_json::Value;

use crate::ports::response_sink::ResponseSink;

/// Facts about an incoming request, as extracted by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFacts {
    pub method: Method,
    /// Path without query string
    pub path: String,
    /// Path plus query string, as received
    pub url: String,
    pub session_id: Option<String>,
    /// Parsed body, if the transport could decode one
    pub body: Option<Value>,
}

impl RequestFacts {
    /// Build facts from a method and a request URL; the path is derived by
    /// dropping the query string.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        let url = url.into();
        let path = url
            .split_once('?')
            .map_or(url.as_str(), |(path, _)| path)
            .to_string();
        Self {
            method,
            path,
            url,
            session_id: None,
            body: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// String-keyed bag of JSON values shared between middlewares.
#[derive(Debug, Default)]
pub struct StateBag {
    inner: Mutex<HashMap<String, Value>>,
}

impl StateBag {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a value, returning the previous one for the key
    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.lock().insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.lock().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of every entry, mainly for diagnostics and tests
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.lock().clone()
    }
}

/// Mutable state bag plus immutable request facts for one pipeline run.
pub struct MiddlewareContext {
    facts: RequestFacts,
    state: StateBag,
    response: Arc<dyn ResponseSink>,
    terminal_reached: AtomicBool,
}

impl MiddlewareContext {
    pub fn new(facts: RequestFacts, response: Arc<dyn ResponseSink>) -> Self {
        Self {
            facts,
            state: StateBag::default(),
            response,
            terminal_reached: AtomicBool::new(false),
        }
    }

    pub fn facts(&self) -> &RequestFacts {
        &self.facts
    }

    pub fn method(&self) -> &Method {
        &self.facts.method
    }

    pub fn path(&self) -> &str {
        &self.facts.path
    }

    pub fn url(&self) -> &str {
        &self.facts.url
    }

    pub fn session_id(&self) -> Option<&str> {
        self.facts.session_id.as_deref()
    }

    pub fn body(&self) -> Option<&Value> {
        self.facts.body.as_ref()
    }

    pub fn state(&self) -> &StateBag {
        &self.state
    }

    pub fn response(&self) -> &dyn ResponseSink {
        self.response.as_ref()
    }

    /// Whether the terminal handler has been invoked during this run
    pub fn terminal_reached(&self) -> bool {
        self.terminal_reached.load(Ordering::Acquire)
    }

    pub(crate) fn mark_terminal_reached(&self) {
        self.terminal_reached.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for MiddlewareContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareContext")
            .field("facts", &self.facts)
            .field("state", &self.state)
            .field("terminal_reached", &self.terminal_reached())
            .finish()
    }
}
