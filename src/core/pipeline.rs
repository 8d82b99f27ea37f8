//! Ordered middleware registry composed into a single onion-style chain.
//!
//! Entries are kept sorted by ascending `order`; ties keep registration
//! order. For every request the pipeline filters entries through their
//! [`ScopeMatcher`], then runs the survivors as one chain where each
//! middleware receives the context and a [`Next`] handle. `Next` is consumed
//! by [`Next::run`], so a middleware can pass control downstream at most once;
//! dropping it without calling `run` short-circuits the rest of the chain and
//! the terminal handler.
//!
//! Errors travel back up through the frames that already called `next`, so
//! their post-`next` code still runs unless they return early themselves.
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures_util::future::join_all;
use thiserror::Error;

use crate::{
    core::{
        context::{MiddlewareContext, RequestFacts},
        error::GatewayError,
        scope::{MiddlewareScope, ScopeConfigError, ScopeMatcher},
    },
    ports::response_sink::ResponseSink,
};

/// Errors surfacing from a pipeline run.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PipelineError {
    /// A gateway failure raised by the terminal handler or a middleware
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// A [`WithTimeout`] deadline elapsed
    #[error("Middleware '{name}' timed out after {after:?}")]
    Timeout { name: String, after: Duration },

    /// Any other failure raised by a handler
    #[error(transparent)]
    Handler(#[from] eyre::Report),
}

/// Result type for middleware and terminal handlers
pub type PipelineResult = Result<(), PipelineError>;

/// Errors raised when registering a middleware entry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistrationError {
    #[error(transparent)]
    Scope(#[from] ScopeConfigError),

    #[error("Middleware named '{0}' is already registered")]
    DuplicateName(String),
}

/// How a pipeline run ended when no error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The terminal handler ran
    Completed,
    /// A middleware withheld `next`; the terminal handler never ran
    ShortCircuited,
}

/// A composable request-processing unit.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Process a request. Call `next.run(ctx)` to pass control downstream.
    async fn handle(&self, ctx: &MiddlewareContext, next: Next<'_>) -> PipelineResult;

    /// Wrap this middleware in a shareable trait object
    fn shared(self) -> Arc<dyn Middleware>
    where
        Self: Sized,
    {
        Arc::new(self)
    }
}

/// Innermost handler invoked once every applicable middleware passed control.
#[async_trait]
pub trait Terminal: Send + Sync {
    async fn call(&self, ctx: &MiddlewareContext) -> PipelineResult;
}

/// Handle to the remainder of the chain.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    terminal: Option<&'a dyn Terminal>,
}

impl Next<'static> {
    /// A `next` that does nothing; used for branches run in parallel.
    pub fn noop() -> Self {
        Next {
            chain: &[],
            terminal: None,
        }
    }
}

impl<'a> Next<'a> {
    /// Run the rest of the chain, ending with the terminal handler.
    pub async fn run(self, ctx: &MiddlewareContext) -> PipelineResult {
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.handle(
                    ctx,
                    Next {
                        chain: rest,
                        terminal: self.terminal,
                    },
                )
                .await
            }
            None => match self.terminal {
                Some(terminal) => {
                    ctx.mark_terminal_reached();
                    terminal.call(ctx).await
                }
                None => Ok(()),
            },
        }
    }
}

/// A middleware plus its optional name and scope, as handed to
/// [`Pipeline::register`].
pub struct MiddlewareEntry {
    pub handler: Arc<dyn Middleware>,
    pub name: Option<String>,
    pub scope: MiddlewareScope,
}

impl MiddlewareEntry {
    pub fn new(handler: impl Middleware) -> Self {
        Self::from_shared(Arc::new(handler))
    }

    pub fn from_shared(handler: Arc<dyn Middleware>) -> Self {
        Self {
            handler,
            name: None,
            scope: MiddlewareScope::default(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn scope(mut self, scope: MiddlewareScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn order(mut self, order: i32) -> Self {
        self.scope.order = order;
        self
    }
}

struct RegisteredEntry {
    handler: Arc<dyn Middleware>,
    name: Option<String>,
    matcher: ScopeMatcher,
}

/// Middleware registry and executor.
///
/// Reads take a lock-free snapshot of the entry list, so registration and
/// removal never block in-flight requests.
#[derive(Default)]
pub struct Pipeline {
    entries: ArcSwap<Vec<Arc<RegisteredEntry>>>,
    write_lock: Mutex<()>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry. The scope is compiled here so malformed patterns
    /// fail at startup; duplicate names are rejected.
    pub fn register(&self, entry: MiddlewareEntry) -> Result<(), RegistrationError> {
        let matcher = ScopeMatcher::compile(&entry.scope)?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.entries.load_full();

        if let Some(name) = &entry.name {
            if current.iter().any(|e| e.name.as_ref() == Some(name)) {
                return Err(RegistrationError::DuplicateName(name.clone()));
            }
        }

        let order = matcher.order();
        let position = current.partition_point(|e| e.matcher.order() <= order);

        let mut updated = current.as_ref().clone();
        updated.insert(
            position,
            Arc::new(RegisteredEntry {
                handler: entry.handler,
                name: entry.name.clone(),
                matcher,
            }),
        );
        self.entries.store(Arc::new(updated));

        tracing::debug!(
            "Registered middleware {} with order {} at position {}",
            entry.name.as_deref().unwrap_or("<anonymous>"),
            order,
            position
        );
        Ok(())
    }

    /// Remove a named entry. Returns false if no entry has that name.
    pub fn remove(&self, name: &str) -> bool {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.entries.load_full();

        let Some(index) = current.iter().position(|e| e.name.as_deref() == Some(name)) else {
            return false;
        };

        let mut updated = current.as_ref().clone();
        updated.remove(index);
        self.entries.store(Arc::new(updated));
        tracing::debug!("Removed middleware {}", name);
        true
    }

    /// Whether a named entry is registered
    pub fn has(&self, name: &str) -> bool {
        self.entries
            .load()
            .iter()
            .any(|e| e.name.as_deref() == Some(name))
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    /// Names of named entries in execution order
    pub fn names(&self) -> Vec<String> {
        self.entries
            .load()
            .iter()
            .filter_map(|e| e.name.clone())
            .collect()
    }

    /// Build a context for the request and run the composed chain.
    pub async fn execute(
        &self,
        facts: RequestFacts,
        response: Arc<dyn ResponseSink>,
        terminal: &dyn Terminal,
    ) -> Result<PipelineOutcome, PipelineError> {
        let ctx = MiddlewareContext::new(facts, response);
        self.execute_in(&ctx, terminal).await
    }

    /// Run the composed chain against a caller-owned context.
    pub async fn execute_in(
        &self,
        ctx: &MiddlewareContext,
        terminal: &dyn Terminal,
    ) -> Result<PipelineOutcome, PipelineError> {
        let snapshot = self.entries.load_full();
        let chain: Vec<Arc<dyn Middleware>> = snapshot
            .iter()
            .filter(|e| e.matcher.applies(ctx.method(), ctx.path()))
            .map(|e| e.handler.clone())
            .collect();

        tracing::debug!(
            "Executing {} of {} middlewares for {} {}",
            chain.len(),
            snapshot.len(),
            ctx.method(),
            ctx.path()
        );

        Next {
            chain: &chain,
            terminal: Some(terminal),
        }
        .run(ctx)
        .await?;

        if ctx.terminal_reached() {
            Ok(PipelineOutcome::Completed)
        } else {
            tracing::debug!("Pipeline short-circuited for {}", ctx.path());
            Ok(PipelineOutcome::ShortCircuited)
        }
    }
}

/// Runs several middlewares concurrently against the shared context, each with
/// a no-op `next`, then continues the outer chain once all have finished.
///
/// Every branch is driven to completion even when a sibling fails; the first
/// error (in branch order) is returned and the outer chain does not continue.
pub struct Parallel {
    branches: Vec<Arc<dyn Middleware>>,
}

impl Parallel {
    pub fn new(branches: Vec<Arc<dyn Middleware>>) -> Self {
        Self { branches }
    }
}

#[async_trait]
impl Middleware for Parallel {
    async fn handle(&self, ctx: &MiddlewareContext, next: Next<'_>) -> PipelineResult {
        let results = join_all(
            self.branches
                .iter()
                .map(|branch| branch.handle(ctx, Next::noop())),
        )
        .await;

        if let Some(err) = results.into_iter().find_map(Result::err) {
            return Err(err);
        }
        next.run(ctx).await
    }
}

struct PassThrough;

#[async_trait]
impl Middleware for PassThrough {
    async fn handle(&self, ctx: &MiddlewareContext, next: Next<'_>) -> PipelineResult {
        next.run(ctx).await
    }
}

/// Bounds a middleware, and everything it awaits downstream, by a deadline.
///
/// When the deadline elapses the wrapped future is dropped at its current
/// await point. Work it spawned onto other tasks is not cancelled.
pub struct WithTimeout {
    name: String,
    inner: Arc<dyn Middleware>,
    after: Duration,
}

impl WithTimeout {
    pub fn new(name: impl Into<String>, inner: Arc<dyn Middleware>, after: Duration) -> Self {
        Self {
            name: name.into(),
            inner,
            after,
        }
    }

    /// A deadline around the remainder of the chain.
    pub fn deadline(name: impl Into<String>, after: Duration) -> Self {
        Self::new(name, Arc::new(PassThrough), after)
    }
}

#[async_trait]
impl Middleware for WithTimeout {
    async fn handle(&self, ctx: &MiddlewareContext, next: Next<'_>) -> PipelineResult {
        match tokio::time::timeout(self.after, self.inner.handle(ctx, next)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    "Middleware {} exceeded {:?} for {}",
                    self.name,
                    self.after,
                    ctx.path()
                );
                Err(PipelineError::Timeout {
                    name: self.name.clone(),
                    after: self.after,
                })
            }
        }
    }
}
