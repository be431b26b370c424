//! Middleware: an immutable, ordered chain around LLM and tool dispatch.
//!
//! Each [`Middleware`] exposes `before` and `after`; the chain composes
//! them as nested wrapping: `m1.before, m2.before, …, handler, …,
//! m2.after, m1.after`. A failing `before` skips the remaining `before`s
//! and the handler; `after` runs in reverse order for exactly the
//! middlewares whose `before` succeeded and may transform the error it
//! sees.
//!
//! # Main types
//!
//! - [`Chain`]: immutable; [`Chain::with`] returns a new chain, so running
//!   needs no locks.
//! - [`MiddlewareRequest`] / [`MiddlewareResponse`]: pool-allocated
//!   records; they must not be retained past `after` (the pool guard
//!   enforces this).
//! - [`MiddlewareKind`]: the vocabulary of recognized middleware roles.
//! - [`LoggingMiddleware`] / [`TimingMiddleware`]: built-ins.
//!
//! **Interaction**: the loop wraps every LLM call and every tool batch in
//! the agent's chain; the outcome's error (if any) is what the loop sees.

mod kinds;

pub use kinds::{LoggingMiddleware, TimingMiddleware};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;
use crate::pool::{Pool, Poolable};

/// Roles the core recognizes. Effects are orthogonal; the chain only
/// guarantees ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MiddlewareKind {
    Logging,
    Timing,
    Cache,
    RateLimit,
    CircuitBreaker,
    Validation,
    Transform,
    ToolSelector,
    Authentication,
    Observability,
}

/// Request record flowing through `before` hooks.
#[derive(Debug)]
pub struct MiddlewareRequest {
    pub input: Value,
    pub metadata: HashMap<String, Value>,
    pub headers: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Default for MiddlewareRequest {
    fn default() -> Self {
        Self {
            input: Value::Null,
            metadata: HashMap::new(),
            headers: HashMap::new(),
            timestamp: DateTime::<Utc>::MIN_UTC,
        }
    }
}

impl Poolable for MiddlewareRequest {
    fn reset(&mut self) {
        self.input = Value::Null;
        self.metadata.clear();
        self.headers.clear();
        self.timestamp = DateTime::<Utc>::MIN_UTC;
    }
}

/// Response record flowing through `after` hooks.
#[derive(Debug, Default)]
pub struct MiddlewareResponse {
    pub output: Value,
    pub metadata: HashMap<String, Value>,
    pub headers: HashMap<String, String>,
    pub duration: Duration,
    pub error: Option<AgentError>,
}

impl Poolable for MiddlewareResponse {
    fn reset(&mut self) {
        self.output = Value::Null;
        self.metadata.clear();
        self.headers.clear();
        self.duration = Duration::ZERO;
        self.error = None;
    }
}

static REQUEST_POOL: Lazy<Pool<MiddlewareRequest>> =
    Lazy::new(|| Pool::new(64, MiddlewareRequest::default));
static RESPONSE_POOL: Lazy<Pool<MiddlewareResponse>> =
    Lazy::new(|| Pool::new(64, MiddlewareResponse::default));

/// Drops idle middleware records (process shutdown hook).
pub fn clear_record_pools() {
    REQUEST_POOL.clear();
    RESPONSE_POOL.clear();
}

/// One hook pair around a handler.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> MiddlewareKind {
        MiddlewareKind::Observability
    }

    /// Runs before the handler; may transform the request in place. An
    /// error short-circuits the chain.
    async fn before(
        &self,
        _cancel: &CancellationToken,
        _request: &mut MiddlewareRequest,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    /// Runs after the handler (or after a short-circuit), in reverse
    /// order. Sees `response.error` and may transform it.
    async fn after(
        &self,
        _cancel: &CancellationToken,
        _response: &mut MiddlewareResponse,
    ) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Result of running a handler through a chain.
#[derive(Debug)]
pub struct ChainOutcome {
    pub output: Result<Value, AgentError>,
    /// Handler duration; zero when a `before` short-circuited.
    pub duration: Duration,
    /// Metadata accumulated on the response record.
    pub metadata: HashMap<String, Value>,
}

/// Immutable ordered middleware chain.
///
/// Adding returns a new chain sharing the existing middlewares, so a chain
/// can be cloned into every step without synchronization.
#[derive(Clone, Default)]
pub struct Chain {
    middlewares: Arc<Vec<Arc<dyn Middleware>>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_middlewares(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            middlewares: Arc::new(middlewares),
        }
    }

    /// A new chain with `middleware` appended; `self` is untouched.
    pub fn with(&self, middleware: Arc<dyn Middleware>) -> Chain {
        let mut list: Vec<Arc<dyn Middleware>> = self.middlewares.as_ref().clone();
        list.push(middleware);
        Self {
            middlewares: Arc::new(list),
        }
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Declared order, for logs.
    pub fn names(&self) -> Vec<String> {
        self.middlewares.iter().map(|m| m.name().to_string()).collect()
    }

    /// Runs `handler` wrapped by the chain.
    ///
    /// The handler receives the request input as transformed by the
    /// `before` hooks. Records come from the process pools and return on
    /// exit; callers only ever see the [`ChainOutcome`].
    pub async fn run<F, Fut>(
        &self,
        cancel: &CancellationToken,
        input: Value,
        metadata: HashMap<String, Value>,
        handler: F,
    ) -> ChainOutcome
    where
        F: FnOnce(Value) -> Fut,
        Fut: std::future::Future<Output = Result<Value, AgentError>>,
    {
        let mut request = REQUEST_POOL.checkout();
        request.input = input;
        request.metadata = metadata;
        request.timestamp = Utc::now();

        let mut succeeded = 0usize;
        let mut short_circuit: Option<AgentError> = None;
        for middleware in self.middlewares.iter() {
            match middleware.before(cancel, &mut request).await {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    tracing::debug!(middleware = middleware.name(), error = %e, "before short-circuit");
                    short_circuit = Some(e);
                    break;
                }
            }
        }

        let mut response = RESPONSE_POOL.checkout();
        response.metadata = std::mem::take(&mut request.metadata);
        match short_circuit {
            Some(error) => response.error = Some(error),
            None => {
                let handler_input = std::mem::take(&mut request.input);
                let started = Instant::now();
                match handler(handler_input).await {
                    Ok(output) => response.output = output,
                    Err(error) => response.error = Some(error),
                }
                response.duration = started.elapsed();
            }
        }

        for middleware in self.middlewares.iter().take(succeeded).rev() {
            if let Err(e) = middleware.after(cancel, &mut response).await {
                tracing::debug!(middleware = middleware.name(), error = %e, "after replaced error");
                response.error = Some(e);
            }
        }

        let output = match response.error.take() {
            Some(error) => Err(error),
            None => Ok(std::mem::take(&mut response.output)),
        };
        ChainOutcome {
            output,
            duration: response.duration,
            metadata: std::mem::take(&mut response.metadata),
        }
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain").field("order", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Middleware that records hook invocations into a shared trace.
    struct Tracer {
        name: &'static str,
        trace: Arc<Mutex<Vec<String>>>,
        fail_before: bool,
    }

    impl Tracer {
        fn new(name: &'static str, trace: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                trace,
                fail_before: false,
            }
        }

        fn failing(name: &'static str, trace: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                trace,
                fail_before: true,
            }
        }
    }

    #[async_trait]
    impl Middleware for Tracer {
        fn name(&self) -> &str {
            self.name
        }

        async fn before(
            &self,
            _cancel: &CancellationToken,
            _request: &mut MiddlewareRequest,
        ) -> Result<(), AgentError> {
            self.trace
                .lock()
                .unwrap()
                .push(format!("{}.before", self.name));
            if self.fail_before {
                Err(AgentError::Unauthorized(format!("{} denied", self.name)))
            } else {
                Ok(())
            }
        }

        async fn after(
            &self,
            _cancel: &CancellationToken,
            _response: &mut MiddlewareResponse,
        ) -> Result<(), AgentError> {
            self.trace
                .lock()
                .unwrap()
                .push(format!("{}.after", self.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn nesting_order_is_before_in_order_after_in_reverse() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new()
            .with(Arc::new(Tracer::new("m1", Arc::clone(&trace))))
            .with(Arc::new(Tracer::new("m2", Arc::clone(&trace))));
        let cancel = CancellationToken::new();

        let outcome = chain
            .run(&cancel, json!({"x": 1}), HashMap::new(), |input| async move {
                Ok(input)
            })
            .await;
        assert_eq!(outcome.output.unwrap(), json!({"x": 1}));
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["m1.before", "m2.before", "m2.after", "m1.after"]
        );
    }

    #[tokio::test]
    async fn before_error_skips_handler_and_later_befores() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new()
            .with(Arc::new(Tracer::new("m1", Arc::clone(&trace))))
            .with(Arc::new(Tracer::failing("m2", Arc::clone(&trace))))
            .with(Arc::new(Tracer::new("m3", Arc::clone(&trace))));
        let cancel = CancellationToken::new();

        let ran = Arc::new(Mutex::new(false));
        let ran_clone = Arc::clone(&ran);
        let outcome = chain
            .run(&cancel, json!(null), HashMap::new(), move |input| async move {
                *ran_clone.lock().unwrap() = true;
                Ok(input)
            })
            .await;

        assert!(!*ran.lock().unwrap(), "handler must be skipped");
        assert!(matches!(
            outcome.output,
            Err(AgentError::Unauthorized(_))
        ));
        // m2's before failed, so only m1 gets an after; pairing holds.
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["m1.before", "m2.before", "m1.after"]
        );
    }

    #[tokio::test]
    async fn after_can_transform_the_error() {
        struct Softener;

        #[async_trait]
        impl Middleware for Softener {
            fn name(&self) -> &str {
                "softener"
            }

            async fn after(
                &self,
                _cancel: &CancellationToken,
                response: &mut MiddlewareResponse,
            ) -> Result<(), AgentError> {
                if response.error.is_some() {
                    response.error = None;
                    response.output = json!("recovered");
                }
                Ok(())
            }
        }

        let chain = Chain::new().with(Arc::new(Softener));
        let cancel = CancellationToken::new();
        let outcome = chain
            .run(&cancel, json!(null), HashMap::new(), |_input| async move {
                Err(AgentError::Transient("flaky".into()))
            })
            .await;
        assert_eq!(outcome.output.unwrap(), json!("recovered"));
    }

    #[tokio::test]
    async fn before_can_transform_the_request() {
        struct Rewriter;

        #[async_trait]
        impl Middleware for Rewriter {
            fn name(&self) -> &str {
                "rewriter"
            }

            fn kind(&self) -> MiddlewareKind {
                MiddlewareKind::Transform
            }

            async fn before(
                &self,
                _cancel: &CancellationToken,
                request: &mut MiddlewareRequest,
            ) -> Result<(), AgentError> {
                request.input = json!({"wrapped": request.input});
                Ok(())
            }
        }

        let chain = Chain::new().with(Arc::new(Rewriter));
        let cancel = CancellationToken::new();
        let outcome = chain
            .run(&cancel, json!(7), HashMap::new(), |input| async move { Ok(input) })
            .await;
        assert_eq!(outcome.output.unwrap(), json!({"wrapped": 7}));
    }

    #[tokio::test]
    async fn with_returns_a_new_chain_leaving_the_original() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let base = Chain::new().with(Arc::new(Tracer::new("m1", Arc::clone(&trace))));
        let extended = base.with(Arc::new(Tracer::new("m2", Arc::clone(&trace))));
        assert_eq!(base.len(), 1);
        assert_eq!(extended.len(), 2);
        assert_eq!(base.names(), vec!["m1"]);
        assert_eq!(extended.names(), vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn empty_chain_just_runs_the_handler() {
        let chain = Chain::new();
        let cancel = CancellationToken::new();
        let outcome = chain
            .run(&cancel, json!(1), HashMap::new(), |input| async move { Ok(input) })
            .await;
        assert_eq!(outcome.output.unwrap(), json!(1));
        assert!(outcome.duration <= Duration::from_secs(1));
    }
}
