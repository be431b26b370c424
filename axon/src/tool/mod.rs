//! Tools: named callables with schema'd JSON input and structured output.
//!
//! A [`Tool`] is the capability the executor dispatches. Runtime-aware
//! tools opt in via [`Tool::runtime_aware`] and receive a fresh
//! [`ToolRuntime`] per invocation with non-owning handles to session state,
//! the long-term store, and the custom stream.
//!
//! # Main types
//!
//! - [`Tool`]: `name` / `description` / `schema` / `invoke`, optional
//!   `invoke_with_runtime`.
//! - [`FnTool`]: build a tool from a closure; the test fixture and the
//!   shortest path to a real tool.
//! - [`ToolRegistry`]: name → tool lookup, sorted listings for prompts.
//! - [`ToolSchema`] / [`PropertySchema`]: input schemas (see `schema`).
//!
//! Tools must be safe for concurrent invocation across distinct calls.

mod registry;
mod runtime;
mod schema;

pub use registry::ToolRegistry;
pub use runtime::ToolRuntime;
pub use schema::{clear_pattern_cache, PropertySchema, PropertyType, ToolSchema};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;

/// A named callable the LLM can invoke.
///
/// `invoke` receives the call-scoped cancellation token and the validated
/// input document. Long-running tools should observe the token.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name within a registry; what the LLM writes after `Action:`.
    fn name(&self) -> &str;

    /// One-line description shown to the LLM in the tool list.
    fn description(&self) -> &str {
        ""
    }

    /// Input schema. The executor validates inputs against it before
    /// dispatch; a violation is a non-retryable `Validation` error.
    fn schema(&self) -> ToolSchema;

    async fn invoke(&self, cancel: &CancellationToken, input: Value) -> Result<Value, AgentError>;

    /// Whether this tool wants the per-call [`ToolRuntime`]. The executor
    /// probes this and selects `invoke_with_runtime` when true.
    fn runtime_aware(&self) -> bool {
        false
    }

    /// Runtime-aware entry point; default delegates to [`Tool::invoke`].
    async fn invoke_with_runtime(
        &self,
        cancel: &CancellationToken,
        input: Value,
        _runtime: &ToolRuntime,
    ) -> Result<Value, AgentError> {
        self.invoke(cancel, input).await
    }
}

type Handler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, AgentError>> + Send + Sync>;

/// A [`Tool`] built from a closure.
///
/// ```
/// use axon::tool::{FnTool, PropertySchema, ToolSchema};
/// use serde_json::json;
///
/// let tool = FnTool::new(
///     "echo",
///     ToolSchema::object().required_property("text", PropertySchema::string()),
///     |input| async move { Ok(json!({"echo": input["text"]})) },
/// );
/// ```
pub struct FnTool {
    name: String,
    description: String,
    schema: ToolSchema,
    handler: Handler,
}

impl FnTool {
    pub fn new<F, Fut>(name: impl Into<String>, schema: ToolSchema, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, AgentError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            schema,
            handler: Arc::new(move |input| Box::pin(handler(input))),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> ToolSchema {
        self.schema.clone()
    }

    async fn invoke(&self, _cancel: &CancellationToken, input: Value) -> Result<Value, AgentError> {
        (self.handler)(input).await
    }
}
