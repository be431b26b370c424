//! Tool executor: bounded parallel dispatch with retry and timeouts.
//!
//! All dispatch paths funnel through one per-call driver: validate input,
//! acquire a semaphore permit, race the invocation against its timeout and
//! the run's cancellation, retry retryable failures with exponential
//! backoff, and write the outcome into an index-aligned result buffer.
//!
//! # Main types
//!
//! - [`ToolExecutor`]: [`execute_parallel`](ToolExecutor::execute_parallel),
//!   [`execute_sequential`](ToolExecutor::execute_sequential),
//!   [`execute_graph`](ToolExecutor::execute_graph),
//!   [`execute_batch`](ToolExecutor::execute_batch).
//! - [`ToolCall`] / [`ToolCallRecord`]: one requested call and its audited
//!   outcome. Retries increment `attempts` on the same record.
//! - [`CallEnv`]: per-session environment (cancel token, state, store,
//!   stream) the per-call [`ToolRuntime`] is built from.
//! - [`RetryPolicy`] (see `retry`), [`CallGraph`] (see `graph`).
//!
//! Invariants: `results.len() == calls.len()`; `results[i].id == calls[i].id`;
//! at most `max_concurrency` invocations are in flight; no detached tasks
//! survive a return.
//!
//! [`ToolRuntime`]: crate::tool::ToolRuntime

mod graph;
mod retry;

pub use graph::CallGraph;
pub use retry::RetryPolicy;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, ErrorKind};
use crate::state::SessionState;
use crate::store::Store;
use crate::stream::{StreamEmitter, ToolStreamWriter};
use crate::tool::{Tool, ToolRegistry, ToolRuntime};

/// One requested tool invocation.
#[derive(Clone, Debug)]
pub struct ToolCall {
    /// Unique within the session.
    pub id: String,
    pub name: String,
    /// Argument document matching the tool's schema.
    pub input: Value,
    /// Per-call timeout override; the executor default applies when `None`.
    pub timeout: Option<Duration>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, input: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            input,
            timeout: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Audited outcome of one tool call.
///
/// A retried call stays one record; `attempts` counts every try.
#[derive(Clone, Debug)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration: Duration,
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<AgentError>,
    pub attempts: u32,
}

impl ToolCallRecord {
    /// The textual form fed back into the scratchpad as an Observation.
    pub fn observation_text(&self) -> String {
        if let Some(output) = &self.output {
            match output {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }
        } else if let Some(error) = &self.error {
            format!("error: {error}")
        } else {
            String::new()
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(AgentError::kind)
    }
}

/// Executor configuration; `Default` carries the standard limits.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Upper bound on concurrently running invocations.
    pub max_concurrency: usize,
    /// Default per-call timeout.
    pub tool_timeout: Duration,
    /// Sequential and graph execution stop at the first failure.
    pub fail_fast: bool,
    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            tool_timeout: Duration::from_secs(30),
            fail_fast: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Per-session environment the executor threads into every call.
///
/// Cheap to clone; everything inside is a handle.
#[derive(Clone)]
pub struct CallEnv {
    pub cancel: CancellationToken,
    pub session_id: String,
    pub state: Arc<SessionState>,
    pub store: Option<Arc<dyn Store>>,
    pub stream: Option<StreamEmitter>,
}

impl CallEnv {
    pub fn new(
        cancel: CancellationToken,
        state: Arc<SessionState>,
        store: Option<Arc<dyn Store>>,
        stream: Option<StreamEmitter>,
    ) -> Self {
        Self {
            cancel,
            session_id: state.session_id().to_string(),
            state,
            store,
            stream,
        }
    }

    /// Fresh environment with its own state and no stream; test fixture.
    pub fn for_tests(session_id: &str) -> Self {
        Self::new(
            CancellationToken::new(),
            Arc::new(SessionState::new(session_id)),
            None,
            None,
        )
    }

    fn tool_writer(&self) -> ToolStreamWriter {
        self.stream
            .as_ref()
            .map(StreamEmitter::tool_writer)
            .unwrap_or_else(ToolStreamWriter::noop)
    }
}

impl std::fmt::Debug for CallEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEnv")
            .field("session_id", &self.session_id)
            .field("store", &self.store.is_some())
            .field("stream", &self.stream.is_some())
            .finish()
    }
}

/// Dispatches tool calls under the session's concurrency, timeout, and
/// retry rules.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    config: ExecutorConfig,
    semaphore: Arc<Semaphore>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, config: ExecutorConfig) -> Self {
        let permits = config.max_concurrency.max(1);
        Self {
            registry,
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Runs `calls` with up to `max_concurrency` in flight.
    ///
    /// `results[i]` always corresponds to `calls[i]`; errors (including
    /// cancellation) land in the record, never shift indices. Returns once
    /// every spawned task has finished.
    pub async fn execute_parallel(&self, env: &CallEnv, calls: Vec<ToolCall>) -> Vec<ToolCallRecord> {
        let mut handles: Vec<(usize, ToolCall, JoinHandle<ToolCallRecord>)> =
            Vec::with_capacity(calls.len());
        for (index, call) in calls.into_iter().enumerate() {
            let driver = CallDriver {
                registry: Arc::clone(&self.registry),
                semaphore: Arc::clone(&self.semaphore),
                config: self.config.clone(),
                env: env.clone(),
            };
            let spawned = call.clone();
            handles.push((index, call, tokio::spawn(async move { driver.run(spawned).await })));
        }

        let mut results: Vec<Option<ToolCallRecord>> = Vec::new();
        results.resize_with(handles.len(), || None);
        for (index, call, handle) in handles {
            let record = match handle.await {
                Ok(record) => record,
                // A panicking tool must not take the batch down.
                Err(join_err) => failed_record(
                    &call,
                    Utc::now(),
                    Instant::now(),
                    1,
                    AgentError::Internal(format!("tool task failed: {join_err}")),
                ),
            };
            results[index] = Some(record);
        }
        results.into_iter().flatten().collect()
    }

    /// Runs `calls` one at a time in order. Under `fail_fast` the first
    /// failed record ends the batch; later calls are not attempted.
    pub async fn execute_sequential(
        &self,
        env: &CallEnv,
        calls: Vec<ToolCall>,
    ) -> Vec<ToolCallRecord> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let driver = CallDriver {
                registry: Arc::clone(&self.registry),
                semaphore: Arc::clone(&self.semaphore),
                config: self.config.clone(),
                env: env.clone(),
            };
            let record = driver.run(call).await;
            let failed = !record.success;
            results.push(record);
            if failed && self.config.fail_fast {
                break;
            }
        }
        results
    }

    /// Runs one tool over many inputs as a parallel batch.
    pub async fn execute_batch(
        &self,
        env: &CallEnv,
        tool_name: &str,
        inputs: Vec<Value>,
    ) -> Vec<ToolCallRecord> {
        let calls = inputs
            .into_iter()
            .map(|input| ToolCall::new(tool_name, input))
            .collect();
        self.execute_parallel(env, calls).await
    }

    /// Runs a dependency graph of calls; see [`CallGraph`].
    pub async fn execute_graph(
        &self,
        env: &CallEnv,
        graph: CallGraph,
    ) -> Result<std::collections::HashMap<String, ToolCallRecord>, AgentError> {
        graph::execute(self, env, graph).await
    }
}

impl std::fmt::Debug for ToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolExecutor")
            .field("tools", &self.registry.len())
            .field("max_concurrency", &self.config.max_concurrency)
            .finish()
    }
}

/// Everything one spawned call needs; owned so the task is `'static`.
struct CallDriver {
    registry: Arc<ToolRegistry>,
    semaphore: Arc<Semaphore>,
    config: ExecutorConfig,
    env: CallEnv,
}

impl CallDriver {
    async fn run(&self, call: ToolCall) -> ToolCallRecord {
        let started_at = Utc::now();
        let started = Instant::now();

        let tool = match self.registry.get(&call.name) {
            Some(tool) => tool,
            None => {
                return failed_record(
                    &call,
                    started_at,
                    started,
                    1,
                    AgentError::NotFound(format!("tool {:?}", call.name)),
                )
            }
        };
        if let Err(e) = tool.schema().validate_input(&call.input) {
            return failed_record(&call, started_at, started, 1, e);
        }

        let timeout = call.timeout.unwrap_or(self.config.tool_timeout);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if self.env.cancel.is_cancelled() {
                return failed_record(&call, started_at, started, attempts, AgentError::Cancelled);
            }

            match self.attempt(&tool, &call, timeout).await {
                Ok(output) => {
                    let ended_at = Utc::now();
                    return ToolCallRecord {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.input.clone(),
                        started_at,
                        ended_at,
                        duration: started.elapsed(),
                        success: true,
                        output: Some(output),
                        error: None,
                        attempts,
                    };
                }
                Err(error) => {
                    let retries_used = attempts - 1;
                    let retryable = self.config.retry.is_retryable(error.kind());
                    if !retryable || retries_used >= self.config.retry.max_retries {
                        return failed_record(&call, started_at, started, attempts, error);
                    }
                    let mut delay = self.config.retry.delay(retries_used);
                    if let Some(after) = error.retry_after() {
                        delay = delay.max(after);
                    }
                    tracing::debug!(
                        tool = %call.name,
                        call_id = %call.id,
                        attempt = attempts,
                        ?delay,
                        error = %error,
                        "retrying tool call"
                    );
                    tokio::select! {
                        _ = self.env.cancel.cancelled() => {
                            return failed_record(
                                &call,
                                started_at,
                                started,
                                attempts,
                                AgentError::Cancelled,
                            );
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One permit-bounded, timeout-raced invocation.
    async fn attempt(
        &self,
        tool: &Arc<dyn Tool>,
        call: &ToolCall,
        timeout: Duration,
    ) -> Result<Value, AgentError> {
        let permit = tokio::select! {
            _ = self.env.cancel.cancelled() => return Err(AgentError::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit
                .map_err(|_| AgentError::Internal("executor semaphore closed".into()))?,
        };

        // The call's own token derives from the run's; cancelling the run
        // reaches the tool, and a timeout cancels only this call.
        let call_cancel = self.env.cancel.child_token();
        let invocation = async {
            if tool.runtime_aware() {
                let runtime = ToolRuntime::new(
                    Arc::clone(&self.env.state),
                    self.env.store.clone(),
                    self.env.session_id.clone(),
                    call.id.clone(),
                    self.env.tool_writer(),
                );
                tool.invoke_with_runtime(&call_cancel, call.input.clone(), &runtime)
                    .await
            } else {
                tool.invoke(&call_cancel, call.input.clone()).await
            }
        };

        let outcome = tokio::select! {
            _ = self.env.cancel.cancelled() => {
                call_cancel.cancel();
                Err(AgentError::Cancelled)
            }
            result = tokio::time::timeout(timeout, invocation) => match result {
                Ok(inner) => inner,
                Err(_) => {
                    call_cancel.cancel();
                    Err(AgentError::Timeout(timeout))
                }
            },
        };
        drop(permit);
        outcome
    }
}

fn failed_record(
    call: &ToolCall,
    started_at: DateTime<Utc>,
    started: Instant,
    attempts: u32,
    error: AgentError,
) -> ToolCallRecord {
    ToolCallRecord {
        id: call.id.clone(),
        name: call.name.clone(),
        input: call.input.clone(),
        started_at,
        ended_at: Utc::now(),
        duration: started.elapsed(),
        success: false,
        output: None,
        error: Some(error),
        attempts,
    }
}
