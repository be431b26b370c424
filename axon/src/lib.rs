//! # Axon
//!
//! An agent execution runtime in Rust: a ReAct reasoning loop over an
//! injected LLM client, a bounded parallel tool executor, an immutable
//! middleware chain, per-session state with checkpointing, a five-mode
//! stream multiplexer, interrupt-and-resume, an invocation cache, and
//! object pools.
//!
//! ## Design principles
//!
//! - **Errors are values**: every tool failure becomes an observation fed
//!   back to the model; the loop fails outright only on parse failure,
//!   missing tools, cancellation, or internal defects.
//! - **Capabilities are injected**: the LLM client, tools, stores, and
//!   checkpointers are traits; the core never talks to a vendor.
//! - **Concurrency is confined**: the loop is a straight-line state
//!   machine; fan-out lives in the executor's semaphore, event merging in
//!   the stream multiplexer, and a `CancellationToken` threads through
//!   every suspension point.
//! - **Audit everything**: each run returns its full step log and tool
//!   call records alongside the result.
//!
//! ## Main modules
//!
//! - [`agent`]: [`Agent`] (`invoke` / `stream` / `resume`), [`AgentBuilder`],
//!   input/output types — the reasoning loop.
//! - [`executor`]: [`ToolExecutor`] — parallel, sequential, batch, and
//!   DAG dispatch with retry, timeout, and a concurrency semaphore.
//! - [`tool`]: the [`Tool`] capability, [`ToolSchema`] validation,
//!   [`ToolRegistry`], per-call [`ToolRuntime`].
//! - [`parser`]: the ReAct dialect (`Thought` / `Action` / `Action Input` /
//!   `Final Answer`).
//! - [`middleware`]: immutable [`Chain`] with before/after hooks around
//!   LLM and tool dispatch.
//! - [`stream`]: [`StreamMultiplexer`], five [`StreamMode`]s, writers.
//! - [`state`]: [`SessionState`] — per-session keyed values with a watch
//!   feed.
//! - [`checkpoint`]: [`Checkpointer`], [`MemorySaver`], [`StoreSaver`].
//! - [`store`]: the long-term [`Store`] boundary and [`InMemoryStore`].
//! - [`interrupt`]: rules, the pending registry, priorities and TTLs.
//! - [`cache`]: [`InvocationCache`] with fingerprinting and single-compute
//!   coalescing.
//! - [`llm`]: the [`LlmClient`] boundary and the scripted [`MockLlm`].
//! - [`pool`]: bounded object pools behind explicit init/close.
//!
//! Key types are re-exported at the crate root:
//! `use axon::{Agent, AgentBuilder, AgentInput, FnTool, MockLlm};`
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use axon::{AgentBuilder, AgentInput, FnTool, MockLlm, PropertySchema, ToolSchema};
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let search = FnTool::new(
//!     "search",
//!     ToolSchema::object().required_property("query", PropertySchema::string()),
//!     |_input| async move { Ok(json!("Found 10 results")) },
//! )
//! .with_description("web search");
//!
//! let agent = AgentBuilder::new("researcher")
//!     .llm(Arc::new(MockLlm::with_turns([
//!         "Thought: I need to search\nAction: search\nAction Input: {\"query\":\"rust\"}",
//!         "Thought: got it\nFinal Answer: Rust is a systems language",
//!     ])))
//!     .tool(Arc::new(search))
//!     .build()
//!     .unwrap();
//!
//! let output = agent
//!     .invoke(&CancellationToken::new(), AgentInput::new("what is rust?"))
//!     .await
//!     .unwrap();
//! assert_eq!(output.result, json!("Rust is a systems language"));
//! # }
//! ```

pub mod agent;
pub mod cache;
pub mod checkpoint;
pub mod error;
pub mod executor;
pub mod interrupt;
pub mod llm;
pub mod message;
pub mod middleware;
pub mod parser;
pub mod pool;
pub mod prompts;
pub mod state;
pub mod store;
pub mod stream;
pub mod tool;

pub use agent::{
    shared_cache, Agent, AgentBuilder, AgentCache, AgentInput, AgentOutput, ReasoningStep,
    RunStatus, StepKind,
};
pub use cache::{fingerprint, CacheStats, InvocationCache};
pub use checkpoint::{Checkpoint, CheckpointError, Checkpointer, MemorySaver, StoreSaver};
pub use error::{AgentError, ErrorKind};
pub use executor::{
    CallEnv, CallGraph, ExecutorConfig, RetryPolicy, ToolCall, ToolCallRecord, ToolExecutor,
};
pub use interrupt::{
    DecisionPhase, DecisionPoint, Interrupt, InterruptKind, InterruptManager, InterruptPriority,
    InterruptRule, InterruptSpec, InterruptStatus, Resolution, WaitOutcome,
};
pub use llm::{CompletionRequest, CompletionResponse, FinishReason, LlmClient, MockLlm, TokenUsage};
pub use message::Message;
pub use middleware::{
    Chain, ChainOutcome, LoggingMiddleware, Middleware, MiddlewareKind, MiddlewareRequest,
    MiddlewareResponse, TimingMiddleware,
};
pub use parser::{format_final, format_observation, format_step, parse, ParsedStep, ProposedAction};
pub use pool::{scratch_pool, shutdown_pools, Pool, PoolGuard, PoolStats, Poolable};
pub use state::{SessionState, StateChange};
pub use store::{namespace, InMemoryStore, Namespace, SearchHit, Store, StoreError};
pub use stream::{
    into_stream, MessageChunk, StreamEmitter, StreamEvent, StreamMode, StreamMultiplexer,
    StreamPayload, ToolStreamWriter,
};
pub use tool::{FnTool, PropertySchema, PropertyType, Tool, ToolRegistry, ToolRuntime, ToolSchema};

/// When running `cargo test -p axon`, initializes tracing from `RUST_LOG`
/// so unit tests in `src/**` can print logs with `--nocapture`.
#[cfg(test)]
mod test_logging {
    use ctor::ctor;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::Layer;

    #[ctor]
    fn init() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_filter(filter),
            )
            .try_init();
    }
}
