//! The reasoning loop: a ReAct agent over injected LLM and tools.
//!
//! One [`Agent`] serves many sessions; each `invoke`/`stream`/`resume`
//! call is one session with its own [`SessionState`], step log, and
//! cancellation scope. The loop is a straight-line state machine —
//! Start → (Prompt → ParseStep → Act → Observe)* → End — with concurrency
//! confined to the tool executor and the stream multiplexer.
//!
//! # Main types
//!
//! - [`Agent`]: [`Agent::invoke`], [`Agent::stream`], [`Agent::resume`].
//! - [`AgentBuilder`]: configuration-struct constructor.
//! - [`AgentInput`] / [`AgentOutput`] / [`ReasoningStep`] / [`RunStatus`].
//!
//! # Quick start
//!
//! ```no_run
//! use axon::agent::{AgentBuilder, AgentInput};
//! use axon::llm::MockLlm;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let agent = AgentBuilder::new("echo")
//!     .llm(Arc::new(MockLlm::with_response("Final Answer: hello")))
//!     .build()
//!     .unwrap();
//! let out = agent
//!     .invoke(&CancellationToken::new(), AgentInput::new("say hello"))
//!     .await
//!     .unwrap();
//! assert_eq!(out.result, serde_json::json!("hello"));
//! # }
//! ```
//!
//! [`SessionState`]: crate::state::SessionState

mod builder;
mod runner;
mod types;

pub use builder::{shared_cache, AgentBuilder};
pub use types::{AgentInput, AgentOutput, ReasoningStep, RunStatus, StepKind};

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheStats, InvocationCache};
use crate::checkpoint::Checkpointer;
use crate::executor::ToolExecutor;
use crate::interrupt::{InterruptManager, InterruptRule};
use crate::llm::LlmClient;
use crate::middleware::Chain;
use crate::store::Store;
use crate::tool::ToolRegistry;

/// Cache type an agent consults on entry: fingerprint → shared terminal
/// output.
pub type AgentCache = Arc<InvocationCache<Arc<AgentOutput>>>;

/// A configured reasoning agent. Cheap to share behind an `Arc`; all
/// per-session state lives in the run, not here.
pub struct Agent {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) llm: Arc<dyn LlmClient>,
    pub(crate) registry: Arc<ToolRegistry>,
    pub(crate) executor: ToolExecutor,
    pub(crate) chain: Chain,
    pub(crate) store: Option<Arc<dyn Store>>,
    pub(crate) checkpointer: Arc<dyn Checkpointer>,
    pub(crate) interrupts: Arc<InterruptManager>,
    pub(crate) interrupt_rules: Vec<InterruptRule>,
    pub(crate) cache: Option<AgentCache>,
    pub(crate) max_steps: usize,
    pub(crate) stop_patterns: Vec<String>,
    pub(crate) prompt_prefix: Option<String>,
    pub(crate) prompt_suffix: Option<String>,
    pub(crate) format_instructions: String,
    pub(crate) llm_timeout: Duration,
}

impl Agent {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// The pending-interrupt registry; callers resolve through
    /// [`Agent::resume`] or attach hooks here.
    pub fn interrupts(&self) -> &InterruptManager {
        &self.interrupts
    }

    /// The checkpointer backing interrupt parking and resume.
    pub fn checkpointer(&self) -> &Arc<dyn Checkpointer> {
        &self.checkpointer
    }

    /// Cache statistics, when a cache is configured.
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|c| c.stats())
    }

    /// Registered tool names, sorted.
    pub fn tool_names(&self) -> Vec<String> {
        self.registry.names()
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("tools", &self.registry.len())
            .field("max_steps", &self.max_steps)
            .field("cache", &self.cache.is_some())
            .finish()
    }
}
