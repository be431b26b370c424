//! Agent construction.

use std::sync::Arc;
use std::time::Duration;

use crate::agent::{Agent, AgentCache, AgentOutput};
use crate::cache::InvocationCache;
use crate::checkpoint::{Checkpointer, MemorySaver};
use crate::error::AgentError;
use crate::executor::{ExecutorConfig, RetryPolicy, ToolExecutor};
use crate::interrupt::{InterruptManager, InterruptRule};
use crate::llm::LlmClient;
use crate::middleware::{Chain, Middleware};
use crate::prompts;
use crate::store::Store;
use crate::tool::{Tool, ToolRegistry};

/// Configuration-struct constructor for [`Agent`].
///
/// Only the LLM client is mandatory; everything else defaults sensibly
/// (10 steps, 4-way tool concurrency, 30 s tool timeout, 60 s LLM
/// timeout, default retry policy, in-memory checkpointer, no cache).
///
/// ```no_run
/// use axon::agent::AgentBuilder;
/// use axon::llm::MockLlm;
/// use std::sync::Arc;
///
/// let agent = AgentBuilder::new("researcher")
///     .llm(Arc::new(MockLlm::with_response("Final Answer: done")))
///     .max_steps(5)
///     .build()
///     .unwrap();
/// ```
pub struct AgentBuilder {
    name: String,
    description: String,
    llm: Option<Arc<dyn LlmClient>>,
    tools: Vec<Arc<dyn Tool>>,
    store: Option<Arc<dyn Store>>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    middleware: Vec<Arc<dyn Middleware>>,
    max_steps: usize,
    stop_patterns: Vec<String>,
    prompt_prefix: Option<String>,
    prompt_suffix: Option<String>,
    format_instructions: Option<String>,
    cache: Option<AgentCache>,
    interrupt_rules: Vec<InterruptRule>,
    max_tool_concurrency: usize,
    tool_timeout: Duration,
    llm_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl AgentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            llm: None,
            tools: Vec::new(),
            store: None,
            checkpointer: None,
            middleware: Vec::new(),
            max_steps: 10,
            stop_patterns: Vec::new(),
            prompt_prefix: None,
            prompt_suffix: None,
            format_instructions: None,
            cache: None,
            interrupt_rules: Vec::new(),
            max_tool_concurrency: 4,
            tool_timeout: Duration::from_secs(30),
            llm_timeout: Duration::from_secs(60),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Appends a middleware; declared order is execution order.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// LLM content is truncated at the first occurrence of any pattern
    /// before parsing (e.g. a hallucinated `Observation:`).
    pub fn stop_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.stop_patterns.push(pattern.into());
        self
    }

    pub fn prompt_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prompt_prefix = Some(prefix.into());
        self
    }

    pub fn prompt_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.prompt_suffix = Some(suffix.into());
        self
    }

    pub fn format_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.format_instructions = Some(instructions.into());
        self
    }

    /// Opt into invocation caching with an agent-private cache.
    pub fn cache(mut self, max_size: usize, ttl: Option<Duration>) -> Self {
        self.cache = Some(Arc::new(InvocationCache::new(max_size, ttl)));
        self
    }

    /// Opt into invocation caching with a shared cache (e.g. across
    /// agents serving the same workload).
    pub fn shared_cache(mut self, cache: AgentCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn interrupt_rule(mut self, rule: InterruptRule) -> Self {
        self.interrupt_rules.push(rule);
        self
    }

    pub fn max_tool_concurrency(mut self, limit: usize) -> Self {
        self.max_tool_concurrency = limit;
        self
    }

    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout = timeout;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Validates the configuration and builds the agent.
    ///
    /// Fails with `Validation` when no LLM is configured or a tool carries
    /// an invalid schema.
    pub fn build(self) -> Result<Agent, AgentError> {
        let llm = self
            .llm
            .ok_or_else(|| AgentError::Validation("agent requires an LLM client".into()))?;

        let mut registry = ToolRegistry::new();
        for tool in self.tools {
            registry.register(tool)?;
        }
        let registry = Arc::new(registry);

        let executor = ToolExecutor::new(
            Arc::clone(&registry),
            ExecutorConfig {
                max_concurrency: self.max_tool_concurrency,
                tool_timeout: self.tool_timeout,
                fail_fast: false,
                retry: self.retry_policy,
            },
        );

        Ok(Agent {
            name: self.name,
            description: self.description,
            llm,
            registry,
            executor,
            chain: Chain::from_middlewares(self.middleware),
            store: self.store,
            checkpointer: self
                .checkpointer
                .unwrap_or_else(|| Arc::new(MemorySaver::new())),
            interrupts: Arc::new(InterruptManager::new()),
            interrupt_rules: self.interrupt_rules,
            cache: self.cache,
            max_steps: self.max_steps,
            stop_patterns: self.stop_patterns,
            prompt_prefix: self.prompt_prefix,
            prompt_suffix: self.prompt_suffix,
            format_instructions: self
                .format_instructions
                .unwrap_or_else(|| prompts::FORMAT_INSTRUCTIONS.to_string()),
            llm_timeout: self.llm_timeout,
        })
    }
}

/// Builds the cache type used by [`AgentBuilder::shared_cache`].
pub fn shared_cache(max_size: usize, ttl: Option<Duration>) -> AgentCache {
    Arc::new(InvocationCache::<Arc<AgentOutput>>::new(max_size, ttl))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::tool::{FnTool, PropertySchema, ToolSchema};

    #[test]
    fn build_requires_an_llm() {
        let err = AgentBuilder::new("a").build().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn build_rejects_invalid_tool_schemas() {
        let bad = FnTool::new(
            "bad",
            ToolSchema::object().property("n", PropertySchema::number().range(5.0, 1.0)),
            |input| async move { Ok(input) },
        );
        let err = AgentBuilder::new("a")
            .llm(Arc::new(MockLlm::with_response("Final Answer: hi")))
            .tool(Arc::new(bad))
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn defaults_are_applied() {
        let agent = AgentBuilder::new("a")
            .llm(Arc::new(MockLlm::with_response("Final Answer: hi")))
            .build()
            .unwrap();
        assert_eq!(agent.name(), "a");
        assert_eq!(agent.max_steps, 10);
        assert_eq!(agent.executor.config().max_concurrency, 4);
        assert_eq!(agent.executor.config().tool_timeout, Duration::from_secs(30));
        assert_eq!(agent.llm_timeout, Duration::from_secs(60));
        assert!(agent.cache.is_none());
    }
}
