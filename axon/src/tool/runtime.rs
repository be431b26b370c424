//! Per-invocation runtime bundle for runtime-aware tools.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::state::SessionState;
use crate::store::Store;
use crate::stream::ToolStreamWriter;

/// Handles a runtime-aware tool may use during one invocation.
///
/// Constructed fresh per call by the executor; no two invocations share an
/// instance, and nothing here owns the session — the state and store are
/// shared handles, the stream writer routes to mode `custom`.
///
/// **Interaction**: built by `ToolExecutor` from its `CallEnv`; reaches the
/// tool through [`Tool::invoke_with_runtime`](crate::tool::Tool::invoke_with_runtime).
#[derive(Clone)]
pub struct ToolRuntime {
    state: Arc<SessionState>,
    store: Option<Arc<dyn Store>>,
    session_id: String,
    tool_call_id: String,
    stream: ToolStreamWriter,
    metadata: HashMap<String, Value>,
}

impl ToolRuntime {
    pub fn new(
        state: Arc<SessionState>,
        store: Option<Arc<dyn Store>>,
        session_id: impl Into<String>,
        tool_call_id: impl Into<String>,
        stream: ToolStreamWriter,
    ) -> Self {
        Self {
            state,
            store,
            session_id: session_id.into(),
            tool_call_id: tool_call_id.into(),
            stream,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Session state handle; reads are consistent with the session.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn store(&self) -> Option<&Arc<dyn Store>> {
        self.store.as_ref()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Id of the tool call this runtime was built for.
    pub fn tool_call_id(&self) -> &str {
        &self.tool_call_id
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    /// Emits a custom stream event. Returns whether it was accepted.
    pub fn emit(&self, value: Value) -> bool {
        self.stream.emit_custom(value)
    }

    /// Runtime with a fresh state and a no-op stream, for tool unit tests.
    pub fn for_tests(session_id: &str, tool_call_id: &str) -> Self {
        Self::new(
            Arc::new(SessionState::new(session_id)),
            None,
            session_id,
            tool_call_id,
            ToolStreamWriter::noop(),
        )
    }
}

impl std::fmt::Debug for ToolRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRuntime")
            .field("session_id", &self.session_id)
            .field("tool_call_id", &self.tool_call_id)
            .field("store", &self.store.is_some())
            .finish()
    }
}
