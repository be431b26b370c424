//! Streaming types and the five-mode event bus.
//!
//! Every boundary of a run can emit [`StreamEvent`]s: token deltas
//! (`messages`), loop/tool progress (`updates`), tool custom payloads
//! (`custom`), full-state snapshots and the terminal output (`values`), and
//! diagnostics (`debug`). The [`StreamMultiplexer`] merges the five
//! per-mode channels into one ordered output channel.
//!
//! # Main types
//!
//! - [`StreamMode`] / [`StreamPayload`] / [`StreamEvent`].
//! - [`StreamEmitter`]: non-blocking producer handle with per-mode drop
//!   counters.
//! - [`ToolStreamWriter`]: type-erased writer handed to tools; routes to
//!   mode `custom`.
//! - [`StreamMultiplexer`]: spawns the merge loop; see `multiplexer`.
//!
//! Ordering: within one mode, emission order is preserved on the output
//! channel; across modes the merge loop interleaves fairly.

mod multiplexer;

pub use multiplexer::{StreamEmitter, StreamMultiplexer, DEFAULT_CHANNEL_CAPACITY};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::agent::AgentOutput;

/// Wraps the merged output channel as a `futures::Stream`, for consumers
/// that prefer combinators over `recv` loops.
pub fn into_stream(rx: mpsc::Receiver<StreamEvent>) -> ReceiverStream<StreamEvent> {
    ReceiverStream::new(rx)
}

/// Stream mode selector: which kind of event this is, and which channel of
/// the multiplexer carries it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamMode {
    /// Token deltas / consolidated LLM messages.
    Messages,
    /// Incremental loop and tool-call progress.
    Updates,
    /// Custom JSON payloads emitted by tools through their runtime.
    Custom,
    /// Full state snapshots; also carries the terminal output event.
    Values,
    /// Diagnostics.
    Debug,
}

impl StreamMode {
    /// All modes, in channel-index order.
    pub const ALL: [StreamMode; 5] = [
        StreamMode::Messages,
        StreamMode::Updates,
        StreamMode::Custom,
        StreamMode::Values,
        StreamMode::Debug,
    ];

    pub(crate) fn index(&self) -> usize {
        match self {
            Self::Messages => 0,
            Self::Updates => 1,
            Self::Custom => 2,
            Self::Values => 3,
            Self::Debug => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Updates => "updates",
            Self::Custom => "custom",
            Self::Values => "values",
            Self::Debug => "debug",
        }
    }
}

/// One chunk of streamed message content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageChunk {
    pub content: String,
}

/// Payload of one stream event; the variant determines the mode.
#[derive(Clone, Debug)]
pub enum StreamPayload {
    /// Mode `messages`: one token delta or one consolidated message.
    Token(MessageChunk),
    /// Mode `updates`: progress from a named source (loop phase, tool call).
    Update { source: String, detail: Value },
    /// Mode `custom`: a tool's own payload.
    Custom(Value),
    /// Mode `values`: a full session-state snapshot.
    Snapshot { state: HashMap<String, Value> },
    /// Mode `values`: the terminal output; always the last event of a run.
    Final(Box<AgentOutput>),
    /// Mode `debug`: diagnostics.
    Debug { message: String, detail: Value },
}

impl StreamPayload {
    pub fn mode(&self) -> StreamMode {
        match self {
            Self::Token(_) => StreamMode::Messages,
            Self::Update { .. } => StreamMode::Updates,
            Self::Custom(_) => StreamMode::Custom,
            Self::Snapshot { .. } | Self::Final(_) => StreamMode::Values,
            Self::Debug { .. } => StreamMode::Debug,
        }
    }
}

/// A published event. Immutable once emitted.
#[derive(Clone, Debug)]
pub struct StreamEvent {
    pub payload: StreamPayload,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
}

impl StreamEvent {
    pub fn new(payload: StreamPayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn mode(&self) -> StreamMode {
        self.payload.mode()
    }

    pub fn token(content: impl Into<String>) -> Self {
        Self::new(StreamPayload::Token(MessageChunk {
            content: content.into(),
        }))
    }

    pub fn update(source: impl Into<String>, detail: Value) -> Self {
        Self::new(StreamPayload::Update {
            source: source.into(),
            detail,
        })
    }

    pub fn custom(value: Value) -> Self {
        Self::new(StreamPayload::Custom(value))
    }

    pub fn snapshot(state: HashMap<String, Value>) -> Self {
        Self::new(StreamPayload::Snapshot { state })
    }

    pub fn final_output(output: AgentOutput) -> Self {
        Self::new(StreamPayload::Final(Box::new(output)))
    }

    pub fn debug_event(message: impl Into<String>, detail: Value) -> Self {
        Self::new(StreamPayload::Debug {
            message: message.into(),
            detail,
        })
    }
}

/// A writer for emitting custom streaming events from tools.
///
/// Type-erased so tools stay ignorant of the bus; safe to clone across
/// tasks. Emission is non-blocking: `emit` returns `false` when the event
/// was dropped (no subscriber set, or a full channel).
///
/// **Interaction**: constructed by the executor from the session's
/// [`StreamEmitter`] and handed to runtime-aware tools via `ToolRuntime`.
#[derive(Clone)]
pub struct ToolStreamWriter {
    emit_fn: Arc<dyn Fn(Value) -> bool + Send + Sync>,
}

impl ToolStreamWriter {
    pub fn new(emit_fn: impl Fn(Value) -> bool + Send + Sync + 'static) -> Self {
        Self {
            emit_fn: Arc::new(emit_fn),
        }
    }

    /// A writer that drops everything. Used when streaming is not active.
    pub fn noop() -> Self {
        Self {
            emit_fn: Arc::new(|_| false),
        }
    }

    /// Emits a custom JSON payload. Returns whether the event was accepted.
    pub fn emit_custom(&self, value: Value) -> bool {
        (self.emit_fn)(value)
    }
}

impl Default for ToolStreamWriter {
    fn default() -> Self {
        Self::noop()
    }
}

impl std::fmt::Debug for ToolStreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolStreamWriter")
            .field("emit_fn", &"<fn>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_variant_determines_mode() {
        assert_eq!(StreamEvent::token("t").mode(), StreamMode::Messages);
        assert_eq!(StreamEvent::update("loop", json!({})).mode(), StreamMode::Updates);
        assert_eq!(StreamEvent::custom(json!(1)).mode(), StreamMode::Custom);
        assert_eq!(
            StreamEvent::snapshot(HashMap::new()).mode(),
            StreamMode::Values
        );
        assert_eq!(
            StreamEvent::debug_event("m", json!({})).mode(),
            StreamMode::Debug
        );
    }

    #[test]
    fn mode_index_is_stable_and_total() {
        for (i, mode) in StreamMode::ALL.iter().enumerate() {
            assert_eq!(mode.index(), i);
        }
    }

    #[test]
    fn noop_writer_reports_dropped() {
        let w = ToolStreamWriter::noop();
        assert!(!w.emit_custom(json!({"p": 1})));
    }

    #[test]
    fn metadata_builder_attaches_entries() {
        let e = StreamEvent::token("x").with_metadata("step", json!(2));
        assert_eq!(e.metadata.get("step"), Some(&json!(2)));
    }
}
