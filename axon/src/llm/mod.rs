//! LLM client abstraction consumed by the reasoning loop.
//!
//! The core never talks to a vendor; an implementation of [`LlmClient`] is
//! injected. The loop prefers [`LlmClient::complete_stream`] when the
//! `messages` stream mode is subscribed, forwarding token deltas through an
//! mpsc sender; the default implementation calls [`LlmClient::complete`]
//! and forwards the full content as one chunk.
//!
//! # Main types
//!
//! - [`LlmClient`]: `complete` / `chat` / `complete_stream` / `provider` /
//!   `available`.
//! - [`CompletionResponse`]: content plus [`TokenUsage`] and
//!   [`FinishReason`].
//! - [`MockLlm`]: scripted multi-turn fixture with optional per-call
//!   latency, used throughout the scenario tests.

mod mock;

pub use mock::MockLlm;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::AgentError;
use crate::message::Message;
use crate::stream::MessageChunk;

/// One completion request: chat messages plus optional stop sequences.
#[derive(Clone, Debug, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    /// Generation stops at the first occurrence of any of these.
    pub stop: Vec<String>,
    pub metadata: HashMap<String, Value>,
}

impl CompletionRequest {
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }
}

/// Token usage for one LLM call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Field-wise sum; the loop accumulates usage across steps with this.
    pub fn add(&self, other: &TokenUsage) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens + other.prompt_tokens,
            completion_tokens: self.completion_tokens + other.completion_tokens,
            total_tokens: self.total_tokens + other.total_tokens,
        }
    }
}

/// Why the provider stopped generating.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    Stop,
    Length,
    ContentFilter,
    Other,
}

/// Response from one completion.
#[derive(Clone, Debug)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: Option<TokenUsage>,
    pub finish_reason: FinishReason,
    /// Model identifier the provider actually served.
    pub model: String,
}

/// Chat/complete/stream capability over messages.
///
/// Implementations must be safe for concurrent calls; the core shares one
/// client across sessions. `available` lets the loop fail fast when a
/// provider is not configured.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One completion turn.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, AgentError>;

    /// Convenience: complete over a plain message slice.
    async fn chat(&self, messages: &[Message]) -> Result<CompletionResponse, AgentError> {
        self.complete(CompletionRequest::from_messages(messages.to_vec()))
            .await
    }

    /// Streaming variant. When `chunk_tx` is `Some`, implementations send
    /// token deltas as they arrive and still return the consolidated
    /// response. The default forwards the full content as a single chunk.
    async fn complete_stream(
        &self,
        request: CompletionRequest,
        chunk_tx: Option<mpsc::Sender<MessageChunk>>,
    ) -> Result<CompletionResponse, AgentError> {
        let response = self.complete(request).await?;
        if let Some(tx) = chunk_tx {
            if !response.content.is_empty() {
                let _ = tx
                    .send(MessageChunk {
                        content: response.content.clone(),
                    })
                    .await;
            }
        }
        Ok(response)
    }

    /// Provider identifier, for logs and output metadata.
    fn provider(&self) -> &str {
        "unknown"
    }

    /// Whether the client is configured and reachable enough to try.
    fn available(&self) -> bool {
        true
    }
}
