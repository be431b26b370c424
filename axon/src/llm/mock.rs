//! Scripted LLM fixture.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{CompletionRequest, CompletionResponse, FinishReason, LlmClient, TokenUsage};
use crate::error::AgentError;
use crate::stream::MessageChunk;

/// LLM client that replays a fixed script of turns.
///
/// Each `complete` pops the next scripted turn; when the script runs out the
/// last turn repeats. Optional per-call latency makes cancellation paths
/// testable. When streaming, the content is split on whitespace and sent as
/// word chunks.
///
/// **Interaction**: the scenario tests drive the loop with this; it is also
/// a template for writing real clients.
pub struct MockLlm {
    turns: Mutex<Vec<String>>,
    cursor: Mutex<usize>,
    latency: Option<Duration>,
    usage: Option<TokenUsage>,
    calls: Mutex<u32>,
}

impl MockLlm {
    /// Replays `turns` in order; the last turn repeats once exhausted.
    pub fn with_turns<I, S>(turns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let turns: Vec<String> = turns.into_iter().map(Into::into).collect();
        Self {
            turns: Mutex::new(turns),
            cursor: Mutex::new(0),
            latency: None,
            usage: None,
            calls: Mutex::new(0),
        }
    }

    /// Single fixed response.
    pub fn with_response(content: impl Into<String>) -> Self {
        Self::with_turns([content.into()])
    }

    /// Sleep this long inside every call (cancellable by the caller racing
    /// the future).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Attach fixed usage to every response.
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// How many completions have been served.
    pub fn call_count(&self) -> u32 {
        *self.calls.lock().expect("mock lock")
    }

    fn next_turn(&self) -> Result<String, AgentError> {
        let turns = self.turns.lock().expect("mock lock");
        if turns.is_empty() {
            return Err(AgentError::Internal("MockLlm has no turns".into()));
        }
        let mut cursor = self.cursor.lock().expect("mock lock");
        let turn = turns[(*cursor).min(turns.len() - 1)].clone();
        *cursor += 1;
        Ok(turn)
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, AgentError> {
        *self.calls.lock().expect("mock lock") += 1;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        Ok(CompletionResponse {
            content: self.next_turn()?,
            usage: self.usage,
            finish_reason: FinishReason::Stop,
            model: "mock".into(),
        })
    }

    async fn complete_stream(
        &self,
        request: CompletionRequest,
        chunk_tx: Option<mpsc::Sender<MessageChunk>>,
    ) -> Result<CompletionResponse, AgentError> {
        let response = self.complete(request).await?;
        if let Some(tx) = chunk_tx {
            for word in response.content.split_inclusive(char::is_whitespace) {
                let _ = tx
                    .send(MessageChunk {
                        content: word.to_string(),
                    })
                    .await;
            }
        }
        Ok(response)
    }

    fn provider(&self) -> &str {
        "mock"
    }
}
