//! Built-in middlewares: logging and timing.

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{Middleware, MiddlewareKind, MiddlewareRequest, MiddlewareResponse};
use crate::error::AgentError;

/// Logs request entry and response outcome through `tracing`.
#[derive(Debug, Default)]
pub struct LoggingMiddleware {
    target: Option<String>,
}

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label included in every log line (e.g. the agent name).
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    fn kind(&self) -> MiddlewareKind {
        MiddlewareKind::Logging
    }

    async fn before(
        &self,
        _cancel: &CancellationToken,
        request: &mut MiddlewareRequest,
    ) -> Result<(), AgentError> {
        tracing::debug!(
            target: "axon::middleware",
            label = self.target.as_deref().unwrap_or(""),
            at = %request.timestamp,
            "request enter"
        );
        Ok(())
    }

    async fn after(
        &self,
        _cancel: &CancellationToken,
        response: &mut MiddlewareResponse,
    ) -> Result<(), AgentError> {
        match &response.error {
            Some(error) => tracing::warn!(
                target: "axon::middleware",
                label = self.target.as_deref().unwrap_or(""),
                ?error,
                duration_ms = response.duration.as_millis() as u64,
                "request failed"
            ),
            None => tracing::debug!(
                target: "axon::middleware",
                label = self.target.as_deref().unwrap_or(""),
                duration_ms = response.duration.as_millis() as u64,
                "request done"
            ),
        }
        Ok(())
    }
}

/// Records the handler duration into response metadata under
/// `"duration_ms"`.
#[derive(Debug, Default)]
pub struct TimingMiddleware;

impl TimingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for TimingMiddleware {
    fn name(&self) -> &str {
        "timing"
    }

    fn kind(&self) -> MiddlewareKind {
        MiddlewareKind::Timing
    }

    async fn after(
        &self,
        _cancel: &CancellationToken,
        response: &mut MiddlewareResponse,
    ) -> Result<(), AgentError> {
        response
            .metadata
            .insert("duration_ms".into(), json!(response.duration.as_millis() as u64));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Chain;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[tokio::test]
    async fn timing_writes_duration_metadata() {
        let chain = Chain::new().with(Arc::new(TimingMiddleware::new()));
        let cancel = CancellationToken::new();
        let outcome = chain
            .run(&cancel, json!(null), HashMap::new(), |_input| async move {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                Ok(json!("ok"))
            })
            .await;
        assert!(outcome.metadata.contains_key("duration_ms"));
    }

    #[tokio::test]
    async fn logging_passes_requests_through_untouched() {
        let chain = Chain::new().with(Arc::new(LoggingMiddleware::new().with_target("test")));
        let cancel = CancellationToken::new();
        let outcome = chain
            .run(&cancel, json!({"q": 1}), HashMap::new(), |input| async move {
                Ok(input)
            })
            .await;
        assert_eq!(outcome.output.unwrap(), json!({"q": 1}));
    }
}
