//! Crate-wide error type and the error taxonomy.
//!
//! Every fallible boundary in the runtime speaks [`AgentError`]; the
//! [`ErrorKind`] taxonomy drives policy decisions (retry, surface, propagate)
//! without matching on message strings.
//!
//! # Main types
//!
//! - [`AgentError`]: one variant per taxonomy kind, `thiserror`-derived.
//! - [`ErrorKind`]: the kind used by retry policies and exit-code mapping.
//!
//! **Interaction**: the executor consults [`AgentError::kind`] against
//! `RetryPolicy::retryable`; the loop maps the terminal kind to an exit code;
//! tool errors are folded into observations rather than failing the run.

use std::time::Duration;

/// Classification of an error, independent of its message.
///
/// The default policy per kind mirrors the runtime's behavior: Transient,
/// RateLimited and Timeout retry under the executor's policy; Validation,
/// Parse, Cancelled, NotFound, Unauthorized and Internal do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Schema or input violation.
    Validation,
    /// LLM output did not conform to the expected dialect.
    Parse,
    /// Network, 5xx, flaky dependency.
    Transient,
    /// Upstream 429.
    RateLimited,
    /// Deadline exceeded.
    Timeout,
    /// The driving context was cancelled.
    Cancelled,
    /// Missing tool, model, or key.
    NotFound,
    /// Auth or permission failure.
    Unauthorized,
    /// Invariant violation inside the runtime.
    Internal,
}

impl ErrorKind {
    /// Whether this kind is retried by the default retry policy.
    pub fn retryable_by_default(&self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited | Self::Timeout)
    }

    /// Exit code for CLI collaborators embedding a terminal error of this kind.
    ///
    /// Success, partial and expired runs are mapped by the loop from status,
    /// not from an error kind; see `AgentOutput::exit_code`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation | Self::Parse | Self::NotFound | Self::Unauthorized => 2,
            Self::Transient | Self::RateLimited | Self::Timeout => 3,
            Self::Cancelled => 4,
            Self::Internal => 2,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Parse => "parse",
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Error type shared by the loop, executor, tools, and middleware.
///
/// Cloneable so that call records and reasoning steps can carry the error
/// they observed while the original propagates.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        /// Upstream Retry-After, when the provider supplied one.
        retry_after: Option<Duration>,
    },
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl AgentError {
    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Parse(_) => ErrorKind::Parse,
            Self::Transient(_) => ErrorKind::Transient,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Upstream-suggested retry delay, if any (only `RateLimited` carries one).
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(
            AgentError::Validation("bad".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(AgentError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            AgentError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn default_retryable_set_is_transient_ratelimited_timeout() {
        assert!(ErrorKind::Transient.retryable_by_default());
        assert!(ErrorKind::RateLimited.retryable_by_default());
        assert!(ErrorKind::Timeout.retryable_by_default());
        assert!(!ErrorKind::Validation.retryable_by_default());
        assert!(!ErrorKind::Cancelled.retryable_by_default());
        assert!(!ErrorKind::NotFound.retryable_by_default());
        assert!(!ErrorKind::Unauthorized.retryable_by_default());
    }

    #[test]
    fn retry_after_only_on_rate_limited() {
        let e = AgentError::RateLimited {
            message: "429".into(),
            retry_after: Some(Duration::from_millis(250)),
        };
        assert_eq!(e.retry_after(), Some(Duration::from_millis(250)));
        assert_eq!(AgentError::Cancelled.retry_after(), None);
    }

    #[test]
    fn exit_codes_follow_the_cli_contract() {
        assert_eq!(ErrorKind::Validation.exit_code(), 2);
        assert_eq!(ErrorKind::Transient.exit_code(), 3);
        assert_eq!(ErrorKind::Cancelled.exit_code(), 4);
    }
}
