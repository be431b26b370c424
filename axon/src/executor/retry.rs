//! Retry policy: exponential backoff with jitter over a retryable-kind set.

use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;

use crate::error::ErrorKind;

/// When and how the executor retries a failed attempt.
///
/// The delay before retry `a` (zero-based) is
/// `min(initial_delay * multiplier^a, max_delay)` plus a jitter drawn from
/// `[0, delay/2]`. Kinds outside `retryable` never retry.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 means exactly one attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub retryable: HashSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            retryable: HashSet::from([
                ErrorKind::Transient,
                ErrorKind::RateLimited,
                ErrorKind::Timeout,
            ]),
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            multiplier,
            ..Self::default()
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable.contains(&kind)
    }

    /// Backoff before zero-based retry `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt as i32);
        let raw = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }

    /// Backoff with jitter in `[0, delay/2]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_cap = base / 2;
        if jitter_cap.is_zero() {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..=jitter_cap);
        base + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_grows_and_saturates() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_millis(10),
            Duration::from_millis(50),
            2.0,
        );
        assert_eq!(policy.base_delay(0), Duration::from_millis(10));
        assert_eq!(policy.base_delay(1), Duration::from_millis(20));
        assert_eq!(policy.base_delay(2), Duration::from_millis(40));
        assert_eq!(policy.base_delay(3), Duration::from_millis(50));
        assert_eq!(policy.base_delay(10), Duration::from_millis(50));
    }

    #[test]
    fn delay_jitter_stays_within_half_of_base() {
        let policy = RetryPolicy::new(
            3,
            Duration::from_millis(20),
            Duration::from_secs(1),
            2.0,
        );
        for attempt in 0..3 {
            let base = policy.base_delay(attempt);
            for _ in 0..32 {
                let d = policy.delay(attempt);
                assert!(d >= base);
                assert!(d <= base + base / 2);
            }
        }
    }

    #[test]
    fn default_retryable_kinds_match_the_taxonomy_defaults() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(ErrorKind::Transient));
        assert!(policy.is_retryable(ErrorKind::RateLimited));
        assert!(policy.is_retryable(ErrorKind::Timeout));
        assert!(!policy.is_retryable(ErrorKind::Validation));
        assert!(!policy.is_retryable(ErrorKind::Cancelled));
        assert!(!policy.is_retryable(ErrorKind::NotFound));
        assert!(!policy.is_retryable(ErrorKind::Unauthorized));
    }

    #[test]
    fn retryable_set_is_configurable() {
        let policy = RetryPolicy::default().with_retryable([ErrorKind::NotFound]);
        assert!(policy.is_retryable(ErrorKind::NotFound));
        assert!(!policy.is_retryable(ErrorKind::Transient));
    }
}
