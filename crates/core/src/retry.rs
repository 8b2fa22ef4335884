use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Provider failure classification. Only the first three classes are
/// eligible for retry and fallback; `Fatal` always surfaces immediately.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    RateLimited,
    Timeout,
    Transient,
    Fatal,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal)
    }
}

/// Per-model retry budget with exponential backoff. Attempt numbering is
/// 1-based: the wait after attempt `k` is `base_delay_ms * 2^(k-1)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay_ms: 1_000 }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let multiplier = 1_u64 << exponent;
        Duration::from_millis(self.base_delay_ms.saturating_mul(multiplier))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{FailureClass, RetryPolicy};

    #[test]
    fn default_policy_waits_one_two_four_seconds() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let policy = RetryPolicy { max_attempts: 64, base_delay_ms: u64::MAX };

        assert_eq!(policy.backoff(40), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn only_fatal_is_not_retryable() {
        assert!(FailureClass::RateLimited.is_retryable());
        assert!(FailureClass::Timeout.is_retryable());
        assert!(FailureClass::Transient.is_retryable());
        assert!(!FailureClass::Fatal.is_retryable());
    }
}
