//! Retry decisions for failed attempts

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::config::ExecutorConfig;

use crate::error::ExecutionError;
use crate::queue::Completion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ExecutorConfig::default())
    }
}

impl From<&ExecutorConfig> for RetryPolicy {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(2_u32.pow(exponent))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide what happens to an entry after its `attempts`-th attempt
    /// failed with `error`.
    pub fn decide(&self, attempts: u32, error: &ExecutionError, now: DateTime<Utc>) -> Completion {
        if !error.is_transient() || attempts >= self.max_attempts {
            return Completion::Failed;
        }
        let delay = chrono::Duration::from_std(self.backoff(attempts))
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        Completion::Retry {
            next_attempt_at: now + delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionErrorKind;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(150),
        }
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_secs(60));
        assert_eq!(p.backoff(2), Duration::from_secs(120));
        assert_eq!(p.backoff(3), Duration::from_secs(150));
        assert_eq!(p.backoff(40), Duration::from_secs(150));
    }

    #[test]
    fn test_transient_errors_retry_until_limit() {
        let p = policy();
        let now = Utc::now();
        let busy = ExecutionError::classify(ExecutionErrorKind::ResourceBusy, "locked");

        assert_eq!(
            p.decide(1, &busy, now),
            Completion::Retry {
                next_attempt_at: now + chrono::Duration::seconds(60)
            }
        );
        assert!(matches!(p.decide(2, &busy, now), Completion::Retry { .. }));
        assert_eq!(p.decide(3, &busy, now), Completion::Failed);
    }

    #[test]
    fn test_fatal_errors_fail_immediately() {
        let denied = ExecutionError::classify(ExecutionErrorKind::PermissionDenied, "no grant");
        assert_eq!(policy().decide(1, &denied, Utc::now()), Completion::Failed);
    }

    #[test]
    fn test_zero_base_delay_retries_next_cycle() {
        let p = RetryPolicy {
            base_delay: Duration::ZERO,
            ..policy()
        };
        let now = Utc::now();
        let busy = ExecutionError::classify(ExecutionErrorKind::Contention, "lost race");
        assert_eq!(
            p.decide(1, &busy, now),
            Completion::Retry {
                next_attempt_at: now
            }
        );
    }
}
