use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded retry: attempt count, pause between attempts and a per-attempt timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub timeout_ms: u64,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay_ms: u64, timeout_ms: u64) -> Self {
        Self {
            max_attempts,
            delay_ms,
            timeout_ms,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Attempt numbers, starting at 1.
    pub fn attempts(&self) -> std::ops::RangeInclusive<u32> {
        1..=self.max_attempts
    }

    /// No backoff is slept after the final attempt.
    pub fn is_last(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_durations() {
        let policy = RetryPolicy::new(5, 2000, 5000);

        assert_eq!(policy.delay(), Duration::from_secs(2));
        assert_eq!(policy.timeout(), Duration::from_secs(5));
        assert_eq!(policy.attempts().count(), 5);
        assert!(!policy.is_last(4));
        assert!(policy.is_last(5));
    }

    #[test]
    fn test_zero_attempts_is_empty() {
        assert_eq!(RetryPolicy::new(0, 0, 0).attempts().count(), 0);
    }
}
