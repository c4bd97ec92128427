//! Retry policy: linear backoff and the dead-letter boundary.

use std::time::Duration;

/// What to do with an item whose handler just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reschedule no earlier than `delay` from now.
    Retry { delay: Duration },
    /// This failure used up the retry budget. Dead-letter the item.
    Exhausted,
}

/// Linear backoff: `delay = base * (attempt_count + 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, max_retries: u32) -> Self {
        Self { base, max_retries }
    }

    /// Delay before the next attempt, given the attempts already failed
    /// before this one.
    pub fn next_delay(&self, attempt_count: u32) -> Duration {
        self.base.saturating_mul(attempt_count.saturating_add(1))
    }

    /// Decide between retry and dead-letter for an item that has failed
    /// `attempt_count` times before the failure being handled now.
    pub fn decide(&self, attempt_count: u32) -> RetryDecision {
        if attempt_count.saturating_add(1) >= self.max_retries {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry {
                delay: self.next_delay(attempt_count),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_linearly_with_attempts() {
        let policy = RetryPolicy::new(Duration::from_secs(10), 5);
        assert_eq!(policy.next_delay(0), Duration::from_secs(10));
        assert_eq!(policy.next_delay(1), Duration::from_secs(20));
        assert_eq!(policy.next_delay(4), Duration::from_secs(50));
    }

    #[test]
    fn delays_are_strictly_increasing() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = (0..10).map(|n| policy.next_delay(n)).collect();
        assert!(delays.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn last_allowed_failure_is_exhausted() {
        let policy = RetryPolicy::new(Duration::from_secs(10), 3);
        assert_eq!(
            policy.decide(0),
            RetryDecision::Retry {
                delay: Duration::from_secs(10)
            }
        );
        assert_eq!(
            policy.decide(1),
            RetryDecision::Retry {
                delay: Duration::from_secs(20)
            }
        );
        assert_eq!(policy.decide(2), RetryDecision::Exhausted);
    }

    #[test]
    fn single_attempt_budget_never_retries() {
        let policy = RetryPolicy::new(Duration::from_secs(1), 1);
        assert_eq!(policy.decide(0), RetryDecision::Exhausted);
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let policy = RetryPolicy::new(Duration::MAX, u32::MAX);
        assert_eq!(policy.next_delay(u32::MAX), Duration::MAX);
    }
}
