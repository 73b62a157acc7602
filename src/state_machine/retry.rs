use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fixed-bound, fixed-delay retry policy for the TESTING ⇄ FIXING loop.
///
/// `attempt` counts fix attempts already consumed. With `max_retries = n`
/// the (n+1)-th failing test run is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Whether a failing test run after `attempt` fixes earns another fix.
    pub fn should_retry(attempt: u32, max_retries: u32) -> bool {
        attempt < max_retries
    }

    /// Pause before the test run that follows fix number `attempt`.
    ///
    /// Constant: the policy has no backoff.
    pub fn delay_before(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_until_budget_is_spent() {
        assert!(RetryPolicy::should_retry(0, 2));
        assert!(RetryPolicy::should_retry(1, 2));
        assert!(!RetryPolicy::should_retry(2, 2));
    }

    #[test]
    fn zero_budget_never_retries() {
        assert!(!RetryPolicy::should_retry(0, 0));
    }

    #[test]
    fn delay_is_fixed() {
        let policy = RetryPolicy::new(5, Duration::from_secs(10));
        assert_eq!(policy.delay_before(1), Duration::from_secs(10));
        assert_eq!(policy.delay_before(4), Duration::from_secs(10));
    }

    #[test]
    fn default_policy_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.delay, Duration::from_secs(10));
    }
}
