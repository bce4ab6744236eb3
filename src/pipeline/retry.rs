//! Exponential backoff for retrying a failed stage.

use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Upper bound of the random delay added to each backoff.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }
}

impl RetryPolicy {
    /// No waiting between retries.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            jitter: Duration::ZERO,
        }
    }

    /// Whether retry number `retry` (1-based) is still within budget.
    pub fn allows(&self, retry: u32) -> bool {
        retry <= self.max_retries
    }

    /// Backoff before retry number `retry` (1-based), without jitter.
    ///
    /// `initial * multiplier^(retry - 1)`, capped at `max_backoff`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Backoff plus a random jitter in `[0, jitter]`.
    pub fn delay(&self, retry: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        self.backoff(retry) + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(1000),
            multiplier: 2.0,
            jitter: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = policy();
        let delays: Vec<u64> = (1..=5)
            .map(|n| policy.backoff(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_huge_retry_number_does_not_overflow() {
        assert_eq!(policy().backoff(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = policy();
        for _ in 0..100 {
            let delay = policy.delay(2);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(450));
        }
    }

    #[test]
    fn test_budget() {
        let policy = policy();
        assert!(policy.allows(5));
        assert!(!policy.allows(6));
        assert!(!RetryPolicy::immediate(0).allows(1));
    }

    #[test]
    fn test_from_config_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_backoff, Duration::from_millis(200));
        assert_eq!(policy.max_backoff, Duration::from_secs(10));
        assert_eq!(policy.jitter, Duration::from_millis(100));
    }
}
