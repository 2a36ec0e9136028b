//! Capped exponential backoff.

use bulwark_core::{Classification, RetryConfig};
use std::time::Duration;

/// Retry schedule derived from [`RetryConfig`]
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay after failed attempt `attempt` (1-based)
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled =
            self.config.initial_backoff.as_nanos() as f64 * self.config.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.config.max_backoff.as_nanos() as f64 {
            self.config.max_backoff
        } else {
            Duration::from_nanos(scaled.max(0.0).round() as u64)
        }
    }

    /// Whether another attempt should follow failed attempt `attempt`
    #[must_use]
    pub fn should_retry(&self, attempt: u32, classification: &Classification) -> bool {
        classification.is_retryable && attempt <= self.config.max_retries
    }

    /// Retries allowed after the first attempt
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::ErrorCategory;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
        });
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(60), Duration::from_millis(500));
    }

    #[test]
    fn test_should_retry_respects_budget_and_classification() {
        let policy = RetryPolicy::default();
        let transient = Classification::transient(ErrorCategory::Server);
        let fatal = Classification::fatal(ErrorCategory::Client);
        assert!(policy.should_retry(1, &transient));
        assert!(policy.should_retry(3, &transient));
        assert!(!policy.should_retry(4, &transient));
        assert!(!policy.should_retry(1, &fatal));
        let disabled = RetryPolicy::new(RetryConfig {
            max_retries: 0,
            ..RetryConfig::default()
        });
        assert!(!disabled.should_retry(1, &transient));
    }
}
