//! Retry policy for the worker pool

use couch_core::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Bounded retries with a uniformly random delay
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay_min: Duration,
    pub delay_max: Duration,
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
            delay_min: config.delay_min,
            delay_max: config.delay_max,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay_min: Duration, delay_max: Duration) -> Self {
        Self {
            max_retries,
            delay_min,
            delay_max,
        }
    }

    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Random delay in `[delay_min, delay_max]`, millisecond resolution
    pub fn delay(&self) -> Duration {
        let min = self.delay_min.as_millis() as u64;
        let max = self.delay_max.as_millis() as u64;
        if max <= min {
            return self.delay_min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry_is_bounded() {
        let policy = RetryPolicy::new(2, Duration::ZERO, Duration::ZERO);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }

    #[test]
    fn test_delay_within_window() {
        let policy = RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(30));
        for _ in 0..200 {
            let delay = policy.delay();
            assert!(delay >= Duration::from_millis(5));
            assert!(delay <= Duration::from_millis(30));
        }
    }

    #[test]
    fn test_degenerate_window() {
        let policy = RetryPolicy::new(1, Duration::from_millis(7), Duration::from_millis(7));
        assert_eq!(policy.delay(), Duration::from_millis(7));
    }
}
