//! Retry budgets and backoff

use std::time::Duration;

/// Backoff configuration for exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry (1.0 for a fixed delay)
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Same delay before every retry
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    /// Calculate the delay for a given retry attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_secs)
    }
}

/// How many times an operation is attempted and how long to wait in between
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    pub backoff: BackoffConfig,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: BackoffConfig) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// `attempts` tries with a fixed pause
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self::new(attempts, BackoffConfig::fixed(delay))
    }

    /// Image pulls: a handful of attempts with exponential backoff
    pub fn image_pull() -> Self {
        Self::new(
            3,
            BackoffConfig {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
                multiplier: 2.0,
            },
        )
    }

    /// Bootstrap exec: fixed one second pause
    pub fn bootstrap() -> Self {
        Self::fixed(10, Duration::from_secs(1))
    }

    /// Delay before retry number `retry` (0 is the first retry)
    pub fn delay(&self, retry: u32) -> Duration {
        self.backoff.delay_for_attempt(retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_millis(500));
    }

    #[test]
    fn test_fixed_policy() {
        let policy = RetryPolicy::fixed(4, Duration::from_millis(250));
        assert_eq!(policy.attempts, 4);
        assert_eq!(policy.delay(0), policy.delay(3));
        assert_eq!(RetryPolicy::fixed(0, Duration::ZERO).attempts, 1);
    }
}
