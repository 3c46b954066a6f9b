//! Retry backoff for message-class failures.
//!
//! Exponential backoff with an optional jitter, used by the queue when a
//! server refused a message without asking for a specific delay.

use std::time::Duration;

use crate::config::RetryConfig;

/// Backoff calculator over a [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
}

impl Backoff {
    /// Creates a new backoff calculator.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Returns the maximum number of delivery attempts.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Sets the maximum number of delivery attempts.
    pub fn set_max_attempts(&mut self, attempts: u32) {
        self.config.max_attempts = attempts.max(1);
    }

    /// Returns true if a message that failed on `attempt` may be tried again.
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.config.max_attempts
    }

    /// Calculates the delay before retrying after `attempt` failed.
    ///
    /// A server-supplied hint always wins over the computed delay.
    pub fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint;
        }

        let max_delay = self.config.max_delay;
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.config.multiplier.powi(exponent);
        // Out of range (or infinite) means far past the cap.
        let delay = Duration::try_from_secs_f64(self.config.initial_delay.as_secs_f64() * factor)
            .map_or(max_delay, |delay| delay.min(max_delay));

        if self.config.jitter {
            delay.mul_f64(1.0 + rand::random::<f64>() * 0.3)
        } else {
            delay
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn backoff(jitter: bool) -> Backoff {
        Backoff::new(RetryConfig {
            max_attempts: 4,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            jitter,
        })
    }

    #[rstest]
    #[case(1, 100)]
    #[case(2, 200)]
    #[case(3, 400)]
    #[case(5, 1000)]
    #[case(40, 1000)]
    #[case(u32::MAX, 1000)]
    fn test_exponential_delay(#[case] attempt: u32, #[case] expected_ms: u64) {
        assert_eq!(backoff(false).delay(attempt, None), Duration::from_millis(expected_ms));
    }

    #[test]
    fn test_hint_overrides_backoff() {
        let hint = Duration::from_millis(3000);
        assert_eq!(backoff(false).delay(1, Some(hint)), hint);
    }

    #[test]
    fn test_jitter_bounds() {
        let backoff = backoff(true);
        for _ in 0..50 {
            let delay = backoff.delay(2, None);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(260));
        }
    }

    #[test]
    fn test_can_retry() {
        let mut backoff = backoff(false);
        assert!(backoff.can_retry(3));
        assert!(!backoff.can_retry(4));
        backoff.set_max_attempts(0);
        assert_eq!(backoff.max_attempts(), 1);
    }
}
