//! Retry policy for the stream consumer.

use std::time::Duration;

use crate::config::StreamSettings;

/// Bounded retries with optional exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub exponential_backoff: bool,
}

impl RetryPolicy {
    pub fn from_settings(settings: &StreamSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_delay: settings.initial_retry_delay(),
            exponential_backoff: settings.exponential_backoff,
        }
    }

    /// Delay before retry `attempt` (0-indexed): `initial × 2ⁿ` under
    /// exponential backoff, constant otherwise.
    pub fn delay(&self, attempt: u32) -> Duration {
        if self.exponential_backoff {
            let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
            self.initial_delay.saturating_mul(factor)
        } else {
            self.initial_delay
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&StreamSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delays_double() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            exponential_backoff: true,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
    }

    #[test]
    fn fixed_delays_stay_constant() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            exponential_backoff: false,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(5), Duration::from_millis(100));
    }
}
