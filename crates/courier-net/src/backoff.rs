//! Exponential reconnect backoff.
//!
//! Delay for attempt `n` (zero based) is `initial_delay * 2^n`, capped at
//! `max_delay`. Once `max_attempts` attempts have been made the policy
//! yields no further delay and the transport stays disconnected until it
//! is told to reconnect.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt`, or `None` once the budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        // 2^31 already overflows any sane cap; clamp the shift
        let factor = 1u32 << attempt.min(31);
        let delay = self
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_then_caps() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            max_attempts: 8,
        };

        let delays: Vec<_> = (0..8).filter_map(|a| policy.delay_for(a)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1000),
                Duration::from_millis(1000),
                Duration::from_millis(1000),
                Duration::from_millis(1000),
            ]
        );
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_attempts_cease_after_max() {
        let policy = ReconnectPolicy::default();
        assert!(policy.delay_for(policy.max_attempts - 1).is_some());
        assert_eq!(policy.delay_for(policy.max_attempts), None);
        assert_eq!(policy.delay_for(u32::MAX), None);
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_secs(u64::MAX / 2),
            max_delay: Duration::from_secs(60),
            max_attempts: u32::MAX,
        };
        assert_eq!(policy.delay_for(40), Some(Duration::from_secs(60)));
    }
}
