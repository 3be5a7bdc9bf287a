//! Backoff for the dispatch loop.
//!
//! The orchestrator counts consecutive failures: aborted publishes and failed
//! (re)connects. A committed event resets the count. After failure `n` the
//! loop waits [`RetryPolicy::delay_after`]`(n)` and tries again, unless `n`
//! exceeds [`RetryPolicy::max_failures`].

use std::str::FromStr;
use std::time::Duration;

/// Ceiling for any single wait, whatever the configuration says.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// `base_delay` after every failure.
    Fixed,
    /// `base_delay`, doubled for each further consecutive failure.
    #[default]
    Exponential,
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            _ => Err("expected fixed or exponential".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated; the next one halts the relay.
    pub max_failures: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5, Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl RetryPolicy {
    /// Halt on the first failure.
    pub fn no_retry() -> Self {
        Self {
            max_failures: 0,
            ..Self::default()
        }
    }

    pub fn fixed(max_failures: u32, delay: Duration) -> Self {
        Self {
            max_failures,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_failures: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_failures,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Wait after the `failures`-th consecutive failure.
    ///
    /// Never longer than `max_delay` nor [`MAX_BACKOFF`].
    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let doublings = (failures - 1).min(31);
                self.base_delay.saturating_mul(1 << doublings)
            }
        };
        delay.min(self.max_delay).min(MAX_BACKOFF)
    }

    pub fn tolerates(&self, failures: u32) -> bool {
        failures <= self.max_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delay_doubles_per_failure_up_to_max_delay() {
        let policy =
            RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_millis(500));

        assert_eq!(policy.delay_after(0), Duration::ZERO);
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(4), Duration::from_millis(500));
        assert_eq!(policy.delay_after(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn fixed_delay_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(50));

        assert_eq!(policy.delay_after(1), Duration::from_millis(50));
        assert_eq!(policy.delay_after(3), Duration::from_millis(50));
    }

    #[test]
    fn huge_configured_delays_are_capped() {
        let policy = RetryPolicy::exponential(3, Duration::MAX, Duration::MAX);

        assert_eq!(policy.delay_after(1), MAX_BACKOFF);
        assert_eq!(policy.delay_after(40), MAX_BACKOFF);
        assert_eq!(RetryPolicy::fixed(1, Duration::MAX).delay_after(1), MAX_BACKOFF);
    }

    #[test]
    fn tolerates_up_to_max_failures() {
        let policy = RetryPolicy::fixed(2, Duration::ZERO);

        assert!(policy.tolerates(1));
        assert!(policy.tolerates(2));
        assert!(!policy.tolerates(3));
        assert!(!RetryPolicy::no_retry().tolerates(1));
    }

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!("Fixed".parse(), Ok(BackoffStrategy::Fixed));
        assert_eq!(" exponential ".parse(), Ok(BackoffStrategy::Exponential));
        assert!("linear".parse::<BackoffStrategy>().is_err());
    }
}
