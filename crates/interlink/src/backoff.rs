//! Exponential reconnect backoff.
//!
//! The `k`-th retry after consecutive failures waits
//! `min(max_delay, initial_delay * 2^(k-1))`.

use std::time::Duration;

/// Reconnect timing shared by the relay channel and the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 10)
    }
}

impl ReconnectPolicy {
    /// Creates a policy. Values are clamped: delays to at least 1 ms,
    /// `max_delay` to at least `initial_delay`, attempts to at least 1.
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        let initial_delay = initial_delay.max(Duration::from_millis(1));
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Consecutive failed attempts after which the owner gives up.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based; 0 is treated as 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            failures: 0,
        }
    }
}

/// Failure counter driving a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    failures: u32,
}

impl Backoff {
    /// Records a failure and returns the delay before the next attempt, or
    /// `None` once `max_attempts` consecutive failures have happened.
    pub fn next_retry(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.policy.max_attempts {
            None
        } else {
            Some(self.policy.delay_for(self.failures))
        }
    }

    /// Records a failure and returns the delay, ignoring the attempt cap.
    pub fn next_retry_unbounded(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.policy.delay_for(self.failures)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_until_capped() {
        let policy = ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 10);
        let delays: Vec<u64> = (1..=7).map(|k| policy.delay_for(k).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_huge_attempts_do_not_overflow() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
        assert_eq!(policy.delay_for(40), Duration::from_secs(30));
    }

    #[test]
    fn test_values_are_clamped() {
        let policy = ReconnectPolicy::new(Duration::ZERO, Duration::ZERO, 0);
        assert_eq!(policy.initial_delay(), Duration::from_millis(1));
        assert_eq!(policy.max_delay(), Duration::from_millis(1));
        assert_eq!(policy.max_attempts(), 1);

        let policy = ReconnectPolicy::new(Duration::from_secs(5), Duration::from_secs(2), 3);
        assert_eq!(policy.max_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_gives_up_after_max_attempts() {
        let policy = ReconnectPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 4);
        let mut backoff = policy.backoff();
        assert_eq!(backoff.next_retry(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_retry(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_retry(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next_retry(), None);
        assert_eq!(backoff.failures(), 4);

        backoff.reset();
        assert_eq!(backoff.next_retry(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_unbounded_keeps_going_at_cap() {
        let policy = ReconnectPolicy::new(Duration::from_millis(100), Duration::from_millis(250), 2);
        let mut backoff = policy.backoff();
        let delays: Vec<_> = (0..5).map(|_| backoff.next_retry_unbounded().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 250, 250, 250]);
    }
}
