//! Receive-timeout and retry-budget management.
//!
//! RXP has no background timers: every loop blocks on a single receive bounded
//! by [`TimerConfig::read_timeout`], and a timeout expiry *is* the retransmit
//! trigger.  This module provides:
//! - [`TimerConfig`]: the per-connection timeout parameters.
//! - [`RetryBudget`]: counts consecutive timeouts for one protocol step and
//!   says when the step has to give up.

use std::time::Duration;

/// Default socket read timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of timeouts a step tolerates before failing.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Adjustable timeout parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// How long a single receive may block before it counts as a timeout.
    pub read_timeout: Duration,
    /// Consecutive timeouts a step tolerates; the next one fails it.
    pub max_retries: u32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl TimerConfig {
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// A fresh budget for one protocol step.
    pub fn budget(&self) -> RetryBudget {
        RetryBudget::new(self.max_retries)
    }
}

/// Consecutive-timeout counter for one protocol step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    limit: u32,
    used: u32,
}

impl RetryBudget {
    pub fn new(limit: u32) -> Self {
        Self { limit, used: 0 }
    }

    /// Record a timeout.  Returns `true` while the step may resend and
    /// `false` once the budget is exhausted.
    pub fn on_timeout(&mut self) -> bool {
        if self.used >= self.limit {
            return false;
        }
        self.used += 1;
        true
    }

    /// Progress was made; forget earlier timeouts.
    pub fn reset(&mut self) {
        self.used = 0;
    }

    /// Timeouts recorded since the last reset.
    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_five_seconds_and_five_retries() {
        let cfg = TimerConfig::default();
        assert_eq!(cfg.read_timeout, Duration::from_secs(5));
        assert_eq!(cfg.max_retries, 5);
    }

    #[test]
    fn budget_allows_exactly_limit_resends() {
        let mut b = RetryBudget::new(5);
        for _ in 0..5 {
            assert!(b.on_timeout());
        }
        assert!(!b.on_timeout());
        assert_eq!(b.used(), 5);
    }

    #[test]
    fn reset_restores_full_budget() {
        let mut b = TimerConfig::default().with_max_retries(2).budget();
        assert!(b.on_timeout());
        assert!(b.on_timeout());
        b.reset();
        assert_eq!(b.used(), 0);
        assert!(b.on_timeout());
    }

    #[test]
    fn zero_budget_fails_first_timeout() {
        assert!(!RetryBudget::new(0).on_timeout());
    }
}
