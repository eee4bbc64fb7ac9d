//! Retry policy for transient adapter failures.
//!
//! Exponential backoff, base 2 s, at most 3 attempts. No-retry actions
//! bypass this entirely: they are attempted exactly once per plan at every
//! layer, whatever the failure.

use std::time::Duration;

use rand::Rng;

use crate::plan::ActionType;

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// First-retry delay.
    pub base_delay: Duration,
    /// Total attempts including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Build from configured seconds/attempts.
    pub fn new(base_secs: u64, max_attempts: u32) -> Self {
        Self {
            base_delay: Duration::from_secs(base_secs),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Attempts allowed for this action: one for no-retry actions, the
    /// configured bound otherwise.
    pub fn attempts_for(&self, action: ActionType) -> u32 {
        if action.is_no_retry() {
            1
        } else {
            self.max_attempts
        }
    }

    /// Delay before the retry following failed attempt `attempt`
    /// (1-based): `base * 2^(attempt-1)` plus up to 250 ms of jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        let backoff = self.base_delay.saturating_mul(multiplier);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        backoff.saturating_add(jitter)
    }
}
