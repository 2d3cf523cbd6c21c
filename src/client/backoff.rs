//! Exponential backoff for automatic reconnect.
//!
//! The delay before attempt `n` (1-based) is
//!
//! ```text
//! delay[n] = min(2^(n-1) * initial, max_delay)
//! ```
//!
//! and at most `max_attempts` attempts are made before the policy gives up.
//! With the defaults (initial 1s, max 30s, 5 attempts) the schedule is
//! 1s, 2s, 4s, 8s, 16s.

use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const INITIAL_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackoffError {
    /// Every permitted attempt has been used.
    #[error("maximum number of reconnect attempts exceeded: {0}")]
    MaxAttemptLimitError(u32),
}

#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    /// Attempts handed out since the last reset.
    attempt: u32,
}

impl Backoff {
    pub fn new(max_attempts: u32, max_delay: Duration) -> Self {
        Self {
            initial_delay: INITIAL_DELAY,
            max_delay,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn set_max_attempts(&mut self, max: u32) {
        self.max_attempts = max;
    }

    pub fn set_max_delay(&mut self, max: Duration) {
        self.max_delay = max;
    }

    /// Start over after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay for attempt `n` (1-based), independent of the internal counter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Advances to the next attempt and returns its number and delay.
    pub fn next_sleep(&mut self) -> Result<(u32, Duration), BackoffError> {
        if self.attempt >= self.max_attempts {
            return Err(BackoffError::MaxAttemptLimitError(self.max_attempts));
        }
        self.attempt += 1;
        Ok((self.attempt, self.delay_for(self.attempt)))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY)
    }
}
