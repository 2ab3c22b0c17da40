//! Reconnect backoff policy.

use std::time::Duration;

use rand::Rng;

use murmur_shared::constants::{
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_BASE_DELAY_MS, DEFAULT_RECONNECT_JITTER_MS,
};

/// Upper bound on any single reconnect delay, jitter included.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_attempts: u32,
    max_jitter: Duration,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32, max_jitter: Duration) -> Self {
        Self {
            base_delay,
            max_attempts,
            max_jitter,
        }
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn max_jitter(&self) -> Duration {
        self.max_jitter
    }

    /// `base * 2^(attempt-1)` for the 1-based attempt number, capped at
    /// [`MAX_RECONNECT_DELAY`].
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let multiplier = 1_u32 << shift;
        self.base_delay
            .saturating_mul(multiplier)
            .min(MAX_RECONNECT_DELAY)
    }

    /// Backoff delay plus a random jitter in `0..=max_jitter`, capped at
    /// [`MAX_RECONNECT_DELAY`].
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.min(MAX_RECONNECT_DELAY).as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        (self.delay_for_attempt(attempt) + jitter).min(MAX_RECONNECT_DELAY)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(DEFAULT_RECONNECT_BASE_DELAY_MS),
            DEFAULT_MAX_RECONNECT_ATTEMPTS,
            Duration::from_millis(DEFAULT_RECONNECT_JITTER_MS),
        )
    }
}
