//! Exponential backoff with a capped ceiling and jitter.
//!
//! Shared by the heartbeat reconnect loop and the commit retry loop.

use rand::Rng;
use std::time::Duration;

use crate::error::{Error, Result};

/// Backoff policy.
///
/// The un-jittered delay for attempt `n` (1-based) is
/// `base_delay * 2^(n-1)`, capped at `max_delay`. Jitter then adds a random
/// amount in `[0, jitter * delay]`, and the result is capped again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the computed delay added as random jitter, in `[0, 1]`.
    pub jitter: f64,
}

impl BackoffPolicy {
    pub const fn new(base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter,
        }
    }

    /// Same policy without jitter; useful for deterministic tests.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if self.base_delay.is_zero() {
            return Err(Error::Config(format!(
                "{} base delay must be greater than 0",
                name
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::Config(format!(
                "{} base delay ({:?}) exceeds max delay ({:?})",
                name, self.base_delay, self.max_delay
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::Config(format!(
                "{} jitter must be within [0, 1], got {}",
                name, self.jitter
            )));
        }
        Ok(())
    }

    /// Delay before attempt `attempt` (1-based) without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before attempt `attempt` (1-based) including jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }

        let bound_ms = (delay.as_millis() as f64 * self.jitter) as u64;
        let jitter_ms = if bound_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=bound_ms)
        };
        (delay + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 0.2)
    }
}
