//! Retry delay policy
//!
//! Capped exponential backoff with random jitter. Many clients regain
//! connectivity at the same moment after a regional outage; the jitter
//! spreads their resync attempts instead of letting them stampede the
//! endpoint together.

use rand::Rng;
use std::time::Duration;

/// Backoff policy for failed drain cycles
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay for the first retry
    pub base: Duration,
    /// Ceiling for the pre-jitter delay
    pub max_delay: Duration,
    /// Jitter as a fraction of the computed delay (0.3 = up to +30%)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            jitter: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Pre-jitter delay for the given consecutive-failure attempt (0-based):
    /// `base * 2^attempt`, capped at `max_delay`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay with 0..=jitter fraction of itself added
    pub fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let fraction = rand::thread_rng().gen_range(0.0..=self.jitter);
        delay + delay.mul_f64(fraction)
    }
}
