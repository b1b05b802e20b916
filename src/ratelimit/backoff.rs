//! Pacing for retries after a lost conditional write.

use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff with full jitter.
///
/// The n-th consecutive conflict sleeps a uniformly random duration in
/// `[0, min(max, base * 2^(n-1))]`. A zero `base` disables sleeping entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl ConflictBackoff {
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Retry immediately after every conflict.
    pub const fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Upper bound of the sleep after `attempt` conflicts (1-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.base.is_zero() {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// A jittered sleep for `attempt` conflicts.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if ceiling.is_zero() {
            return ceiling;
        }
        let nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rand::thread_rng().gen_range(0..=nanos))
    }
}

impl Default for ConflictBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(2), Duration::from_millis(100))
    }
}
