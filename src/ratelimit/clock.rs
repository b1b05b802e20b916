//! Wall-clock source and interval alignment.

use std::fmt::Debug;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

use crate::error::{RategateError, Result};

/// Longest interval accepted by the admitters.
pub const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Wall-clock abstraction so interval boundaries can be faked in tests.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = shift(*now, by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Reject intervals that are empty or too long to align on the calendar.
pub fn check_interval(interval: Duration) -> Result<()> {
    if interval.is_zero() {
        return Err(RategateError::Config(
            "interval must be greater than zero".to_string(),
        ));
    }
    if interval > MAX_INTERVAL {
        return Err(RategateError::Config(format!(
            "interval {:?} exceeds the maximum of {:?}",
            interval, MAX_INTERVAL
        )));
    }
    Ok(())
}

/// `t + d`, saturating at the latest representable instant.
pub fn shift(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|d| t.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Round `t` down to a multiple of `interval` since the Unix epoch.
pub fn align_down(t: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let step = i64::try_from(interval.as_nanos()).unwrap_or(i64::MAX);
    let Some(nanos) = t.timestamp_nanos_opt() else {
        return t;
    };
    if step == 0 {
        return t;
    }
    t - TimeDelta::nanoseconds(nanos.rem_euclid(step))
}

/// The boundary reached by waiting one interval from `t` and aligning down.
///
/// This is always strictly after `t` and at most one interval away.
pub fn next_boundary(t: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    align_down(shift(t, interval), interval)
}

/// Time left from `t` until `boundary`, zero if it has passed.
pub fn until(t: DateTime<Utc>, boundary: DateTime<Utc>) -> Duration {
    (boundary - t).to_std().unwrap_or(Duration::ZERO)
}
