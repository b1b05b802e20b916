//! Interval key generation.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};

use super::clock::{align_down, shift, until, Clock, SystemClock};

/// Format for the whole seconds of the window start embedded in interval keys.
const WINDOW_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Window start with any fraction of a second trimmed of trailing zeros.
fn window_label(start: DateTime<Utc>) -> String {
    let mut label = start.format(WINDOW_FORMAT).to_string();
    let nanos = start.nanosecond() % 1_000_000_000;
    if nanos > 0 {
        let fraction = format!("{:09}", nanos);
        label.push('.');
        label.push_str(fraction.trim_end_matches('0'));
    }
    label
}

/// A base key bound to the time window it was derived in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalKey {
    /// The store key for the current window.
    pub key: String,
    /// Time left until the window closes.
    pub remaining: Duration,
}

/// Maps a base key to the key for the current window.
pub trait Keyer: Send + Sync + Debug {
    fn key(&self, base: &str) -> IntervalKey;
}

/// Keys of the form `{base}/{window start}`, rolling over every `interval`.
#[derive(Debug, Clone)]
pub struct IntervalKeyer {
    interval: Duration,
    clock: Arc<dyn Clock>,
}

impl IntervalKeyer {
    /// Create a keyer driven by the system clock.
    pub fn new(interval: Duration) -> Self {
        Self::with_clock(interval, Arc::new(SystemClock))
    }

    pub fn with_clock(interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { interval, clock }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Keyer for IntervalKeyer {
    fn key(&self, base: &str) -> IntervalKey {
        let now = self.clock.now();
        let start = align_down(now, self.interval);
        let end = shift(start, self.interval);

        IntervalKey {
            key: format!("{}/{}", base, window_label(start)),
            remaining: until(now, end),
        }
    }
}
