//! Pacing between admission attempts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::clock::{next_boundary, until, Clock, SystemClock};

/// Suspends the caller until a later point in time or until cancelled.
///
/// Returning does not say which of the two happened; callers check the
/// token themselves.
#[async_trait]
pub trait Waiter: Send + Sync {
    async fn wait(&self, cancel: &CancellationToken);
}

#[async_trait]
impl<W: Waiter + ?Sized> Waiter for Arc<W> {
    async fn wait(&self, cancel: &CancellationToken) {
        (**self).wait(cancel).await
    }
}

/// Waits until the next wall-clock aligned interval boundary.
#[derive(Debug, Clone)]
pub struct NextIntervalWaiter {
    interval: Duration,
    clock: Arc<dyn Clock>,
}

impl NextIntervalWaiter {
    pub fn new(interval: Duration) -> Self {
        Self::with_clock(interval, Arc::new(SystemClock))
    }

    pub fn with_clock(interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { interval, clock }
    }

    /// How long a wait starting now would last.
    pub fn delay(&self) -> Duration {
        let now = self.clock.now();
        until(now, next_boundary(now, self.interval))
    }
}

#[async_trait]
impl Waiter for NextIntervalWaiter {
    async fn wait(&self, cancel: &CancellationToken) {
        let delay = self.delay();
        trace!(delay = ?delay, "Waiting for next interval");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {}
        }
    }
}
