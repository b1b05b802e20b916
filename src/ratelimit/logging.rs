//! Logging decorator for acquirers.

use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::acquirer::Acquirer;
use crate::error::AcquireError;

/// Wraps another [`Acquirer`] and logs every call and its outcome.
#[derive(Debug, Clone)]
pub struct LoggingAcquirer<A> {
    inner: A,
}

impl<A> LoggingAcquirer<A> {
    pub fn new(inner: A) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> A {
        self.inner
    }
}

#[async_trait]
impl<A: Acquirer> Acquirer for LoggingAcquirer<A> {
    async fn acquire(&self, cancel: &CancellationToken, key: &str) -> Result<bool, AcquireError> {
        let start = Instant::now();
        debug!(key = %key, "Acquire started");

        let result = self.inner.acquire(cancel, key).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(acquired) => debug!(
                key = %key,
                acquired = *acquired,
                elapsed = ?elapsed,
                "Acquire returned"
            ),
            Err(e) if e.is_cancelled() => {
                debug!(key = %key, elapsed = ?elapsed, "Acquire cancelled")
            }
            Err(e) => warn!(key = %key, error = %e, elapsed = ?elapsed, "Acquire failed"),
        }

        result
    }
}
