//! In-process admitter keeping one token bucket per key.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::acquirer::Acquirer;
use super::bucket::TokenBucket;
use super::clock::{check_interval, next_boundary, until, Clock, SystemClock};
use crate::error::{AcquireError, RategateError, Result};

type Buckets = DashMap<String, TokenBucket>;

/// The in-process admitter that manages token buckets.
///
/// Buckets are created lazily, one per key, and all of them are refilled
/// together at every wall-clock aligned interval boundary by a background
/// task. The task stops once the admitter is dropped.
///
/// Buckets are never evicted, so memory grows with the number of distinct
/// keys seen.
#[derive(Debug)]
pub struct KeyedLocalAdmitter {
    /// Token buckets indexed by key
    buckets: Arc<Buckets>,
    /// Tokens each bucket holds after a refill
    capacity: u64,
    /// Time between refills
    refill_interval: Duration,
}

impl KeyedLocalAdmitter {
    /// Create an admitter granting `capacity` acquisitions per key per
    /// `refill_interval`.
    ///
    /// Must be called from within a tokio runtime, which drives the refills.
    pub fn new(capacity: u64, refill_interval: Duration) -> Result<Self> {
        Self::with_clock(capacity, refill_interval, Arc::new(SystemClock))
    }

    /// Like [`KeyedLocalAdmitter::new`] with an explicit wall clock for
    /// boundary alignment.
    pub fn with_clock(
        capacity: u64,
        refill_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        check_interval(refill_interval)?;

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            RategateError::Config("local admitter requires a tokio runtime".to_string())
        })?;

        let buckets = Arc::new(Buckets::new());
        runtime.spawn(refill_loop(Arc::downgrade(&buckets), refill_interval, clock));

        info!(
            capacity = capacity,
            refill_interval = ?refill_interval,
            "Local admitter initialized"
        );

        Ok(Self {
            buckets,
            capacity,
            refill_interval,
        })
    }

    /// Take a token for `key`, creating its bucket on first use.
    pub fn try_acquire(&self, key: &str) -> bool {
        if let Some(bucket) = self.buckets.get(key) {
            return bucket.acquire();
        }

        let bucket = self.buckets.entry(key.to_string()).or_insert_with(|| {
            debug!(key = %key, capacity = self.capacity, "Creating new token bucket");
            TokenBucket::new(self.capacity)
        });
        bucket.acquire()
    }

    /// Refill every known bucket now.
    pub fn refill_all(&self) {
        refill_all(&self.buckets);
    }

    /// Tokens left for `key`, `None` if the key has not been seen.
    pub fn available(&self, key: &str) -> Option<u64> {
        self.buckets.get(key).map(|b| b.available())
    }

    /// Get the number of known keys.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }
}

fn refill_all(buckets: &Buckets) {
    for bucket in buckets.iter() {
        bucket.refill();
    }
    trace!(buckets = buckets.len(), "Refilled token buckets");
}

async fn refill_loop(buckets: Weak<Buckets>, interval: Duration, clock: Arc<dyn Clock>) {
    loop {
        let now = clock.now();
        tokio::time::sleep(until(now, next_boundary(now, interval))).await;

        let Some(buckets) = buckets.upgrade() else {
            debug!("Local admitter dropped, stopping refills");
            return;
        };
        refill_all(&buckets);
    }
}

#[async_trait]
impl Acquirer for KeyedLocalAdmitter {
    async fn acquire(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> std::result::Result<bool, AcquireError> {
        if cancel.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }
        Ok(self.try_acquire(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_admitter_creation() {
        let admitter = KeyedLocalAdmitter::new(3, Duration::from_secs(60)).unwrap();
        assert_eq!(admitter.bucket_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let result = KeyedLocalAdmitter::new(3, Duration::ZERO);
        assert!(matches!(result, Err(RategateError::Config(_))));
    }

    #[tokio::test]
    async fn test_oversized_interval_rejected() {
        let result = KeyedLocalAdmitter::new(3, Duration::from_secs(10_000_000_000_000));
        assert!(matches!(result, Err(RategateError::Config(_))));
    }

    #[test]
    fn test_requires_runtime() {
        let result = KeyedLocalAdmitter::new(3, Duration::from_secs(1));
        assert!(matches!(result, Err(RategateError::Config(_))));
    }

    #[tokio::test]
    async fn test_acquire_creates_bucket() {
        let admitter = KeyedLocalAdmitter::new(3, Duration::from_secs(60)).unwrap();
        let cancel = CancellationToken::new();

        assert!(admitter.acquire(&cancel, "/foo").await.unwrap());
        assert_eq!(admitter.bucket_count(), 1);
        assert_eq!(admitter.available("/foo"), Some(2));
    }

    #[tokio::test]
    async fn test_limit_per_key() {
        let admitter = KeyedLocalAdmitter::new(2, Duration::from_secs(60)).unwrap();
        let cancel = CancellationToken::new();

        assert!(admitter.acquire(&cancel, "/foo").await.unwrap());
        assert!(admitter.acquire(&cancel, "/foo").await.unwrap());
        assert!(!admitter.acquire(&cancel, "/foo").await.unwrap());

        // A different key has its own bucket
        assert!(admitter.acquire(&cancel, "/bar").await.unwrap());
    }

    #[tokio::test]
    async fn test_refill_all() {
        let admitter = KeyedLocalAdmitter::new(1, Duration::from_secs(60)).unwrap();

        assert!(admitter.try_acquire("/a"));
        assert!(admitter.try_acquire("/b"));
        assert!(!admitter.try_acquire("/a"));

        admitter.refill_all();

        assert!(admitter.try_acquire("/a"));
        assert!(admitter.try_acquire("/b"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_access_installs_one_bucket() {
        let admitter = Arc::new(KeyedLocalAdmitter::new(5, Duration::from_secs(60)).unwrap());

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let admitter = admitter.clone();
                tokio::spawn(async move { admitter.try_acquire("/shared") })
            })
            .collect();

        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap() {
                granted += 1;
            }
        }

        assert_eq!(admitter.bucket_count(), 1);
        assert_eq!(granted, 5);
    }

    #[tokio::test]
    async fn test_background_refill() {
        let admitter = KeyedLocalAdmitter::new(1, Duration::from_millis(50)).unwrap();

        assert!(admitter.try_acquire("/foo"));
        assert!(!admitter.try_acquire("/foo"));

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(admitter.try_acquire("/foo"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_aligned_to_wall_clock_boundary() {
        // Five seconds before a minute boundary
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 55).unwrap(),
        ));
        let admitter =
            KeyedLocalAdmitter::with_clock(1, Duration::from_secs(60), clock.clone()).unwrap();
        // Let the refill task schedule its first sleep.
        tokio::task::yield_now().await;

        // Bucket created late in the window
        assert!(admitter.try_acquire("/foo"));
        assert!(!admitter.try_acquire("/foo"));

        clock.advance(Duration::from_secs(4));
        tokio::time::advance(Duration::from_secs(4)).await;
        tokio::task::yield_now().await;
        assert!(!admitter.try_acquire("/foo"));

        // The boundary refills it, well before a full interval has passed.
        clock.advance(Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert!(admitter.try_acquire("/foo"));
        assert!(!admitter.try_acquire("/foo"));

        // After that, refills follow each boundary a whole interval apart.
        clock.advance(Duration::from_secs(59));
        tokio::time::advance(Duration::from_secs(59)).await;
        tokio::task::yield_now().await;
        assert!(!admitter.try_acquire("/foo"));

        clock.advance(Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert!(admitter.try_acquire("/foo"));
    }

    #[tokio::test]
    async fn test_cancelled_acquire() {
        let admitter = KeyedLocalAdmitter::new(1, Duration::from_secs(60)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = admitter.acquire(&cancel, "/foo").await;
        assert!(matches!(result, Err(AcquireError::Cancelled)));
        assert_eq!(admitter.bucket_count(), 0);
    }
}
