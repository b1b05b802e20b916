//! Distributed admitter backed by a shared key-value store.
//!
//! Each base key maps to one counter record per time window. Instances
//! increment the record with read-then-conditional-write: the write only
//! lands if the record is unchanged since it was read, so concurrent
//! increments from any number of processes are totally ordered by the store
//! and the limit is never exceeded. A new window means a new record, which
//! resets the count without anyone deleting anything. With leases enabled the
//! record also expires on its own shortly after its window closes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::acquirer::Acquirer;
use super::backoff::ConflictBackoff;
use super::clock::check_interval;
use super::keyer::{IntervalKey, IntervalKeyer, Keyer};
use crate::error::{AcquireError, RategateError, Result};
use crate::store::{KvStore, LeaseId, Precondition, StoreError, WriteLease};

/// Default per-operation timeout for store calls.
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for a [`DistributedAdmitter`].
#[derive(Debug, Clone)]
pub struct DistributedConfig {
    /// Admissions allowed per key per interval
    pub limit: u64,
    /// Length of each counting window
    pub interval: Duration,
    /// Bind each window's record to a lease that expires with the window
    pub use_lease: bool,
    /// Timeout for the counter read
    pub read_timeout: Duration,
    /// Timeout for the conditional write and lease grant
    pub write_timeout: Duration,
    /// Sleep between attempts after losing a write race
    pub conflict_backoff: ConflictBackoff,
    /// Give up after this many lost races in one acquire (`None` retries
    /// until the write lands or the limit is reached)
    pub max_conflict_retries: Option<u32>,
}

impl DistributedConfig {
    pub fn new(limit: u64, interval: Duration) -> Self {
        Self {
            limit,
            interval,
            use_lease: false,
            read_timeout: DEFAULT_STORE_TIMEOUT,
            write_timeout: DEFAULT_STORE_TIMEOUT,
            conflict_backoff: ConflictBackoff::default(),
            max_conflict_retries: None,
        }
    }

    pub fn with_lease(mut self, use_lease: bool) -> Self {
        self.use_lease = use_lease;
        self
    }

    pub fn with_timeouts(mut self, read: Duration, write: Duration) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    pub fn with_conflict_backoff(mut self, backoff: ConflictBackoff) -> Self {
        self.conflict_backoff = backoff;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = Some(retries);
        self
    }
}

/// A counter read from the store.
struct Observed {
    /// Raw bytes, reused verbatim as the write precondition
    raw: Vec<u8>,
    count: u64,
}

/// An admitter whose limit is shared by every instance using the same store.
///
/// Holds no mutable state of its own; all coordination happens in the store.
pub struct DistributedAdmitter<S: KvStore> {
    /// The shared store
    store: Arc<S>,
    config: DistributedConfig,
    keyer: Arc<dyn Keyer>,
}

impl<S: KvStore> std::fmt::Debug for DistributedAdmitter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedAdmitter")
            .field("config", &self.config)
            .field("keyer", &self.keyer)
            .finish()
    }
}

impl<S: KvStore> DistributedAdmitter<S> {
    /// Create an admitter keyed by wall-clock windows of `config.interval`.
    pub fn new(store: Arc<S>, config: DistributedConfig) -> Result<Self> {
        check_interval(config.interval)?;
        let keyer = Arc::new(IntervalKeyer::new(config.interval));
        Ok(Self {
            store,
            config,
            keyer,
        })
    }

    /// Replace the interval keying strategy.
    pub fn with_keyer(mut self, keyer: Arc<dyn Keyer>) -> Self {
        self.keyer = keyer;
        self
    }

    pub fn config(&self) -> &DistributedConfig {
        &self.config
    }

    /// Get the store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Current admissions recorded for `key` in this window.
    pub async fn current_count(&self, key: &str) -> std::result::Result<u64, AcquireError> {
        let IntervalKey { key, .. } = self.keyer.key(key);
        Ok(self.read(&key).await?.map_or(0, |o| o.count))
    }

    async fn read(&self, key: &str) -> std::result::Result<Option<Observed>, AcquireError> {
        let raw = bounded("read", self.config.read_timeout, self.store.get(key)).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        let count = std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| AcquireError::InvalidCounter {
                key: key.to_string(),
                value: String::from_utf8_lossy(&raw).into_owned(),
            })?;

        Ok(Some(Observed { raw, count }))
    }

    /// Work out which lease the write should carry.
    ///
    /// Only the write that creates a window's record needs a fresh lease;
    /// later increments keep the one already attached. A lease granted for a
    /// write that lost its race is reused while the window is unchanged.
    async fn lease_for(
        &self,
        interval_key: &str,
        exists: bool,
        remaining: Duration,
        spare: &mut Option<(String, LeaseId)>,
    ) -> std::result::Result<WriteLease, AcquireError> {
        if !self.config.use_lease {
            return Ok(WriteLease::None);
        }
        if exists {
            return Ok(WriteLease::KeepExisting);
        }

        match spare.take() {
            Some((window, lease)) if window == interval_key => {
                trace!(lease = lease.0, "Reusing lease from lost write");
                return Ok(WriteLease::Attach(lease));
            }
            Some((_, stale)) => self.release(stale).await,
            None => {}
        }

        let ttl = remaining.max(self.store.min_lease_ttl());
        let lease = bounded(
            "lease grant",
            self.config.write_timeout,
            self.store.grant_lease(ttl),
        )
        .await?;
        trace!(lease = lease.0, ttl = ?ttl, "Granted lease");
        Ok(WriteLease::Attach(lease))
    }

    /// Revoke a lease no record ended up using.
    ///
    /// Failure only leaves the lease to expire on its own.
    async fn release(&self, lease: LeaseId) {
        let revoked = bounded(
            "lease revoke",
            self.config.write_timeout,
            self.store.revoke_lease(lease),
        )
        .await;
        match revoked {
            Ok(()) => trace!(lease = lease.0, "Revoked unused lease"),
            Err(e) => debug!(lease = lease.0, error = %e, "Could not revoke unused lease"),
        }
    }

    async fn claim(
        &self,
        key: &str,
        observed: Option<Observed>,
        next: u64,
        lease: WriteLease,
    ) -> std::result::Result<bool, AcquireError> {
        let precondition = match observed {
            Some(o) => Precondition::ValueEquals(o.raw),
            None => Precondition::Absent,
        };
        let value = next.to_string().into_bytes();

        let claimed = bounded(
            "conditional write",
            self.config.write_timeout,
            self.store.put_if(key, precondition, value, lease),
        )
        .await?;
        Ok(claimed)
    }
}

/// Run a store call under a timeout, turning expiry into a store error.
async fn bounded<T, F>(
    operation: &'static str,
    after: Duration,
    call: F,
) -> std::result::Result<T, AcquireError>
where
    F: Future<Output = std::result::Result<T, StoreError>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            warn!(operation = operation, error = %e, "Store call failed");
            Err(e.into())
        }
        Err(_) => {
            warn!(operation = operation, after = ?after, "Store call timed out");
            Err(StoreError::Timeout { operation, after }.into())
        }
    }
}

impl<S: KvStore> DistributedAdmitter<S> {
    /// The read and conditional write loop behind [`Acquirer::acquire`].
    ///
    /// Leaves in `spare` any lease granted for a write that never landed.
    async fn admit(
        &self,
        cancel: &CancellationToken,
        key: &str,
        spare: &mut Option<(String, LeaseId)>,
    ) -> std::result::Result<bool, AcquireError> {
        let mut conflicts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(AcquireError::Cancelled);
            }

            let IntervalKey {
                key: interval_key,
                remaining,
            } = self.keyer.key(key);

            let observed = self.read(&interval_key).await?;
            let count = observed.as_ref().map_or(0, |o| o.count);

            trace!(
                key = %interval_key,
                count = count,
                limit = self.config.limit,
                "Checking distributed limit"
            );

            if count >= self.config.limit {
                debug!(key = %interval_key, count = count, "Distributed limit reached");
                return Ok(false);
            }

            let lease = self
                .lease_for(&interval_key, observed.is_some(), remaining, spare)
                .await?;
            if self.claim(&interval_key, observed, count + 1, lease).await? {
                return Ok(true);
            }
            if let WriteLease::Attach(lease) = lease {
                *spare = Some((interval_key.clone(), lease));
            }

            conflicts += 1;
            debug!(
                key = %interval_key,
                conflicts = conflicts,
                "Lost conditional write, retrying"
            );

            if let Some(max) = self.config.max_conflict_retries {
                if conflicts > max {
                    return Err(AcquireError::Contention {
                        key: interval_key,
                        attempts: conflicts,
                    });
                }
            }

            let delay = self.config.conflict_backoff.delay(conflicts);
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[async_trait]
impl<S: KvStore + 'static> Acquirer for DistributedAdmitter<S> {
    async fn acquire(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> std::result::Result<bool, AcquireError> {
        let mut spare = None;
        let result = self.admit(cancel, key, &mut spare).await;
        if let Some((_, lease)) = spare {
            self.release(lease).await;
        }
        result
    }
}
