//! Coordination store boundary for the distributed admitter.
//!
//! The admitter only needs a point read, a conditional put, and leases that
//! expire or can be revoked early. Anything offering those with linearizable
//! semantics per key can back a shared limit.

mod memory;
#[cfg(feature = "etcd")]
mod etcd;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;

/// Default minimum lease TTL, matching etcd's practical floor.
pub const DEFAULT_MIN_LEASE_TTL: Duration = Duration::from_secs(5);

/// Errors talking to the coordination store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("transport error: {0}")]
    Transport(String),
}

/// Identifier of a lease issued by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeaseId(pub i64);

/// Guard evaluated atomically with a conditional put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// The key must not exist.
    Absent,
    /// The key must exist and hold exactly these bytes.
    ValueEquals(Vec<u8>),
}

/// How a conditional put treats leases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteLease {
    /// Write without a lease.
    None,
    /// Bind the key to the given lease.
    Attach(LeaseId),
    /// Keep whatever lease the key is already bound to.
    KeepExisting,
}

/// A key-value store offering conditional writes and leases.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read the value stored at `key`, `None` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Put `value` at `key` if `precondition` holds.
    ///
    /// Returns `Ok(false)` when the precondition failed and nothing was written.
    async fn put_if(
        &self,
        key: &str,
        precondition: Precondition,
        value: Vec<u8>,
        lease: WriteLease,
    ) -> Result<bool, StoreError>;

    /// Grant a lease that expires after `ttl`.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, StoreError>;

    /// Revoke a lease, deleting every key bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// Shortest lease TTL the store honours.
    fn min_lease_ttl(&self) -> Duration;
}
