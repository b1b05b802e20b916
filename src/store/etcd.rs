//! etcd-backed store.
//!
//! Conditional puts map onto etcd transactions: `Absent` compares the key's
//! version against zero, `ValueEquals` compares its value.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, PutOptions, Txn, TxnOp};
use tracing::{info, warn};

use super::{KvStore, LeaseId, Precondition, StoreError, WriteLease, DEFAULT_MIN_LEASE_TTL};

/// A [`KvStore`] backed by an etcd cluster.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    min_lease_ttl: Duration,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore")
            .field("client", &"<etcd_client::Client>")
            .field("min_lease_ttl", &self.min_lease_ttl)
            .finish()
    }
}

fn transport(err: etcd_client::Error) -> StoreError {
    StoreError::Transport(err.to_string())
}

/// etcd lease TTLs are whole seconds; round up so a lease never ends early.
fn ttl_secs(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

impl EtcdStore {
    /// Connect to the given etcd endpoints.
    pub async fn connect(endpoints: &[String]) -> Result<Self, StoreError> {
        info!(endpoints = ?endpoints, "Connecting to etcd");
        let client = Client::connect(endpoints, None).await.map_err(transport)?;
        Ok(Self::from_client(client))
    }

    /// Wrap an existing client.
    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            min_lease_ttl: DEFAULT_MIN_LEASE_TTL,
        }
    }

    /// Override the minimum lease TTL the cluster is configured with.
    pub fn with_min_lease_ttl(mut self, min_lease_ttl: Duration) -> Self {
        self.min_lease_ttl = min_lease_ttl;
        self
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut kv = self.client.kv_client();
        let resp = kv.get(key, None).await.map_err(transport)?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn put_if(
        &self,
        key: &str,
        precondition: Precondition,
        value: Vec<u8>,
        lease: WriteLease,
    ) -> Result<bool, StoreError> {
        let compare = match precondition {
            Precondition::Absent => Compare::version(key, CompareOp::Equal, 0),
            Precondition::ValueEquals(expected) => Compare::value(key, CompareOp::Equal, expected),
        };
        let options = match lease {
            WriteLease::None => None,
            WriteLease::Attach(id) => Some(PutOptions::new().with_lease(id.0)),
            WriteLease::KeepExisting => Some(PutOptions::new().with_ignore_lease()),
        };

        let txn = Txn::new()
            .when(vec![compare])
            .and_then(vec![TxnOp::put(key, value, options)]);

        let mut kv = self.client.kv_client();
        let resp = kv.txn(txn).await.map_err(|e| {
            warn!(key = %key, error = %e, "etcd transaction failed");
            transport(e)
        })?;
        Ok(resp.succeeded())
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        let mut leases = self.client.lease_client();
        let resp = leases.grant(ttl_secs(ttl), None).await.map_err(transport)?;
        Ok(LeaseId(resp.id()))
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError> {
        let mut leases = self.client.lease_client();
        leases.revoke(lease.0).await.map_err(transport)?;
        Ok(())
    }

    fn min_lease_ttl(&self) -> Duration {
        self.min_lease_ttl
    }
}
