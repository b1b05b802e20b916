//! In-process store with etcd-like conditional writes and leases.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::{KvStore, LeaseId, Precondition, StoreError, WriteLease, DEFAULT_MIN_LEASE_TTL};

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct Lease {
    requested: Duration,
    deadline: Instant,
    /// Keys attached to this lease at some point
    keys: HashSet<String>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    /// Lease deadlines in expiry order
    expiry: BTreeSet<(Instant, LeaseId)>,
    next_lease: i64,
}

impl State {
    /// Expire every lease whose deadline has passed, with its keys.
    fn sweep(&mut self, now: Instant) {
        while let Some(&(deadline, id)) = self.expiry.first() {
            if deadline > now {
                break;
            }
            self.expiry.pop_first();
            self.drop_lease(id);
        }
    }

    fn drop_lease(&mut self, id: LeaseId) {
        let Some(lease) = self.leases.remove(&id) else {
            return;
        };
        self.expiry.remove(&(lease.deadline, id));

        for key in lease.keys {
            if self.entries.get(&key).is_some_and(|e| e.lease == Some(id)) {
                trace!(key = %key, lease = id.0, "Deleting leased entry");
                self.entries.remove(&key);
            }
        }
    }
}

/// A single-process [`KvStore`].
///
/// Every operation runs under one mutex, which makes it linearizable per key.
/// Leases are swept on each operation, so expired records are deleted
/// rather than merely hidden. Lease deadlines use the tokio clock so
/// paused-time tests can expire them.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    min_lease_ttl: Duration,
}

impl MemoryStore {
    /// Create an empty store with the default minimum lease TTL.
    pub fn new() -> Self {
        Self::with_min_lease_ttl(DEFAULT_MIN_LEASE_TTL)
    }

    /// Create an empty store that honours leases for at least `min_lease_ttl`.
    pub fn with_min_lease_ttl(min_lease_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                next_lease: 1,
                ..State::default()
            }),
            min_lease_ttl,
        }
    }

    /// The TTL that was requested when `id` was granted, while it is alive.
    pub fn lease_ttl(&self, id: LeaseId) -> Option<Duration> {
        let mut state = self.state.lock();
        state.sweep(Instant::now());
        state.leases.get(&id).map(|l| l.requested)
    }

    /// The lease currently bound to `key`, if any.
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        let mut state = self.state.lock();
        state.sweep(Instant::now());
        state.entries.get(key).and_then(|e| e.lease)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let mut state = self.state.lock();
        state.sweep(Instant::now());
        state.entries.len()
    }

    /// Whether the store holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of leases not yet expired or revoked.
    pub fn lease_count(&self) -> usize {
        let mut state = self.state.lock();
        state.sweep(Instant::now());
        state.leases.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut state = self.state.lock();
        state.sweep(Instant::now());
        Ok(state.entries.get(key).map(|e| e.value.clone()))
    }

    async fn put_if(
        &self,
        key: &str,
        precondition: Precondition,
        value: Vec<u8>,
        lease: WriteLease,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        state.sweep(Instant::now());

        let existing_lease = match (state.entries.get(key), &precondition) {
            (None, Precondition::Absent) => None,
            (Some(entry), Precondition::ValueEquals(expected)) if &entry.value == expected => {
                entry.lease
            }
            _ => return Ok(false),
        };

        let lease = match lease {
            WriteLease::None => None,
            WriteLease::Attach(id) => {
                let Some(granted) = state.leases.get_mut(&id) else {
                    return Err(StoreError::Transport(format!("lease {} not found", id.0)));
                };
                granted.keys.insert(key.to_string());
                Some(id)
            }
            WriteLease::KeepExisting => existing_lease,
        };

        state.entries.insert(key.to_string(), Entry { value, lease });
        Ok(true)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.sweep(now);

        let id = LeaseId(state.next_lease);
        state.next_lease += 1;
        let deadline = now + ttl.max(self.min_lease_ttl);
        state.leases.insert(
            id,
            Lease {
                requested: ttl,
                deadline,
                keys: HashSet::new(),
            },
        );
        state.expiry.insert((deadline, id));
        Ok(id)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.sweep(Instant::now());
        if !state.leases.contains_key(&lease) {
            return Err(StoreError::Transport(format!("lease {} not found", lease.0)));
        }
        state.drop_lease(lease);
        Ok(())
    }

    fn min_lease_ttl(&self) -> Duration {
        self.min_lease_ttl
    }
}
