//! Token bucket implementation.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// A bounded pool of interchangeable tokens.
///
/// Acquires take a shared lock and claim a token with a compare-and-swap, so
/// they run concurrently with one another. Refills take the exclusive lock, so
/// a refill is atomic with respect to every acquire that observes it.
#[derive(Debug)]
pub struct TokenBucket {
    /// Tokens currently resident in the bucket
    tokens: AtomicU64,
    /// Maximum number of resident tokens
    capacity: u64,
    /// Shared for acquires, exclusive for refills
    gate: RwLock<()>,
}

impl TokenBucket {
    /// Create a full bucket holding `capacity` tokens.
    pub fn new(capacity: u64) -> Self {
        Self {
            tokens: AtomicU64::new(capacity),
            capacity,
            gate: RwLock::new(()),
        }
    }

    /// Take one token if any is available. Never blocks on other acquires.
    ///
    /// Returns `true` if a token was taken.
    pub fn acquire(&self) -> bool {
        let _shared = self.gate.read();
        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Top the bucket back up to capacity.
    ///
    /// Redundant refills are harmless: the bucket never holds more than
    /// `capacity` tokens.
    pub fn refill(&self) {
        let _exclusive = self.gate.write();
        self.tokens.store(self.capacity, Ordering::Release);
    }

    /// Tokens currently available.
    pub fn available(&self) -> u64 {
        self.tokens.load(Ordering::Acquire)
    }

    /// Get the capacity of this bucket.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}
