use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;

use crate::types::{SequenceError, SequenceKey, SequenceNumber};

/// Hands out strictly increasing sequence numbers per (product, warehouse) key.
///
/// Each key owns its own atomic counter, created on first use, so unrelated keys
/// never contend with each other. Counters hold the last value handed out.
#[derive(Debug, Default)]
pub struct SequenceAllocator {
    counters: DashMap<SequenceKey, AtomicI64>,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next number for `key`, starting at 1 for an unseen key.
    pub fn next(&self, key: &SequenceKey) -> Result<SequenceNumber, SequenceError> {
        self.with_counter(key, |counter| {
            counter
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    current.checked_add(1)
                })
                .map(|previous| previous + 1)
                .map_err(|_| SequenceError::Exhausted(key.clone()))
        })
        .and_then(SequenceNumber::new)
    }

    /// Raises the counter for `key` to at least `high_water`.
    ///
    /// Used at boot to resume from persisted high-water marks; never lowers a counter.
    pub fn seed(&self, key: &SequenceKey, high_water: SequenceNumber) {
        self.observe(key, high_water);
    }

    /// Accounts for a number assigned outside the allocator, such as a manual override.
    pub fn observe(&self, key: &SequenceKey, assigned: SequenceNumber) {
        self.with_counter(key, |counter| {
            counter.fetch_max(assigned.get(), Ordering::AcqRel);
        });
    }

    /// Last number handed out or observed for `key`, if any.
    pub fn current(&self, key: &SequenceKey) -> Option<SequenceNumber> {
        self.counters
            .get(key)
            .and_then(|counter| SequenceNumber::new(counter.load(Ordering::Acquire)).ok())
    }

    /// Number of keys with a live counter.
    pub fn key_count(&self) -> usize {
        self.counters.len()
    }

    fn with_counter<R>(&self, key: &SequenceKey, op: impl FnOnce(&AtomicI64) -> R) -> R {
        // Fast path only takes the shard read lock.
        if let Some(counter) = self.counters.get(key) {
            return op(counter.value());
        }
        let counter = self
            .counters
            .entry(key.clone())
            .or_insert_with(|| AtomicI64::new(0));
        op(counter.value())
    }
}
