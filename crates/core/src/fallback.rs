use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::SegQueue;
use serde::Serialize;

use crate::types::FallbackEntry;

/// Unbounded lock-free holding area for audit records whose durable write failed.
///
/// Neither operation blocks. Growth is not limited here; the health check escalates
/// instead of rejecting writes.
#[derive(Debug, Default)]
pub struct FallbackQueue {
    entries: SegQueue<FallbackEntry>,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
}

impl FallbackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, entry: FallbackEntry) {
        // Count first so dequeued never overtakes enqueued.
        self.enqueued.fetch_add(1, Ordering::AcqRel);
        self.entries.push(entry);
    }

    pub fn try_dequeue(&self) -> Option<FallbackEntry> {
        let entry = self.entries.pop()?;
        self.dequeued.fetch_add(1, Ordering::AcqRel);
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lifetime totals. Re-enqueued retries count as fresh enqueues.
    pub fn stats(&self) -> FallbackQueueStats {
        FallbackQueueStats {
            enqueued_total: self.enqueued.load(Ordering::Acquire),
            dequeued_total: self.dequeued.load(Ordering::Acquire),
            depth: self.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FallbackQueueStats {
    pub enqueued_total: u64,
    pub dequeued_total: u64,
    pub depth: usize,
}
