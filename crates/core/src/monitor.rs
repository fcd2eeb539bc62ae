use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Result of the most recently completed overdue-transfer scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferScanSnapshot {
    pub overdue_count: u64,
    /// `None` until the first scan completes.
    pub last_check: Option<DateTime<Utc>>,
}

/// Published state of the transfer timeout monitor.
///
/// The count and timestamp are swapped together so readers never observe a
/// half-updated pair.
#[derive(Debug, Default)]
pub struct TransferMonitorState {
    snapshot: RwLock<TransferScanSnapshot>,
}

impl TransferMonitorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a completed scan.
    ///
    /// `last_check` never moves backwards: a completion time earlier than the
    /// published one (clock skew) keeps the published timestamp.
    pub fn publish(&self, overdue_count: u64, completed_at: DateTime<Utc>) -> TransferScanSnapshot {
        let mut guard = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let last_check = match guard.last_check {
            Some(previous) if previous > completed_at => previous,
            _ => completed_at,
        };
        *guard = TransferScanSnapshot {
            overdue_count,
            last_check: Some(last_check),
        };
        *guard
    }

    pub fn snapshot(&self) -> TransferScanSnapshot {
        *self
            .snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
