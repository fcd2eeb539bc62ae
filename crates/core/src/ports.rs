//! Contracts for the collaborators the resilience layer consumes but does not own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{AuditRecord, OverdueTransfer};

/// Durable destination for audit records.
///
/// Failures come back as values so they can never unwind into business logic.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, record: &AuditRecord) -> Result<(), AuditSinkError>;
}

/// Errors reported by an audit sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuditSinkError {
    #[error("audit store unavailable: {0}")]
    Unavailable(String),
    #[error("audit write timed out after {0} ms")]
    Timeout(u64),
    #[error("audit write rejected: {0}")]
    Rejected(String),
}

/// Read access to stock transfers for overdue detection.
#[async_trait]
pub trait TransferRepository: Send + Sync {
    /// Open transfers whose `opened_at` is strictly before `opened_before`.
    async fn find_overdue_transfers(
        &self,
        opened_before: DateTime<Utc>,
    ) -> Result<Vec<OverdueTransfer>, TransferQueryError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferQueryError {
    #[error("transfer repository unavailable: {0}")]
    Unavailable(String),
    #[error("transfer query timed out after {0} ms")]
    Timeout(u64),
}
