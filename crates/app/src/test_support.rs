use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use stockres_core::ports::{AuditSink, AuditSinkError, TransferQueryError, TransferRepository};
use stockres_core::types::{AuditAction, AuditRecord, FallbackEntry, OverdueTransfer};

/// Audit sink whose availability can be toggled at runtime.
#[derive(Default)]
pub struct ToggleSink {
    offline: AtomicBool,
    attempts: AtomicUsize,
    written: Mutex<Vec<AuditRecord>>,
}

impl ToggleSink {
    pub fn online() -> Self {
        Self::default()
    }

    pub fn offline() -> Self {
        let sink = Self::default();
        sink.set_offline(true);
        sink
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<AuditRecord> {
        self.written.lock().expect("sink lock poisoned").clone()
    }
}

#[async_trait]
impl AuditSink for ToggleSink {
    async fn write(&self, record: &AuditRecord) -> Result<(), AuditSinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(AuditSinkError::Unavailable("connection refused".to_string()));
        }
        self.written
            .lock()
            .expect("sink lock poisoned")
            .push(record.clone());
        Ok(())
    }
}

/// Sink that never answers, for exercising write timeouts.
pub struct HangingSink;

#[async_trait]
impl AuditSink for HangingSink {
    async fn write(&self, _record: &AuditRecord) -> Result<(), AuditSinkError> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Transfer repository returning a scripted result.
pub struct ScriptedTransfers {
    result: Mutex<Result<Vec<OverdueTransfer>, TransferQueryError>>,
    cutoffs: Mutex<Vec<DateTime<Utc>>>,
}

impl ScriptedTransfers {
    pub fn returning(transfers: Vec<OverdueTransfer>) -> Self {
        Self {
            result: Mutex::new(Ok(transfers)),
            cutoffs: Mutex::new(Vec::new()),
        }
    }

    pub fn set(&self, result: Result<Vec<OverdueTransfer>, TransferQueryError>) {
        *self.result.lock().expect("transfers lock poisoned") = result;
    }

    pub fn cutoffs(&self) -> Vec<DateTime<Utc>> {
        self.cutoffs.lock().expect("transfers lock poisoned").clone()
    }
}

#[async_trait]
impl TransferRepository for ScriptedTransfers {
    async fn find_overdue_transfers(
        &self,
        opened_before: DateTime<Utc>,
    ) -> Result<Vec<OverdueTransfer>, TransferQueryError> {
        self.cutoffs
            .lock()
            .expect("transfers lock poisoned")
            .push(opened_before);
        self.result.lock().expect("transfers lock poisoned").clone()
    }
}

pub fn overdue_transfer(id: &str, opened_at: DateTime<Utc>) -> OverdueTransfer {
    OverdueTransfer {
        transfer_id: id.to_string(),
        source_warehouse_id: "w-1".to_string(),
        destination_warehouse_id: "w-2".to_string(),
        opened_at,
    }
}

pub fn audit_record(entity_id: &str) -> AuditRecord {
    AuditRecord::new("StockMovement", entity_id, AuditAction::Create, Utc::now())
}

pub fn fallback_entry(entity_id: &str, retry_count: u32) -> FallbackEntry {
    let mut entry = FallbackEntry::new(audit_record(entity_id), "initial write failed");
    entry.retry_count = retry_count;
    entry
}
