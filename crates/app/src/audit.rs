use std::{sync::Arc, time::Duration};

use metrics::counter;
use tokio::time::timeout;
use tracing::{debug, warn};

use stockres_core::ports::{AuditSink, AuditSinkError};
use stockres_core::types::{AuditRecord, FallbackEntry};
use stockres_core::FallbackQueue;

/// What happened to a recorded audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Persisted,
    /// The durable write failed; the record now waits in the fallback queue.
    Deferred,
}

/// Synchronous audit boundary used by business operations.
///
/// Never returns an error: a failed durable write parks the record in the
/// fallback queue so the originating transaction is unaffected.
#[derive(Clone)]
pub struct AuditRecorder {
    sink: Arc<dyn AuditSink>,
    queue: Arc<FallbackQueue>,
    write_timeout: Duration,
}

impl AuditRecorder {
    pub fn new(sink: Arc<dyn AuditSink>, queue: Arc<FallbackQueue>, write_timeout: Duration) -> Self {
        Self {
            sink,
            queue,
            write_timeout,
        }
    }

    pub async fn record(&self, record: AuditRecord) -> AuditOutcome {
        let failure = match timeout(self.write_timeout, self.sink.write(&record)).await {
            Ok(Ok(())) => {
                counter!("audit_writes_total", "result" => "direct").increment(1);
                debug!(
                    stage = "audit",
                    record_id = %record.id,
                    entity_type = %record.entity_type,
                    entity_id = %record.entity_id,
                    "audit record persisted"
                );
                return AuditOutcome::Persisted;
            }
            Ok(Err(err)) => err,
            Err(_) => AuditSinkError::Timeout(self.write_timeout.as_millis() as u64),
        };

        warn!(
            stage = "audit",
            record_id = %record.id,
            entity_type = %record.entity_type,
            entity_id = %record.entity_id,
            action = record.action.as_str(),
            error = %failure,
            "audit write failed; deferring to fallback queue"
        );
        counter!("audit_writes_total", "result" => "fallback").increment(1);
        counter!("audit_fallback_enqueued_total").increment(1);
        self.queue.enqueue(FallbackEntry::new(record, failure.to_string()));
        AuditOutcome::Deferred
    }
}
