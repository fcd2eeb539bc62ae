use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use stockres_core::types::{
    AuditAction, AuditRecord, SequenceError, SequenceKey, SequenceKeyError, SequenceNumber,
    StockMovement,
};
use stockres_core::SequenceAllocator;
use stockres_storage::{Database, MovementRepositoryError};

use crate::audit::AuditRecorder;

const AUDIT_ENTITY_TYPE: &str = "StockMovement";

/// Request to record a stock movement.
#[derive(Debug, Clone, Deserialize)]
pub struct NewMovement {
    pub document_number: String,
    pub product_id: String,
    pub warehouse_id: String,
    pub quantity: i64,
    /// Manually assigned sequence number; allocated when absent.
    #[serde(default)]
    pub sequence_number: Option<i64>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// Records stock movements: sequence assignment, persistence, then audit.
#[derive(Clone)]
pub struct StockMovementService {
    database: Database,
    allocator: Arc<SequenceAllocator>,
    recorder: AuditRecorder,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl StockMovementService {
    pub fn new(database: Database, allocator: Arc<SequenceAllocator>, recorder: AuditRecorder) -> Self {
        Self {
            database,
            allocator,
            recorder,
            clock: Arc::new(Utc::now),
        }
    }

    /// Overrides the clock used for movement and audit timestamps.
    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn record(&self, request: NewMovement) -> Result<StockMovement, MovementError> {
        let document_number = request.document_number.trim();
        if document_number.is_empty() {
            return Err(MovementError::MissingDocumentNumber);
        }
        let key = SequenceKey::new(request.product_id, request.warehouse_id)?;

        let (sequence, manual) = match request.sequence_number {
            Some(raw) => {
                let sequence = SequenceNumber::new(raw)?;
                // Raised before the insert so concurrent allocations skip past it.
                self.allocator.observe(&key, sequence);
                (sequence, true)
            }
            None => (self.allocator.next(&key)?, false),
        };

        let movement = StockMovement::new(
            document_number,
            key,
            request.quantity,
            sequence,
            (self.clock)(),
        );

        let repo = self.database.stock_movements();
        let mut tx = repo.begin().await.map_err(MovementRepositoryError::from)?;
        repo.insert(&mut tx, &movement).await?;
        tx.commit().await.map_err(MovementRepositoryError::from)?;

        counter!("stock_movements_total").increment(1);
        info!(
            stage = "movement",
            document_number = %movement.document_number,
            key = %movement.key,
            sequence = sequence.get(),
            manual,
            "stock movement recorded"
        );

        let mut record = AuditRecord::new(
            AUDIT_ENTITY_TYPE,
            movement.document_number.clone(),
            AuditAction::Create,
            movement.occurred_at,
        )
        .with_entity_name(movement.key.to_string())
        .with_values(None, serde_json::to_string(&movement).ok());
        if let Some(tenant_id) = request.tenant_id {
            record = record.with_tenant(tenant_id);
        }
        self.recorder.record(record).await;

        Ok(movement)
    }
}

#[derive(Debug, Error)]
pub enum MovementError {
    #[error("document number must not be empty")]
    MissingDocumentNumber,
    #[error("invalid movement key: {0}")]
    InvalidKey(#[from] SequenceKeyError),
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error(transparent)]
    Storage(#[from] MovementRepositoryError),
}
