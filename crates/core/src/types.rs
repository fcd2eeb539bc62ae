use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Composite key that scopes stock movement ordering to one product in one warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceKey {
    product_id: String,
    warehouse_id: String,
}

impl SequenceKey {
    /// Builds a key, rejecting blank identifiers.
    pub fn new(
        product_id: impl Into<String>,
        warehouse_id: impl Into<String>,
    ) -> Result<Self, SequenceKeyError> {
        let product_id = product_id.into();
        let warehouse_id = warehouse_id.into();
        if product_id.trim().is_empty() {
            return Err(SequenceKeyError::EmptyProduct);
        }
        if warehouse_id.trim().is_empty() {
            return Err(SequenceKeyError::EmptyWarehouse);
        }
        Ok(Self {
            product_id,
            warehouse_id,
        })
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn warehouse_id(&self) -> &str {
        &self.warehouse_id
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.product_id, self.warehouse_id)
    }
}

/// Errors raised when a sequence key is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceKeyError {
    #[error("product id must not be empty")]
    EmptyProduct,
    #[error("warehouse id must not be empty")]
    EmptyWarehouse,
}

/// Strictly positive ordering number of a stock movement within its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SequenceNumber(i64);

impl SequenceNumber {
    /// Validates a raw value. Zero and negative values are rejected.
    pub fn new(value: i64) -> Result<Self, SequenceError> {
        if value <= 0 {
            return Err(SequenceError::NonPositive(value));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for SequenceNumber {
    type Error = SequenceError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Errors raised by sequence validation and allocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    #[error("sequence number must be greater than zero (got {0})")]
    NonPositive(i64),
    #[error("sequence space exhausted for {0}")]
    Exhausted(SequenceKey),
}

/// Ordering-relevant slice of a stock movement.
///
/// The sequence number is fixed at construction; there is no setter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockMovement {
    pub document_number: String,
    pub key: SequenceKey,
    pub quantity: i64,
    sequence_number: SequenceNumber,
    pub occurred_at: DateTime<Utc>,
}

impl StockMovement {
    pub fn new(
        document_number: impl Into<String>,
        key: SequenceKey,
        quantity: i64,
        sequence_number: SequenceNumber,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            document_number: document_number.into(),
            key,
            quantity,
            sequence_number,
            occurred_at,
        }
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }
}

/// Kind of change captured by an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

impl AuditAction {
    /// Returns the canonical database representation for the action.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// Audit record handed to the durable sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    /// Business-event time, never the retry time.
    pub timestamp: DateTime<Utc>,
    pub entity_type: String,
    pub entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_name: Option<String>,
    pub action: AuditAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_data: Option<String>,
}

impl AuditRecord {
    /// Creates a record with a generated id and no optional payloads.
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        action: AuditAction,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            entity_name: None,
            action,
            tenant_id: None,
            old_value: None,
            new_value: None,
            additional_data: None,
        }
    }

    pub fn with_entity_name(mut self, name: impl Into<String>) -> Self {
        self.entity_name = Some(name.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_values(mut self, old_value: Option<String>, new_value: Option<String>) -> Self {
        self.old_value = old_value;
        self.new_value = new_value;
        self
    }

    pub fn with_additional_data(mut self, data: impl Into<String>) -> Self {
        self.additional_data = Some(data.into());
        self
    }
}

/// Audit record waiting in the fallback queue after a failed durable write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackEntry {
    pub id: Uuid,
    pub record: AuditRecord,
    pub retry_count: u32,
    pub failure_reason: Option<String>,
}

impl FallbackEntry {
    /// Wraps a record that just failed its first write.
    pub fn new(record: AuditRecord, failure_reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            record,
            retry_count: 0,
            failure_reason: Some(failure_reason.into()),
        }
    }

    /// Records one more failed drain attempt, replacing the previous reason.
    pub fn record_failure(&mut self, reason: impl Into<String>) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.failure_reason = Some(reason.into());
    }

    /// Returns `true` once the entry may no longer be retried.
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }
}

/// Stock transfer that has been open longer than the SLA window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverdueTransfer {
    pub transfer_id: String,
    pub source_warehouse_id: String,
    pub destination_warehouse_id: String,
    pub opened_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_number_rejects_zero_and_negatives() {
        for value in [0, -1, -42, i64::MIN] {
            let err = SequenceNumber::new(value).expect_err("non-positive must be rejected");
            assert_eq!(err, SequenceError::NonPositive(value));
            assert!(err.to_string().contains("greater than zero"));
        }
    }

    #[test]
    fn sequence_number_stores_max_exactly() {
        let number = SequenceNumber::try_from(i64::MAX).expect("max is positive");
        assert_eq!(number.get(), i64::MAX);

        let key = SequenceKey::new("p-1", "w-1").expect("valid key");
        let movement = StockMovement::new("SM-0001", key, 3, number, Utc::now());
        assert_eq!(movement.sequence_number().get(), i64::MAX);
    }

    #[test]
    fn sequence_key_rejects_blank_parts() {
        assert_eq!(
            SequenceKey::new(" ", "w-1"),
            Err(SequenceKeyError::EmptyProduct)
        );
        assert_eq!(
            SequenceKey::new("p-1", ""),
            Err(SequenceKeyError::EmptyWarehouse)
        );
        let key = SequenceKey::new("p-1", "w-1").expect("valid key");
        assert_eq!(key.to_string(), "p-1@w-1");
    }

    #[test]
    fn fallback_entry_tracks_latest_failure() {
        let record = AuditRecord::new("StockMovement", "SM-1", AuditAction::Create, Utc::now());
        let mut entry = FallbackEntry::new(record.clone(), "sink offline");
        assert_eq!(entry.retry_count, 0);
        assert!(!entry.is_exhausted(5));

        for attempt in 1..=5 {
            entry.record_failure(format!("attempt {attempt} failed"));
        }

        assert_eq!(entry.retry_count, 5);
        assert_eq!(entry.failure_reason.as_deref(), Some("attempt 5 failed"));
        assert!(entry.is_exhausted(5));
        assert_eq!(entry.record, record);
    }
}
