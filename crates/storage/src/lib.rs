use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError, sqlite::SqlitePoolOptions, Row, Sqlite, SqlitePool, Transaction,
};
use thiserror::Error;

use stockres_core::ports::{AuditSink, AuditSinkError, TransferQueryError, TransferRepository};
use stockres_core::types::{
    AuditRecord, OverdueTransfer, SequenceKey, SequenceNumber, StockMovement,
};

const SQLITE_CONSTRAINT_PRIMARYKEY: &str = "1555";
const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns the durable audit store.
    pub fn audit_log(&self) -> AuditLogRepository {
        AuditLogRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for stock transfer documents.
    pub fn stock_transfers(&self) -> StockTransferRepository {
        StockTransferRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for stock movements and their sequence high-water marks.
    pub fn stock_movements(&self) -> StockMovementRepository {
        StockMovementRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Durable audit store backed by the `audit_log` table.
#[derive(Clone)]
pub struct AuditLogRepository {
    pool: SqlitePool,
}

impl AuditLogRepository {
    /// Inserts a record. A second insert of the same id is treated as already persisted.
    pub async fn insert(&self, record: &AuditRecord) -> Result<AuditInsertOutcome, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO audit_log \
             (id, recorded_at, entity_type, entity_id, entity_name, action, tenant_id, old_value, new_value, additional_data, persisted_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(to_rfc3339(record.timestamp))
        .bind(&record.entity_type)
        .bind(&record.entity_id)
        .bind(&record.entity_name)
        .bind(record.action.as_str())
        .bind(&record.tenant_id)
        .bind(&record.old_value)
        .bind(&record.new_value)
        .bind(&record.additional_data)
        .bind(to_rfc3339(Utc::now()))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(AuditInsertOutcome::Inserted),
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some(SQLITE_CONSTRAINT_PRIMARYKEY) =>
            {
                Ok(AuditInsertOutcome::Duplicate)
            }
            Err(err) => Err(err),
        }
    }

    /// Lists persisted audit rows for one entity, oldest first.
    pub async fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditLogRow>, sqlx::Error> {
        sqlx::query_as::<_, AuditLogRow>(
            r#"
SELECT id,
       recorded_at,
       entity_type,
       entity_id,
       action,
       tenant_id,
       new_value
  FROM audit_log
 WHERE entity_type = ?
   AND entity_id = ?
 ORDER BY recorded_at ASC
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn count(&self) -> Result<u64, sqlx::Error> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM audit_log")
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = row.get("total");
        Ok(total as u64)
    }
}

#[async_trait]
impl AuditSink for AuditLogRepository {
    async fn write(&self, record: &AuditRecord) -> Result<(), AuditSinkError> {
        self.insert(record)
            .await
            .map(|_| ())
            .map_err(audit_sink_error)
    }
}

fn audit_sink_error(err: sqlx::Error) -> AuditSinkError {
    match err {
        sqlx::Error::Database(db_err) => AuditSinkError::Rejected(db_err.to_string()),
        other => AuditSinkError::Unavailable(other.to_string()),
    }
}

/// Result of inserting into `audit_log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditInsertOutcome {
    Inserted,
    Duplicate,
}

/// Slice of an `audit_log` row.
#[derive(Debug, sqlx::FromRow)]
pub struct AuditLogRow {
    pub id: String,
    pub recorded_at: DateTime<Utc>,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub tenant_id: Option<String>,
    pub new_value: Option<String>,
}

/// Repository for stock transfer documents.
#[derive(Clone)]
pub struct StockTransferRepository {
    pool: SqlitePool,
}

impl StockTransferRepository {
    /// Opens a new transfer.
    pub async fn insert(&self, transfer: &NewStockTransfer<'_>) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO stock_transfers \
             (id, source_warehouse_id, destination_warehouse_id, status, opened_at) \
             VALUES (?, ?, ?, 'OPEN', ?)",
        )
        .bind(transfer.id)
        .bind(transfer.source_warehouse_id)
        .bind(transfer.destination_warehouse_id)
        .bind(to_rfc3339(transfer.opened_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Marks a transfer as completed. Returns `false` when no open transfer matched.
    pub async fn complete(
        &self,
        transfer_id: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE stock_transfers SET status = 'COMPLETED', completed_at = ? \
             WHERE id = ? AND status = 'OPEN'",
        )
        .bind(to_rfc3339(completed_at))
        .bind(transfer_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Lists open transfers opened strictly before `opened_before`, oldest first.
    pub async fn list_open_before(
        &self,
        opened_before: DateTime<Utc>,
    ) -> Result<Vec<OverdueTransferRow>, sqlx::Error> {
        sqlx::query_as::<_, OverdueTransferRow>(
            r#"
SELECT id,
       source_warehouse_id,
       destination_warehouse_id,
       opened_at
  FROM stock_transfers
 WHERE status = 'OPEN'
   AND opened_at < ?
 ORDER BY opened_at ASC
            "#,
        )
        .bind(to_rfc3339(opened_before))
        .fetch_all(&self.pool)
        .await
    }
}

#[async_trait]
impl TransferRepository for StockTransferRepository {
    async fn find_overdue_transfers(
        &self,
        opened_before: DateTime<Utc>,
    ) -> Result<Vec<OverdueTransfer>, TransferQueryError> {
        let rows = self
            .list_open_before(opened_before)
            .await
            .map_err(|err| TransferQueryError::Unavailable(err.to_string()))?;
        Ok(rows.into_iter().map(OverdueTransferRow::into_domain).collect())
    }
}

/// Parameters required to open a stock transfer.
pub struct NewStockTransfer<'a> {
    pub id: &'a str,
    pub source_warehouse_id: &'a str,
    pub destination_warehouse_id: &'a str,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct OverdueTransferRow {
    pub id: String,
    pub source_warehouse_id: String,
    pub destination_warehouse_id: String,
    pub opened_at: DateTime<Utc>,
}

impl OverdueTransferRow {
    pub fn into_domain(self) -> OverdueTransfer {
        OverdueTransfer {
            transfer_id: self.id,
            source_warehouse_id: self.source_warehouse_id,
            destination_warehouse_id: self.destination_warehouse_id,
            opened_at: self.opened_at,
        }
    }
}

/// Repository for stock movements and per-key sequence high-water marks.
#[derive(Clone)]
pub struct StockMovementRepository {
    pool: SqlitePool,
}

impl StockMovementRepository {
    /// Begins a SQLite transaction.
    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Inserts a movement and raises its key's high-water mark in the same transaction.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        movement: &StockMovement,
    ) -> Result<(), MovementRepositoryError> {
        let sequence = movement.sequence_number().get();
        sqlx::query(
            "INSERT INTO stock_movements \
             (document_number, product_id, warehouse_id, quantity, sequence_number, occurred_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&movement.document_number)
        .bind(movement.key.product_id())
        .bind(movement.key.warehouse_id())
        .bind(movement.quantity)
        .bind(sequence)
        .bind(to_rfc3339(movement.occurred_at))
        .execute(&mut **tx)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some(SQLITE_CONSTRAINT_PRIMARYKEY) => MovementRepositoryError::DuplicateDocument,
                Some(SQLITE_CONSTRAINT_UNIQUE) => MovementRepositoryError::DuplicateSequence,
                _ => MovementRepositoryError::Database(sqlx::Error::Database(db_err)),
            },
            other => MovementRepositoryError::Database(other),
        })?;

        sqlx::query(
            "INSERT INTO sequence_counters (product_id, warehouse_id, high_water, updated_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(product_id, warehouse_id) DO UPDATE \
             SET high_water = MAX(high_water, excluded.high_water), updated_at = excluded.updated_at",
        )
        .bind(movement.key.product_id())
        .bind(movement.key.warehouse_id())
        .bind(sequence)
        .bind(to_rfc3339(movement.occurred_at))
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Lists every persisted high-water mark, used to seed the allocator at boot.
    pub async fn high_water_marks(
        &self,
    ) -> Result<Vec<(SequenceKey, SequenceNumber)>, MovementRepositoryError> {
        let rows = sqlx::query(
            "SELECT product_id, warehouse_id, high_water FROM sequence_counters \
             ORDER BY product_id, warehouse_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let product_id: String = row.get("product_id");
                let warehouse_id: String = row.get("warehouse_id");
                let high_water: i64 = row.get("high_water");
                let key = SequenceKey::new(product_id, warehouse_id)
                    .map_err(|err| MovementRepositoryError::Corrupt(err.to_string()))?;
                let number = SequenceNumber::new(high_water)
                    .map_err(|err| MovementRepositoryError::Corrupt(err.to_string()))?;
                Ok((key, number))
            })
            .collect()
    }

    /// Lists sequence numbers stored for a key in ascending order.
    pub async fn list_sequence_numbers(&self, key: &SequenceKey) -> Result<Vec<i64>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT sequence_number FROM stock_movements \
             WHERE product_id = ? AND warehouse_id = ? ORDER BY sequence_number",
        )
        .bind(key.product_id())
        .bind(key.warehouse_id())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("sequence_number")).collect())
    }
}

/// Errors that can occur while persisting stock movements.
#[derive(Debug, Error)]
pub enum MovementRepositoryError {
    #[error("a movement with the same document number already exists")]
    DuplicateDocument,
    #[error("sequence number already used for this product and warehouse")]
    DuplicateSequence,
    #[error("stored sequence counter is invalid: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
