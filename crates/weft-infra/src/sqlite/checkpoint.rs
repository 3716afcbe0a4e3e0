//! SQLite checkpoint store implementation.
//!
//! Implements `CheckpointStore` from `weft-core` using sqlx with split
//! read/write pools. The definition and execution context are stored as JSON
//! blobs, one row per run, upserted after every applied transition.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;
use weft_core::workflow::checkpoint::{CheckpointRecord, CheckpointStore};
use weft_types::error::RepositoryError;
use weft_types::workflow::RunStatus;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `CheckpointStore`.
pub struct SqliteCheckpointStore {
    pool: DatabasePool,
}

impl SqliteCheckpointStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct CheckpointRow {
    run_id: String,
    workflow_name: String,
    status: String,
    definition: String,
    context: String,
    created_at: String,
    updated_at: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            workflow_name: row.try_get("workflow_name")?,
            status: row.try_get("status")?,
            definition: row.try_get("definition")?,
            context: row.try_get("context")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<CheckpointRecord, RepositoryError> {
        let status: RunStatus = serde_json::from_value(serde_json::Value::String(
            self.status.clone(),
        ))
        .map_err(|_| RepositoryError::Query(format!("invalid run status: {}", self.status)))?;

        let definition = serde_json::from_str(&self.definition).map_err(|e| {
            RepositoryError::Serialization(format!("invalid workflow definition JSON: {e}"))
        })?;
        let context = serde_json::from_str(&self.context)
            .map_err(|e| RepositoryError::Serialization(format!("invalid context JSON: {e}")))?;

        Ok(CheckpointRecord {
            run_id: parse_uuid(&self.run_id)?,
            workflow_name: self.workflow_name,
            status,
            definition,
            context,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn collect_records(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<CheckpointRecord>, RepositoryError> {
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let r = CheckpointRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        records.push(r.into_record()?);
    }
    Ok(records)
}

const SELECT_COLUMNS: &str =
    "SELECT run_id, workflow_name, status, definition, context, created_at, updated_at FROM workflow_checkpoints";

// ---------------------------------------------------------------------------
// CheckpointStore impl
// ---------------------------------------------------------------------------

impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, record: &CheckpointRecord) -> Result<(), RepositoryError> {
        let definition_json = serde_json::to_string(&record.definition)
            .map_err(|e| RepositoryError::Serialization(format!("serialize definition: {e}")))?;
        let context_json = serde_json::to_string(&record.context)
            .map_err(|e| RepositoryError::Serialization(format!("serialize context: {e}")))?;

        sqlx::query(
            r#"INSERT INTO workflow_checkpoints
               (run_id, workflow_name, status, definition, context, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id) DO UPDATE SET
                 workflow_name = excluded.workflow_name,
                 status = excluded.status,
                 definition = excluded.definition,
                 context = excluded.context,
                 updated_at = excluded.updated_at"#,
        )
        .bind(record.run_id.to_string())
        .bind(&record.workflow_name)
        .bind(record.status.to_string())
        .bind(&definition_json)
        .bind(&context_json)
        .bind(format_datetime(&record.created_at))
        .bind(format_datetime(&record.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn load(&self, run_id: &Uuid) -> Result<Option<CheckpointRecord>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE run_id = ?"))
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = CheckpointRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_checkpoints WHERE run_id = ?")
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_unfinished(&self) -> Result<Vec<CheckpointRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE status IN (?, ?) ORDER BY updated_at DESC"
        ))
        .bind(RunStatus::Running.to_string())
        .bind(RunStatus::Cancelled.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        collect_records(&rows)
    }

    async fn list(&self) -> Result<Vec<CheckpointRecord>, RepositoryError> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} ORDER BY updated_at DESC"))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        collect_records(&rows)
    }
}
