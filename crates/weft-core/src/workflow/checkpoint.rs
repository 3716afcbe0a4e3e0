//! Durable checkpoints of run state.
//!
//! After every applied step transition the scheduler saves a
//! [`CheckpointRecord`]: the full execution context plus the definition the
//! run executes, so a run can be resumed by id alone. The storage interface
//! is the [`CheckpointStore`] trait; the infrastructure layer implements it
//! with SQLite, and [`InMemoryCheckpointStore`] serves tests and ephemeral
//! engines.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use weft_types::error::RepositoryError;
use weft_types::workflow::{RunStatus, WorkflowDefinition};

use super::context::ExecutionContext;

/// Persisted snapshot of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub status: RunStatus,
    pub definition: WorkflowDefinition,
    pub context: ExecutionContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Storage interface for run checkpoints.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait CheckpointStore: Send + Sync {
    /// Upsert the checkpoint for `record.run_id`. `created_at` of an existing
    /// record is preserved.
    fn save(
        &self,
        record: &CheckpointRecord,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn load(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Option<CheckpointRecord>, RepositoryError>> + Send;

    /// Delete a checkpoint. Returns `true` if it existed.
    fn delete(&self, run_id: &Uuid) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Checkpoints of runs that can be resumed (`Running` or `Cancelled`).
    fn list_unfinished(
        &self,
    ) -> impl Future<Output = Result<Vec<CheckpointRecord>, RepositoryError>> + Send;

    /// Every checkpoint, most recently updated first.
    fn list(&self) -> impl Future<Output = Result<Vec<CheckpointRecord>, RepositoryError>> + Send;
}

impl<T: CheckpointStore> CheckpointStore for Arc<T> {
    fn save(
        &self,
        record: &CheckpointRecord,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send {
        self.as_ref().save(record)
    }

    fn load(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Option<CheckpointRecord>, RepositoryError>> + Send {
        self.as_ref().load(run_id)
    }

    fn delete(&self, run_id: &Uuid) -> impl Future<Output = Result<bool, RepositoryError>> + Send {
        self.as_ref().delete(run_id)
    }

    fn list_unfinished(
        &self,
    ) -> impl Future<Output = Result<Vec<CheckpointRecord>, RepositoryError>> + Send {
        self.as_ref().list_unfinished()
    }

    fn list(&self) -> impl Future<Output = Result<Vec<CheckpointRecord>, RepositoryError>> + Send {
        self.as_ref().list()
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local checkpoint store.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    records: DashMap<Uuid, CheckpointRecord>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, record: &CheckpointRecord) -> Result<(), RepositoryError> {
        let mut record = record.clone();
        if let Some(existing) = self.records.get(&record.run_id) {
            record.created_at = existing.created_at;
        }
        self.records.insert(record.run_id, record);
        Ok(())
    }

    async fn load(&self, run_id: &Uuid) -> Result<Option<CheckpointRecord>, RepositoryError> {
        Ok(self.records.get(run_id).map(|r| r.clone()))
    }

    async fn delete(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.records.remove(run_id).is_some())
    }

    async fn list_unfinished(&self) -> Result<Vec<CheckpointRecord>, RepositoryError> {
        let mut records: Vec<CheckpointRecord> = self
            .records
            .iter()
            .filter(|r| !r.status.is_final())
            .map(|r| r.clone())
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }

    async fn list(&self) -> Result<Vec<CheckpointRecord>, RepositoryError> {
        let mut records: Vec<CheckpointRecord> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Higher-level checkpoint API used by the scheduler and the engine.
pub struct CheckpointManager<S: CheckpointStore> {
    store: S,
}

impl<S: CheckpointStore> CheckpointManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Persist the current state of a run.
    pub async fn checkpoint(
        &self,
        definition: &WorkflowDefinition,
        ctx: &ExecutionContext,
    ) -> Result<(), CheckpointError> {
        let record = CheckpointRecord {
            run_id: ctx.run_id,
            workflow_name: ctx.workflow_name.clone(),
            status: ctx.status,
            definition: definition.clone(),
            context: ctx.clone(),
            created_at: ctx.started_at,
            updated_at: ctx.updated_at,
        };
        self.store
            .save(&record)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            run_id = %ctx.run_id,
            version = ctx.version,
            status = %ctx.status,
            "checkpointed run"
        );
        Ok(())
    }

    /// Load the checkpoint of a run, failing if there is none.
    pub async fn restore(&self, run_id: Uuid) -> Result<CheckpointRecord, CheckpointError> {
        self.find(run_id)
            .await?
            .ok_or(CheckpointError::RunNotFound(run_id))
    }

    pub async fn find(&self, run_id: Uuid) -> Result<Option<CheckpointRecord>, CheckpointError> {
        self.store
            .load(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    pub async fn discard(&self, run_id: Uuid) -> Result<bool, CheckpointError> {
        let existed = self
            .store
            .delete(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        tracing::debug!(run_id = %run_id, existed, "discarded checkpoint");
        Ok(existed)
    }

    pub async fn unfinished(&self) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        self.store
            .list_unfinished()
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    pub async fn all(&self) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        self.store
            .list()
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }
}

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),
}
