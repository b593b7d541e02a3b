//! The persistence contract for runs, step status,
//! checkpoints and artifacts.
//!
//! Every status mutation is a single conditional write: the implementation
//! applies it only if the current status is one of the allowed source
//! statuses and returns `Ok(None)` otherwise. That guard is what keeps two
//! concurrent execution requests for the same (run, step) from both
//! reaching `in_progress`.

mod memory;
mod postgres;

pub use memory::MemoryPipelineStore;
pub use postgres::PgPipelineStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::models::{Artifact, NewRun, Run, RunCheckpoint, RunStatus, RunStep, SubjectUpdate};
use crate::pipeline::registry::{StepDefinition, StepName};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt stored data: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Terminal fields written when a step leaves `in_progress`.
#[derive(Debug, Clone)]
pub struct StepOutcomeRecord {
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub artifact_id: Option<Uuid>,
    pub error_message: Option<String>,
}

/// Storage contract for pipeline state.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn PipelineStore>`,
/// and must not serialize writes across different runs.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn create_run(&self, new_run: &NewRun, created_at: DateTime<Utc>) -> StoreResult<Run>;

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<Run>>;

    /// Most recent runs first, optionally restricted to one user.
    async fn list_runs(&self, user_id: Option<Uuid>, limit: i64) -> StoreResult<Vec<Run>>;

    async fn set_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    async fn update_run_subject(&self, run_id: Uuid, update: &SubjectUpdate) -> StoreResult<()>;

    async fn get_step(&self, run_id: Uuid, step: StepName) -> StoreResult<Option<RunStep>>;

    async fn list_steps(&self, run_id: Uuid) -> StoreResult<Vec<RunStep>>;

    /// absent | pending → in_progress. Clears terminal fields from earlier attempts.
    async fn claim_step(
        &self,
        run_id: Uuid,
        definition: &StepDefinition,
        parameters: Option<Value>,
        started_at: DateTime<Utc>,
    ) -> StoreResult<Option<RunStep>>;

    /// in_progress → completed.
    async fn complete_step(
        &self,
        run_id: Uuid,
        step: StepName,
        outcome: &StepOutcomeRecord,
    ) -> StoreResult<Option<RunStep>>;

    /// in_progress → failed.
    async fn fail_step(
        &self,
        run_id: Uuid,
        step: StepName,
        outcome: &StepOutcomeRecord,
    ) -> StoreResult<Option<RunStep>>;

    /// absent | pending | in_progress | failed → skipped.
    async fn skip_step(
        &self,
        run_id: Uuid,
        definition: &StepDefinition,
        skipped_at: DateTime<Utc>,
    ) -> StoreResult<Option<RunStep>>;

    /// failed → pending. Clears timing, artifact and error fields.
    async fn reset_step(&self, run_id: Uuid, step: StepName) -> StoreResult<Option<RunStep>>;

    async fn put_artifact(
        &self,
        run_id: Uuid,
        step: StepName,
        content: Value,
        created_at: DateTime<Utc>,
    ) -> StoreResult<Artifact>;

    async fn get_artifact(&self, artifact_id: Uuid) -> StoreResult<Option<Artifact>>;

    /// Append-only. Re-inserting the same (run, step, completed_at) is a no-op.
    async fn insert_checkpoint(&self, checkpoint: &RunCheckpoint) -> StoreResult<()>;

    async fn latest_checkpoint(&self, run_id: Uuid) -> StoreResult<Option<RunCheckpoint>>;

    /// Oldest first.
    async fn list_checkpoints(&self, run_id: Uuid) -> StoreResult<Vec<RunCheckpoint>>;
}
