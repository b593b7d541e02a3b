//! Postgres-backed [`PipelineStore`].
//!
//! Status transitions are single `INSERT ... ON CONFLICT DO UPDATE ... WHERE`
//! or `UPDATE ... WHERE status = ...` statements with `RETURNING *`; no row
//! back means the guard rejected the write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use super::{PipelineStore, StepOutcomeRecord, StoreError, StoreResult};
use crate::pipeline::models::{
    Artifact, ArtifactRow, NewRun, Run, RunCheckpoint, RunCheckpointRow, RunRow, RunStatus,
    RunStep, RunStepRow, SubjectUpdate,
};
use crate::pipeline::registry::{StepDefinition, StepName};

#[derive(Clone)]
pub struct PgPipelineStore {
    pool: PgPool,
}

impl PgPipelineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn into_step(row: Option<RunStepRow>) -> StoreResult<Option<RunStep>> {
    row.map(RunStep::try_from).transpose()
}

#[async_trait]
impl PipelineStore for PgPipelineStore {
    async fn create_run(&self, new_run: &NewRun, created_at: DateTime<Utc>) -> StoreResult<Run> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            INSERT INTO pipeline_runs
                (id, user_id, company_name, role_title, source_url, job_text, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new_run.user_id)
        .bind(&new_run.company_name)
        .bind(&new_run.role_title)
        .bind(&new_run.source_url)
        .bind(&new_run.job_text)
        .bind(RunStatus::Created.as_str())
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<Run>> {
        sqlx::query_as::<_, RunRow>("SELECT * FROM pipeline_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Run::try_from)
            .transpose()
    }

    async fn list_runs(&self, user_id: Option<Uuid>, limit: i64) -> StoreResult<Vec<Run>> {
        sqlx::query_as::<_, RunRow>(
            r#"
            SELECT * FROM pipeline_runs
            WHERE ($1::uuid IS NULL OR user_id = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Run::try_from)
        .collect()
    }

    async fn set_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE pipeline_runs SET status = $2, completed_at = $3 WHERE id = $1")
            .bind(run_id)
            .bind(status.as_str())
            .bind(completed_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_run_subject(&self, run_id: Uuid, update: &SubjectUpdate) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE pipeline_runs SET
                company_name = COALESCE(NULLIF(TRIM($2), ''), company_name),
                role_title = COALESCE(NULLIF(TRIM($3), ''), role_title),
                source_url = COALESCE(NULLIF(TRIM($4), ''), source_url)
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(&update.company_name)
        .bind(&update.role_title)
        .bind(&update.source_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_step(&self, run_id: Uuid, step: StepName) -> StoreResult<Option<RunStep>> {
        let row = sqlx::query_as::<_, RunStepRow>(
            "SELECT * FROM pipeline_run_steps WHERE run_id = $1 AND step = $2",
        )
        .bind(run_id)
        .bind(step.as_str())
        .fetch_optional(&self.pool)
        .await?;
        into_step(row)
    }

    async fn list_steps(&self, run_id: Uuid) -> StoreResult<Vec<RunStep>> {
        sqlx::query_as::<_, RunStepRow>(
            "SELECT * FROM pipeline_run_steps WHERE run_id = $1 ORDER BY started_at NULLS LAST, step",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(RunStep::try_from)
        .collect()
    }

    async fn claim_step(
        &self,
        run_id: Uuid,
        definition: &StepDefinition,
        parameters: Option<Value>,
        started_at: DateTime<Utc>,
    ) -> StoreResult<Option<RunStep>> {
        let row = sqlx::query_as::<_, RunStepRow>(
            r#"
            INSERT INTO pipeline_run_steps (run_id, step, category, status, started_at, parameters)
            VALUES ($1, $2, $3, 'in_progress', $4, $5)
            ON CONFLICT (run_id, step) DO UPDATE SET
                status = 'in_progress',
                started_at = EXCLUDED.started_at,
                completed_at = NULL,
                duration_ms = NULL,
                artifact_id = NULL,
                error_message = NULL,
                parameters = EXCLUDED.parameters
            WHERE pipeline_run_steps.status = 'pending'
            RETURNING *
            "#,
        )
        .bind(run_id)
        .bind(definition.name.as_str())
        .bind(definition.category.as_str())
        .bind(started_at)
        .bind(parameters)
        .fetch_optional(&self.pool)
        .await?;
        into_step(row)
    }

    async fn complete_step(
        &self,
        run_id: Uuid,
        step: StepName,
        outcome: &StepOutcomeRecord,
    ) -> StoreResult<Option<RunStep>> {
        let row = sqlx::query_as::<_, RunStepRow>(
            r#"
            UPDATE pipeline_run_steps SET
                status = 'completed',
                completed_at = $3,
                duration_ms = $4,
                artifact_id = $5,
                error_message = NULL
            WHERE run_id = $1 AND step = $2 AND status = 'in_progress'
            RETURNING *
            "#,
        )
        .bind(run_id)
        .bind(step.as_str())
        .bind(outcome.completed_at)
        .bind(outcome.duration_ms)
        .bind(outcome.artifact_id)
        .fetch_optional(&self.pool)
        .await?;
        into_step(row)
    }

    async fn fail_step(
        &self,
        run_id: Uuid,
        step: StepName,
        outcome: &StepOutcomeRecord,
    ) -> StoreResult<Option<RunStep>> {
        let row = sqlx::query_as::<_, RunStepRow>(
            r#"
            UPDATE pipeline_run_steps SET
                status = 'failed',
                completed_at = $3,
                duration_ms = $4,
                error_message = $5
            WHERE run_id = $1 AND step = $2 AND status = 'in_progress'
            RETURNING *
            "#,
        )
        .bind(run_id)
        .bind(step.as_str())
        .bind(outcome.completed_at)
        .bind(outcome.duration_ms)
        .bind(&outcome.error_message)
        .fetch_optional(&self.pool)
        .await?;
        into_step(row)
    }

    async fn skip_step(
        &self,
        run_id: Uuid,
        definition: &StepDefinition,
        skipped_at: DateTime<Utc>,
    ) -> StoreResult<Option<RunStep>> {
        let row = sqlx::query_as::<_, RunStepRow>(
            r#"
            INSERT INTO pipeline_run_steps (run_id, step, category, status, completed_at)
            VALUES ($1, $2, $3, 'skipped', $4)
            ON CONFLICT (run_id, step) DO UPDATE SET
                status = 'skipped',
                completed_at = EXCLUDED.completed_at
            WHERE pipeline_run_steps.status IN ('pending', 'in_progress', 'failed')
            RETURNING *
            "#,
        )
        .bind(run_id)
        .bind(definition.name.as_str())
        .bind(definition.category.as_str())
        .bind(skipped_at)
        .fetch_optional(&self.pool)
        .await?;
        into_step(row)
    }

    async fn reset_step(&self, run_id: Uuid, step: StepName) -> StoreResult<Option<RunStep>> {
        let row = sqlx::query_as::<_, RunStepRow>(
            r#"
            UPDATE pipeline_run_steps SET
                status = 'pending',
                started_at = NULL,
                completed_at = NULL,
                duration_ms = NULL,
                artifact_id = NULL,
                error_message = NULL
            WHERE run_id = $1 AND step = $2 AND status = 'failed'
            RETURNING *
            "#,
        )
        .bind(run_id)
        .bind(step.as_str())
        .fetch_optional(&self.pool)
        .await?;
        into_step(row)
    }

    async fn put_artifact(
        &self,
        run_id: Uuid,
        step: StepName,
        content: Value,
        created_at: DateTime<Utc>,
    ) -> StoreResult<Artifact> {
        let row = sqlx::query_as::<_, ArtifactRow>(
            r#"
            INSERT INTO pipeline_artifacts (id, run_id, step, content, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(step.as_str())
        .bind(content)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_artifact(&self, artifact_id: Uuid) -> StoreResult<Option<Artifact>> {
        sqlx::query_as::<_, ArtifactRow>("SELECT * FROM pipeline_artifacts WHERE id = $1")
            .bind(artifact_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Artifact::try_from)
            .transpose()
    }

    async fn insert_checkpoint(&self, checkpoint: &RunCheckpoint) -> StoreResult<()> {
        let artifacts = serde_json::to_value(&checkpoint.artifacts)?;
        sqlx::query(
            r#"
            INSERT INTO pipeline_run_checkpoints (run_id, step, completed_at, artifacts, metadata)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (run_id, step, completed_at) DO NOTHING
            "#,
        )
        .bind(checkpoint.run_id)
        .bind(checkpoint.step.as_str())
        .bind(checkpoint.completed_at)
        .bind(artifacts)
        .bind(&checkpoint.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_checkpoint(&self, run_id: Uuid) -> StoreResult<Option<RunCheckpoint>> {
        sqlx::query_as::<_, RunCheckpointRow>(
            r#"
            SELECT run_id, step, completed_at, artifacts, metadata
            FROM pipeline_run_checkpoints
            WHERE run_id = $1
            ORDER BY completed_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?
        .map(RunCheckpoint::try_from)
        .transpose()
    }

    async fn list_checkpoints(&self, run_id: Uuid) -> StoreResult<Vec<RunCheckpoint>> {
        sqlx::query_as::<_, RunCheckpointRow>(
            r#"
            SELECT run_id, step, completed_at, artifacts, metadata
            FROM pipeline_run_checkpoints
            WHERE run_id = $1
            ORDER BY completed_at ASC, id ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(RunCheckpoint::try_from)
        .collect::<Result<Vec<_>, StoreError>>()
    }
}
