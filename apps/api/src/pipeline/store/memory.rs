//! In-process [`PipelineStore`] backed by `DashMap`.
//!
//! Step rows are grouped per run, so the per-key entry lock that guards a
//! status transition only ever contends with writers to the same run.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use super::{PipelineStore, StepOutcomeRecord, StoreResult};
use crate::pipeline::models::{
    Artifact, NewRun, Run, RunCheckpoint, RunStatus, RunStep, StepStatus, SubjectUpdate,
};
use crate::pipeline::registry::{StepDefinition, StepName};

#[derive(Default)]
pub struct MemoryPipelineStore {
    runs: DashMap<Uuid, Run>,
    steps: DashMap<Uuid, BTreeMap<StepName, RunStep>>,
    checkpoints: DashMap<Uuid, Vec<RunCheckpoint>>,
    artifacts: DashMap<Uuid, Artifact>,
}

impl MemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `apply` to the (run, step) row if its current status (or
    /// absence, when `create` is given) passes `allowed`. Runs under the
    /// run's entry lock.
    fn transition(
        &self,
        run_id: Uuid,
        step: StepName,
        allowed: &[StepStatus],
        create: Option<&StepDefinition>,
        apply: impl FnOnce(&mut RunStep),
    ) -> Option<RunStep> {
        let mut run_steps = self.steps.entry(run_id).or_default();
        match run_steps.get_mut(&step) {
            Some(existing) if allowed.contains(&existing.status) => {
                apply(existing);
                Some(existing.clone())
            }
            Some(_) => None,
            None => {
                let definition = create?;
                let mut row = RunStep {
                    run_id,
                    step,
                    category: definition.category,
                    status: StepStatus::Pending,
                    started_at: None,
                    completed_at: None,
                    duration_ms: None,
                    artifact_id: None,
                    error_message: None,
                    parameters: None,
                };
                apply(&mut row);
                run_steps.insert(step, row.clone());
                Some(row)
            }
        }
    }
}

#[async_trait]
impl PipelineStore for MemoryPipelineStore {
    async fn create_run(&self, new_run: &NewRun, created_at: DateTime<Utc>) -> StoreResult<Run> {
        let run = Run {
            id: Uuid::new_v4(),
            user_id: new_run.user_id,
            company_name: new_run.company_name.clone(),
            role_title: new_run.role_title.clone(),
            source_url: new_run.source_url.clone(),
            job_text: new_run.job_text.clone(),
            status: RunStatus::Created,
            created_at,
            completed_at: None,
        };
        self.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<Run>> {
        Ok(self.runs.get(&run_id).map(|r| r.clone()))
    }

    async fn list_runs(&self, user_id: Option<Uuid>, limit: i64) -> StoreResult<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .runs
            .iter()
            .filter(|r| user_id.map_or(true, |u| r.user_id == Some(u)))
            .map(|r| r.clone())
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit.max(0) as usize);
        Ok(runs)
    }

    async fn set_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        if let Some(mut run) = self.runs.get_mut(&run_id) {
            run.status = status;
            run.completed_at = completed_at;
        }
        Ok(())
    }

    async fn update_run_subject(&self, run_id: Uuid, update: &SubjectUpdate) -> StoreResult<()> {
        if let Some(mut run) = self.runs.get_mut(&run_id) {
            run.apply_subject(update);
        }
        Ok(())
    }

    async fn get_step(&self, run_id: Uuid, step: StepName) -> StoreResult<Option<RunStep>> {
        Ok(self
            .steps
            .get(&run_id)
            .and_then(|steps| steps.get(&step).cloned()))
    }

    async fn list_steps(&self, run_id: Uuid) -> StoreResult<Vec<RunStep>> {
        Ok(self
            .steps
            .get(&run_id)
            .map(|steps| steps.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn claim_step(
        &self,
        run_id: Uuid,
        definition: &StepDefinition,
        parameters: Option<Value>,
        started_at: DateTime<Utc>,
    ) -> StoreResult<Option<RunStep>> {
        Ok(self.transition(
            run_id,
            definition.name,
            &[StepStatus::Pending],
            Some(definition),
            |row| {
                row.status = StepStatus::InProgress;
                row.started_at = Some(started_at);
                row.completed_at = None;
                row.duration_ms = None;
                row.artifact_id = None;
                row.error_message = None;
                row.parameters = parameters;
            },
        ))
    }

    async fn complete_step(
        &self,
        run_id: Uuid,
        step: StepName,
        outcome: &StepOutcomeRecord,
    ) -> StoreResult<Option<RunStep>> {
        Ok(self.transition(run_id, step, &[StepStatus::InProgress], None, |row| {
            row.status = StepStatus::Completed;
            row.completed_at = Some(outcome.completed_at);
            row.duration_ms = Some(outcome.duration_ms);
            row.artifact_id = outcome.artifact_id;
            row.error_message = None;
        }))
    }

    async fn fail_step(
        &self,
        run_id: Uuid,
        step: StepName,
        outcome: &StepOutcomeRecord,
    ) -> StoreResult<Option<RunStep>> {
        Ok(self.transition(run_id, step, &[StepStatus::InProgress], None, |row| {
            row.status = StepStatus::Failed;
            row.completed_at = Some(outcome.completed_at);
            row.duration_ms = Some(outcome.duration_ms);
            row.error_message = outcome.error_message.clone();
        }))
    }

    async fn skip_step(
        &self,
        run_id: Uuid,
        definition: &StepDefinition,
        skipped_at: DateTime<Utc>,
    ) -> StoreResult<Option<RunStep>> {
        Ok(self.transition(
            run_id,
            definition.name,
            &[StepStatus::Pending, StepStatus::InProgress, StepStatus::Failed],
            Some(definition),
            |row| {
                row.status = StepStatus::Skipped;
                row.completed_at = Some(skipped_at);
            },
        ))
    }

    async fn reset_step(&self, run_id: Uuid, step: StepName) -> StoreResult<Option<RunStep>> {
        Ok(self.transition(run_id, step, &[StepStatus::Failed], None, |row| {
            row.status = StepStatus::Pending;
            row.started_at = None;
            row.completed_at = None;
            row.duration_ms = None;
            row.artifact_id = None;
            row.error_message = None;
        }))
    }

    async fn put_artifact(
        &self,
        run_id: Uuid,
        step: StepName,
        content: Value,
        created_at: DateTime<Utc>,
    ) -> StoreResult<Artifact> {
        let artifact = Artifact {
            id: Uuid::new_v4(),
            run_id,
            step,
            content,
            created_at,
        };
        self.artifacts.insert(artifact.id, artifact.clone());
        Ok(artifact)
    }

    async fn get_artifact(&self, artifact_id: Uuid) -> StoreResult<Option<Artifact>> {
        Ok(self.artifacts.get(&artifact_id).map(|a| a.clone()))
    }

    async fn insert_checkpoint(&self, checkpoint: &RunCheckpoint) -> StoreResult<()> {
        let mut checkpoints = self.checkpoints.entry(checkpoint.run_id).or_default();
        let duplicate = checkpoints
            .iter()
            .any(|c| c.step == checkpoint.step && c.completed_at == checkpoint.completed_at);
        if !duplicate {
            checkpoints.push(checkpoint.clone());
        }
        Ok(())
    }

    async fn latest_checkpoint(&self, run_id: Uuid) -> StoreResult<Option<RunCheckpoint>> {
        Ok(self.checkpoints.get(&run_id).and_then(|checkpoints| {
            checkpoints
                .iter()
                .enumerate()
                .max_by_key(|(i, c)| (c.completed_at, *i))
                .map(|(_, c)| c.clone())
        }))
    }

    async fn list_checkpoints(&self, run_id: Uuid) -> StoreResult<Vec<RunCheckpoint>> {
        let mut checkpoints = self
            .checkpoints
            .get(&run_id)
            .map(|c| c.clone())
            .unwrap_or_default();
        checkpoints.sort_by_key(|c| c.completed_at);
        Ok(checkpoints)
    }
}
