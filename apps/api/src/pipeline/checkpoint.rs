//! Checkpoint snapshots, written right after a step completes.
//!
//! Each checkpoint carries the artifact id of every step completed so far,
//! which is all a resumed run needs to feed later executors. Checkpoints are
//! append-only; the latest one supersedes the rest.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::pipeline::models::{RunCheckpoint, RunStep, StepStatus};
use crate::pipeline::registry::StepName;
use crate::pipeline::store::{PipelineStore, StoreResult};

#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn PipelineStore>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    /// Writes a checkpoint for `step`. Safe to retry: a repeat with the same
    /// `completed_at` is dropped by the store.
    pub async fn create_checkpoint(
        &self,
        run_id: Uuid,
        step: StepName,
        completed_at: DateTime<Utc>,
        artifacts: BTreeMap<String, Uuid>,
        metadata: Value,
    ) -> StoreResult<RunCheckpoint> {
        let checkpoint = RunCheckpoint {
            run_id,
            step,
            completed_at,
            artifacts,
            metadata,
        };
        self.store.insert_checkpoint(&checkpoint).await?;
        info!(
            "Checkpoint written for run {run_id} after '{step}' ({} artifacts)",
            checkpoint.artifacts.len()
        );
        Ok(checkpoint)
    }

    pub async fn latest_checkpoint(&self, run_id: Uuid) -> StoreResult<Option<RunCheckpoint>> {
        self.store.latest_checkpoint(run_id).await
    }

    pub async fn history(&self, run_id: Uuid) -> StoreResult<Vec<RunCheckpoint>> {
        self.store.list_checkpoints(run_id).await
    }
}

/// Artifact map over every completed step that produced an artifact.
pub fn artifact_map(steps: &[RunStep]) -> BTreeMap<String, Uuid> {
    steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .filter_map(|s| s.artifact_id.map(|id| (s.step.as_str().to_string(), id)))
        .collect()
}

/// Metadata stored alongside a checkpoint.
pub fn checkpoint_metadata(
    steps: &[RunStep],
    step: StepName,
    duration_ms: i64,
    step_metadata: Value,
) -> Value {
    let completed: Vec<&str> = steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .map(|s| s.step.as_str())
        .collect();
    let skipped: Vec<&str> = steps
        .iter()
        .filter(|s| s.status == StepStatus::Skipped)
        .map(|s| s.step.as_str())
        .collect();

    json!({
        "step": step,
        "duration_ms": duration_ms,
        "completed_steps": completed,
        "skipped_steps": skipped,
        "step_metadata": step_metadata,
    })
}
