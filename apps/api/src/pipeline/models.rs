//! Run, RunStep, RunCheckpoint and Artifact records, plus the status enums
//! that drive the step state machine.
//!
//! `*Row` types mirror the Postgres tables (string-typed status columns);
//! the domain types above them are what the rest of the pipeline works with.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::pipeline::registry::{StepCategory, StepName};
use crate::pipeline::store::StoreError;

// ────────────────────────────────────────────────────────────────────────────
// Status enums
// ────────────────────────────────────────────────────────────────────────────

/// Persisted status of a RunStep. "Blocked" and "available" are derived
/// display states and deliberately absent here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    /// Legal transitions of the step state machine.
    ///
    /// pending → in_progress → {completed, failed}; failed → pending (retry);
    /// {pending, in_progress, failed} → skipped.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Failed, Pending)
                | (Pending, Skipped)
                | (InProgress, Skipped)
                | (Failed, Skipped)
        )
    }

    /// Statuses that count as satisfied for a dependent step.
    /// Skipped prerequisites unblock dependents: skipping a branch means
    /// "proceed without its output".
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "in_progress" => Ok(StepStatus::InProgress),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(StoreError::Corrupt(format!("unknown step status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(RunStatus::Created),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(StoreError::Corrupt(format!("unknown run status '{other}'"))),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Domain records
// ────────────────────────────────────────────────────────────────────────────

/// Subject input accepted when a run is created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRun {
    pub user_id: Option<Uuid>,
    pub source_url: Option<String>,
    pub job_text: Option<String>,
    pub company_name: Option<String>,
    pub role_title: Option<String>,
}

/// Subject metadata learned by a step. Only `Some`, non-blank fields are applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubjectUpdate {
    pub company_name: Option<String>,
    pub role_title: Option<String>,
    pub source_url: Option<String>,
}

impl SubjectUpdate {
    pub fn is_empty(&self) -> bool {
        [&self.company_name, &self.role_title, &self.source_url]
            .iter()
            .all(|f| f.as_deref().map_or(true, |s| s.trim().is_empty()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub company_name: Option<String>,
    pub role_title: Option<String>,
    pub source_url: Option<String>,
    #[serde(skip_serializing)]
    pub job_text: Option<String>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn apply_subject(&mut self, update: &SubjectUpdate) {
        fn set(field: &mut Option<String>, value: &Option<String>) {
            if let Some(v) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                *field = Some(v.to_string());
            }
        }
        set(&mut self.company_name, &update.company_name);
        set(&mut self.role_title, &update.role_title);
        set(&mut self.source_url, &update.source_url);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStep {
    pub run_id: Uuid,
    pub step: StepName,
    pub category: StepCategory,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub artifact_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunCheckpoint {
    pub run_id: Uuid,
    pub step: StepName,
    pub completed_at: DateTime<Utc>,
    /// step name → artifact id, for every step completed at checkpoint time
    pub artifacts: BTreeMap<String, Uuid>,
    pub metadata: Value,
}

impl RunCheckpoint {
    /// Completed steps recorded in this checkpoint's artifact map.
    pub fn completed_steps(&self) -> Vec<StepName> {
        self.artifacts
            .keys()
            .filter_map(|k| k.parse::<StepName>().ok())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step: StepName,
    pub content: Value,
    pub created_at: DateTime<Utc>,
}

// ────────────────────────────────────────────────────────────────────────────
// Table rows
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, FromRow)]
pub struct RunRow {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub company_name: Option<String>,
    pub role_title: Option<String>,
    pub source_url: Option<String>,
    pub job_text: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<RunRow> for Run {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(Run {
            id: row.id,
            user_id: row.user_id,
            company_name: row.company_name,
            role_title: row.role_title,
            source_url: row.source_url,
            job_text: row.job_text,
            status: row.status.parse()?,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct RunStepRow {
    pub run_id: Uuid,
    pub step: String,
    pub category: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub artifact_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub parameters: Option<Value>,
}

impl TryFrom<RunStepRow> for RunStep {
    type Error = StoreError;

    fn try_from(row: RunStepRow) -> Result<Self, Self::Error> {
        Ok(RunStep {
            run_id: row.run_id,
            step: row
                .step
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("{e}")))?,
            category: row.category.parse().map_err(StoreError::Corrupt)?,
            status: row.status.parse()?,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
            artifact_id: row.artifact_id,
            error_message: row.error_message,
            parameters: row.parameters,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct RunCheckpointRow {
    pub run_id: Uuid,
    pub step: String,
    pub completed_at: DateTime<Utc>,
    pub artifacts: Value,
    pub metadata: Value,
}

impl TryFrom<RunCheckpointRow> for RunCheckpoint {
    type Error = StoreError;

    fn try_from(row: RunCheckpointRow) -> Result<Self, Self::Error> {
        Ok(RunCheckpoint {
            run_id: row.run_id,
            step: row
                .step
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("{e}")))?,
            completed_at: row.completed_at,
            artifacts: serde_json::from_value(row.artifacts)?,
            metadata: row.metadata,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ArtifactRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step: String,
    pub content: Value,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ArtifactRow> for Artifact {
    type Error = StoreError;

    fn try_from(row: ArtifactRow) -> Result<Self, Self::Error> {
        Ok(Artifact {
            id: row.id,
            run_id: row.run_id,
            step: row
                .step
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("{e}")))?,
            content: row.content,
            created_at: row.created_at,
        })
    }
}
