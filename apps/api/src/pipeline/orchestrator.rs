//! The control loop that ties the registry, resolver, store, checkpoints,
//! executors and progress events together.
//!
//! Flow for one step: look up run → conflict check → dependency check →
//! claim (CAS to in_progress) → executor → completed + checkpoint, or failed.
//! No lock is held while an executor runs; only the claim and the terminal
//! write are guarded, and both are single conditional writes in the store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::pipeline::cancel::CancellationToken;
use crate::pipeline::checkpoint::{artifact_map, checkpoint_metadata, CheckpointManager};
use crate::pipeline::errors::PipelineError;
use crate::pipeline::events::{ProgressEmitter, ProgressReceiver};
use crate::pipeline::executor::{ExecutorRegistry, StepContext};
use crate::pipeline::models::{NewRun, Run, RunCheckpoint, RunStatus, RunStep, StepStatus};
use crate::pipeline::registry::{StepDefinition, StepName, StepRegistry};
use crate::pipeline::resolver::{
    summarize_by_category, CategorySummary, DependencyResolver, StepAvailability, StepStatuses,
    StepView, ValidationError,
};
use crate::pipeline::store::{PipelineStore, StepOutcomeRecord};

// ────────────────────────────────────────────────────────────────────────────
// Clock
// ────────────────────────────────────────────────────────────────────────────

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Results
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointSummary {
    pub step: StepName,
    pub completed_at: DateTime<Utc>,
    pub completed_steps: Vec<StepName>,
    pub artifact_count: usize,
}

impl From<&RunCheckpoint> for CheckpointSummary {
    fn from(checkpoint: &RunCheckpoint) -> Self {
        Self {
            step: checkpoint.step,
            completed_at: checkpoint.completed_at,
            completed_steps: checkpoint.completed_steps(),
            artifact_count: checkpoint.artifacts.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepExecution {
    pub step: RunStep,
    pub duration_ms: i64,
    pub artifact_id: Option<Uuid>,
    pub next_available: Vec<StepName>,
    pub checkpoint: CheckpointSummary,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunOptions {
    /// Upper bound on steps executed by one call. Falls back to the
    /// orchestrator's configured default.
    pub max_steps: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every step is completed or skipped.
    Finished,
    /// A step failed; the run is halted at that step.
    StepFailed,
    /// The per-call step bound was reached.
    StepLimit,
    /// Nothing is available but the run is not finished.
    Stalled,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedStep {
    pub step: StepName,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub stop_reason: StopReason,
    pub executed: Vec<StepName>,
    pub failed_step: Option<FailedStep>,
    pub next_available: Vec<StepName>,
    pub blocked: Vec<StepName>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResumePlan {
    pub run_id: Uuid,
    pub latest_checkpoint: Option<CheckpointSummary>,
    pub completed: Vec<StepName>,
    pub available: Vec<StepName>,
    pub blocked: Vec<StepName>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResumeOutcome {
    pub plan: ResumePlan,
    pub outcome: Option<RunOutcome>,
}

#[derive(Debug, Clone, Copy)]
pub enum ResumeMode {
    PlanOnly,
    Execute(RunOptions),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOverview {
    pub run: Run,
    #[serde(flatten)]
    pub availability: StepAvailability,
    pub steps: Vec<StepView>,
    pub summary: std::collections::BTreeMap<String, CategorySummary>,
    pub active: bool,
}

/// A background execution started by [`Orchestrator::spawn_run`].
pub struct RunHandle {
    pub run_id: Uuid,
    pub events: ProgressReceiver,
    pub cancel: CancellationToken,
    pub task: JoinHandle<Result<RunOutcome, PipelineError>>,
}

struct ActiveRun {
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

/// Holds a run's slot in the active map; the slot is released on drop, so a
/// panicking executor cannot leave the run marked active.
struct ActiveGuard {
    active: Arc<DashMap<Uuid, ActiveRun>>,
    run_id: Uuid,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.remove(&self.run_id);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<StepRegistry>,
    resolver: DependencyResolver,
    executors: Arc<ExecutorRegistry>,
    store: Arc<dyn PipelineStore>,
    checkpoints: CheckpointManager,
    clock: Arc<dyn Clock>,
    active: Arc<DashMap<Uuid, ActiveRun>>,
    default_max_steps: usize,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<StepRegistry>,
        executors: ExecutorRegistry,
        store: Arc<dyn PipelineStore>,
        clock: Arc<dyn Clock>,
        default_max_steps: usize,
    ) -> Self {
        Self {
            resolver: DependencyResolver::new(registry.clone()),
            registry,
            executors: Arc::new(executors),
            checkpoints: CheckpointManager::new(store.clone()),
            store,
            clock,
            active: Arc::new(DashMap::new()),
            default_max_steps: default_max_steps.max(1),
        }
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    fn lookup(&self, step: &str) -> Result<&StepDefinition, PipelineError> {
        self.registry
            .lookup_str(step)
            .ok_or_else(|| PipelineError::UnknownStep(step.to_string()))
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Run, PipelineError> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or(PipelineError::RunNotFound(run_id))
    }

    async fn statuses(&self, run_id: Uuid) -> Result<(Vec<RunStep>, StepStatuses), PipelineError> {
        let steps = self.store.list_steps(run_id).await?;
        let statuses = StepStatuses::from_steps(&steps);
        Ok((steps, statuses))
    }

    /// Marks the run completed once every step is completed or skipped.
    /// A run that is already completed keeps its original `completed_at`.
    async fn complete_run_if_finished(
        &self,
        run_id: Uuid,
        statuses: &StepStatuses,
    ) -> Result<bool, PipelineError> {
        if !self.resolver.is_finished(statuses) {
            return Ok(false);
        }
        if self.get_run(run_id).await?.status != RunStatus::Completed {
            self.store
                .set_run_status(run_id, RunStatus::Completed, Some(self.clock.now()))
                .await?;
            info!("Run {run_id}: every step completed or skipped; run completed");
        }
        Ok(true)
    }

    // ── Runs ────────────────────────────────────────────────────────────────

    /// Allocates a run with no step rows; zero-dependency steps are
    /// immediately available.
    pub async fn create_run(&self, new_run: NewRun) -> Result<RunOverview, PipelineError> {
        let run = self.store.create_run(&new_run, self.clock.now()).await?;
        info!(
            "Created run {} (user: {:?}, source: {:?})",
            run.id, run.user_id, run.source_url
        );
        self.overview(run.id).await
    }

    pub async fn list_runs(&self, user_id: Option<Uuid>, limit: i64) -> Result<Vec<Run>, PipelineError> {
        Ok(self.store.list_runs(user_id, limit.clamp(1, 200)).await?)
    }

    pub async fn overview(&self, run_id: Uuid) -> Result<RunOverview, PipelineError> {
        let run = self.get_run(run_id).await?;
        let (steps, statuses) = self.statuses(run_id).await?;
        let views = self.resolver.step_views(&steps);
        Ok(RunOverview {
            run,
            availability: self.resolver.classify(&statuses),
            summary: summarize_by_category(&views),
            steps: views,
            active: self.active.contains_key(&run_id),
        })
    }

    pub async fn step_view(&self, run_id: Uuid, step: &str) -> Result<StepView, PipelineError> {
        let definition = self.lookup(step)?;
        self.get_run(run_id).await?;
        let (steps, _) = self.statuses(run_id).await?;
        self.resolver
            .step_views(&steps)
            .into_iter()
            .find(|v| v.step == definition.name)
            .ok_or_else(|| PipelineError::UnknownStep(step.to_string()))
    }

    // ── Single step ─────────────────────────────────────────────────────────

    /// Executes one step on demand. Progress events are logged but not streamed.
    pub async fn execute_step(
        &self,
        run_id: Uuid,
        step: &str,
        parameters: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<StepExecution, PipelineError> {
        let emitter = ProgressEmitter::detached(run_id);
        self.execute_step_with(run_id, step, parameters, cancel, &emitter)
            .await
    }

    async fn execute_step_with(
        &self,
        run_id: Uuid,
        step: &str,
        parameters: Option<Value>,
        cancel: &CancellationToken,
        emitter: &ProgressEmitter,
    ) -> Result<StepExecution, PipelineError> {
        let run = self.get_run(run_id).await?;
        let definition = self.lookup(step)?.clone();
        let name = definition.name;
        let executor = self
            .executors
            .get(name)
            .ok_or_else(|| PipelineError::UnknownStep(step.to_string()))?;

        let (steps, statuses) = self.statuses(run_id).await?;
        if let Some(current) = statuses.get(name).filter(|s| *s != StepStatus::Pending) {
            return Err(PipelineError::Conflict {
                step: name,
                current: Some(current),
            });
        }

        match self.resolver.validate_dependencies(&statuses, step) {
            Ok(_) => {}
            Err(ValidationError::UnknownStep(s)) => return Err(PipelineError::UnknownStep(s)),
            Err(ValidationError::Dependencies(error)) => {
                return Err(PipelineError::DependenciesNotMet {
                    error,
                    available: self.resolver.available_steps(&statuses),
                });
            }
        }

        let started_at = self.clock.now();
        let claimed = self
            .store
            .claim_step(run_id, &definition, parameters.clone(), started_at)
            .await?;
        if claimed.is_none() {
            let current = self.store.get_step(run_id, name).await?.map(|s| s.status);
            return Err(PipelineError::Conflict { step: name, current });
        }

        if run.status == RunStatus::Created {
            self.store
                .set_run_status(run_id, RunStatus::Running, None)
                .await?;
        }

        info!("Run {run_id}: step '{name}' started");
        emitter.step_started(&definition);

        let ctx = StepContext::new(run, name, parameters, artifact_map(&steps), self.store.clone());
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Run {run_id}: step '{name}' cancelled; left in_progress");
                return Err(PipelineError::Cancelled { step: Some(name) });
            }
            result = executor.execute(&ctx) => result,
        };

        let completed_at = self.clock.now();
        let duration_ms = (completed_at - started_at).num_milliseconds().max(0);

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                let message = err.to_string();
                let outcome = StepOutcomeRecord {
                    completed_at,
                    duration_ms,
                    artifact_id: None,
                    error_message: Some(message.clone()),
                };
                if self.store.fail_step(run_id, name, &outcome).await?.is_none() {
                    warn!("Run {run_id}: step '{name}' left in_progress before its failure was recorded");
                }
                warn!("Run {run_id}: step '{name}' failed after {duration_ms}ms: {message}");
                emitter.step_failed(&definition, &message);
                return Err(PipelineError::Execution { step: name, message });
            }
        };

        let artifact = self
            .store
            .put_artifact(run_id, name, output.content, completed_at)
            .await?;
        let outcome = StepOutcomeRecord {
            completed_at,
            duration_ms,
            artifact_id: Some(artifact.id),
            error_message: None,
        };
        let Some(step_row) = self.store.complete_step(run_id, name, &outcome).await? else {
            let current = self.store.get_step(run_id, name).await?.map(|s| s.status);
            return Err(PipelineError::Conflict { step: name, current });
        };

        if let Some(subject) = output.subject.filter(|s| !s.is_empty()) {
            self.store.update_run_subject(run_id, &subject).await?;
        }

        let (steps, statuses) = self.statuses(run_id).await?;
        let checkpoint = self
            .checkpoints
            .create_checkpoint(
                run_id,
                name,
                completed_at,
                artifact_map(&steps),
                checkpoint_metadata(&steps, name, duration_ms, output.metadata),
            )
            .await?;
        let next_available = self.resolver.available_steps(&statuses);

        info!("Run {run_id}: step '{name}' completed in {duration_ms}ms; next: {next_available:?}");
        emitter.step_completed(&definition, duration_ms);
        self.complete_run_if_finished(run_id, &statuses).await?;

        Ok(StepExecution {
            step: step_row,
            duration_ms,
            artifact_id: Some(artifact.id),
            next_available,
            checkpoint: CheckpointSummary::from(&checkpoint),
        })
    }

    // ── Whole run ───────────────────────────────────────────────────────────

    /// Executes available steps one at a time, in registry order, until the
    /// run finishes, stalls, hits the step bound, or a step fails. A failure
    /// halts the run and marks it `failed`.
    pub async fn run_to_completion(
        &self,
        run_id: Uuid,
        options: RunOptions,
        cancel: &CancellationToken,
        emitter: &ProgressEmitter,
    ) -> Result<RunOutcome, PipelineError> {
        match self.drive(run_id, options, cancel, emitter).await {
            Ok(outcome) => {
                emitter.run_completed(
                    outcome.status,
                    format!(
                        "Run {} after {} step(s) ({:?})",
                        outcome.status,
                        outcome.executed.len(),
                        outcome.stop_reason
                    ),
                );
                Ok(outcome)
            }
            Err(err) => {
                let status = match self.store.get_run(run_id).await {
                    Ok(Some(run)) => run.status,
                    _ => RunStatus::Failed,
                };
                emitter.run_completed(status, format!("Run interrupted: {err}"));
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        run_id: Uuid,
        options: RunOptions,
        cancel: &CancellationToken,
        emitter: &ProgressEmitter,
    ) -> Result<RunOutcome, PipelineError> {
        let run = self.get_run(run_id).await?;
        let limit = options.max_steps.unwrap_or(self.default_max_steps);

        if matches!(run.status, RunStatus::Failed | RunStatus::Completed) {
            return self.settled_outcome(&run).await;
        }

        info!("Run {run_id}: driving to completion (max {limit} steps)");
        emitter.run_started(format!("Run {run_id} started"));
        if run.status == RunStatus::Created {
            self.store
                .set_run_status(run_id, RunStatus::Running, None)
                .await?;
        }

        let mut executed = Vec::new();
        let mut failed_step = None;
        let stop_reason = loop {
            let (_, statuses) = self.statuses(run_id).await?;
            if self.resolver.is_finished(&statuses) {
                break StopReason::Finished;
            }
            let Some(next) = self.resolver.available_steps(&statuses).first().copied() else {
                break StopReason::Stalled;
            };
            if executed.len() >= limit {
                break StopReason::StepLimit;
            }
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled { step: None });
            }

            match self
                .execute_step_with(run_id, next.as_str(), None, cancel, emitter)
                .await
            {
                Ok(_) => executed.push(next),
                Err(PipelineError::Execution { step, message }) => {
                    failed_step = Some(FailedStep { step, error: message });
                    break StopReason::StepFailed;
                }
                Err(err) => return Err(err),
            }
        };

        let (_, statuses) = self.statuses(run_id).await?;
        let status = match stop_reason {
            StopReason::Finished => {
                self.complete_run_if_finished(run_id, &statuses).await?;
                RunStatus::Completed
            }
            StopReason::StepFailed => {
                self.store
                    .set_run_status(run_id, RunStatus::Failed, Some(self.clock.now()))
                    .await?;
                RunStatus::Failed
            }
            StopReason::StepLimit | StopReason::Stalled => RunStatus::Running,
        };
        info!(
            "Run {run_id}: stopped ({stop_reason:?}) with status {status} after {} step(s)",
            executed.len()
        );

        Ok(RunOutcome {
            run_id,
            status,
            stop_reason,
            executed,
            failed_step,
            next_available: self.resolver.available_steps(&statuses),
            blocked: self.resolver.blocked_steps(&statuses),
        })
    }

    /// Outcome for a run that is already `failed` or `completed`. Nothing is
    /// executed and the run record is left as it is; a failed run only
    /// re-opens through `retry_step`.
    async fn settled_outcome(&self, run: &Run) -> Result<RunOutcome, PipelineError> {
        let (steps, statuses) = self.statuses(run.id).await?;
        let (stop_reason, failed_step) = if run.status == RunStatus::Completed {
            (StopReason::Finished, None)
        } else {
            let failed = steps
                .iter()
                .find(|s| s.status == StepStatus::Failed)
                .map(|s| FailedStep {
                    step: s.step,
                    error: s.error_message.clone().unwrap_or_default(),
                });
            (StopReason::StepFailed, failed)
        };
        info!("Run {}: already {}; nothing executed", run.id, run.status);

        Ok(RunOutcome {
            run_id: run.id,
            status: run.status,
            stop_reason,
            executed: Vec::new(),
            failed_step,
            next_available: self.resolver.available_steps(&statuses),
            blocked: self.resolver.blocked_steps(&statuses),
        })
    }

    // ── Resume ──────────────────────────────────────────────────────────────

    pub async fn resume_plan(&self, run_id: Uuid) -> Result<ResumePlan, PipelineError> {
        self.get_run(run_id).await?;
        let latest = self.checkpoints.latest_checkpoint(run_id).await?;
        let (_, statuses) = self.statuses(run_id).await?;
        let availability = self.resolver.classify(&statuses);
        Ok(ResumePlan {
            run_id,
            latest_checkpoint: latest.as_ref().map(CheckpointSummary::from),
            completed: availability.completed,
            available: availability.available,
            blocked: availability.blocked,
        })
    }

    /// Picks up from the latest checkpoint. Completed steps are never
    /// re-executed: they are excluded from the available set and the claim
    /// guard rejects them anyway.
    pub async fn resume_from_checkpoint(
        &self,
        run_id: Uuid,
        mode: ResumeMode,
        cancel: &CancellationToken,
        emitter: &ProgressEmitter,
    ) -> Result<ResumeOutcome, PipelineError> {
        let plan = self.resume_plan(run_id).await?;
        info!(
            "Run {run_id}: resuming from {:?} with {} step(s) available",
            plan.latest_checkpoint.as_ref().map(|c| c.step),
            plan.available.len()
        );

        let outcome = match mode {
            ResumeMode::PlanOnly => None,
            ResumeMode::Execute(options) => {
                let _guard = self.claim_active(run_id, cancel.clone())?;
                Some(
                    self.run_to_completion(run_id, options, cancel, emitter)
                        .await?,
                )
            }
        };
        Ok(ResumeOutcome { plan, outcome })
    }

    pub async fn latest_checkpoint(
        &self,
        run_id: Uuid,
    ) -> Result<Option<RunCheckpoint>, PipelineError> {
        self.get_run(run_id).await?;
        Ok(self.checkpoints.latest_checkpoint(run_id).await?)
    }

    // ── Operator actions ────────────────────────────────────────────────────

    /// Marks a step skipped without running it. Dependents treat a skipped
    /// prerequisite as satisfied.
    pub async fn skip_step(&self, run_id: Uuid, step: &str) -> Result<RunStep, PipelineError> {
        let definition = self.lookup(step)?.clone();
        self.get_run(run_id).await?;

        let Some(row) = self
            .store
            .skip_step(run_id, &definition, self.clock.now())
            .await?
        else {
            let current = self
                .store
                .get_step(run_id, definition.name)
                .await?
                .map(|s| s.status);
            return Err(PipelineError::Conflict {
                step: definition.name,
                current,
            });
        };
        info!("Run {run_id}: step '{}' skipped", definition.name);

        let (_, statuses) = self.statuses(run_id).await?;
        self.complete_run_if_finished(run_id, &statuses).await?;
        Ok(row)
    }

    /// Resets a failed step to pending. Re-execution is a separate call.
    pub async fn retry_step(&self, run_id: Uuid, step: &str) -> Result<RunStep, PipelineError> {
        let definition = self.lookup(step)?;
        let name = definition.name;
        let run = self.get_run(run_id).await?;

        let Some(row) = self.store.reset_step(run_id, name).await? else {
            let current = self.store.get_step(run_id, name).await?.map(|s| s.status);
            return Err(PipelineError::Conflict { step: name, current });
        };
        if run.status == RunStatus::Failed {
            self.store
                .set_run_status(run_id, RunStatus::Running, None)
                .await?;
        }
        info!("Run {run_id}: step '{name}' reset to pending for retry");
        Ok(row)
    }

    // ── Background execution ────────────────────────────────────────────────

    /// Starts `run_to_completion` on a detached task. The returned handle
    /// carries the event stream; dropping it does not stop the run.
    pub async fn spawn_run(
        &self,
        run_id: Uuid,
        options: RunOptions,
    ) -> Result<RunHandle, PipelineError> {
        self.get_run(run_id).await?;

        let cancel = CancellationToken::new();
        let guard = self.claim_active(run_id, cancel.clone())?;

        let (emitter, events) = ProgressEmitter::channel(run_id);
        let this = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            let result = this
                .run_to_completion(run_id, options, &token, &emitter)
                .await;
            if let Err(err) = &result {
                warn!("Background run {run_id} ended with error: {err}");
            }
            result
        });

        Ok(RunHandle {
            run_id,
            events,
            cancel,
            task,
        })
    }

    /// Registers `run_id` as driven by one worker. Fails with `RunActive`
    /// while another background or resumed execution holds the slot.
    fn claim_active(
        &self,
        run_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<ActiveGuard, PipelineError> {
        match self.active.entry(run_id) {
            Entry::Occupied(_) => Err(PipelineError::RunActive(run_id)),
            Entry::Vacant(slot) => {
                slot.insert(ActiveRun {
                    cancel,
                    started_at: self.clock.now(),
                });
                Ok(ActiveGuard {
                    active: self.active.clone(),
                    run_id,
                })
            }
        }
    }

    /// Signals a background run to stop. Returns false if none is active.
    pub fn cancel_run(&self, run_id: Uuid) -> bool {
        match self.active.get(&run_id) {
            Some(active) => {
                info!(
                    "Cancelling background run {run_id} (started {})",
                    active.started_at
                );
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, run_id: Uuid) -> bool {
        self.active.contains_key(&run_id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::pipeline::events::ProgressKind;
    use crate::pipeline::executor::{StepError, StepExecutor, StepOutput};
    use crate::pipeline::models::SubjectUpdate;
    use crate::pipeline::registry::StepCategory;
    use crate::pipeline::store::MemoryPipelineStore;

    /// Scripted executor: succeeds with `{"step": name}` unless told to fail,
    /// and counts invocations.
    #[derive(Clone, Default)]
    struct Scripted {
        calls: Arc<Mutex<HashMap<StepName, usize>>>,
        failing: Arc<Mutex<Vec<StepName>>>,
    }

    impl Scripted {
        fn calls(&self, step: StepName) -> usize {
            self.calls.lock().unwrap().get(&step).copied().unwrap_or(0)
        }

        fn fail(&self, step: StepName) {
            self.failing.lock().unwrap().push(step);
        }

        fn heal(&self) {
            self.failing.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl StepExecutor for Scripted {
        async fn execute(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
            *self.calls.lock().unwrap().entry(ctx.step).or_default() += 1;
            if self.failing.lock().unwrap().contains(&ctx.step) {
                return Err(StepError::Failed(format!("{} exploded", ctx.step)));
            }
            let mut output = StepOutput::new(json!({ "step": ctx.step, "params": ctx.parameters }));
            if ctx.step == StepName::ParseJob {
                output = output.with_subject(SubjectUpdate {
                    company_name: Some("Acme".to_string()),
                    role_title: Some("Rust Engineer".to_string()),
                    source_url: None,
                });
            }
            Ok(output)
        }
    }

    /// Never finishes on its own.
    struct Hanging(Arc<AtomicUsize>);

    #[async_trait]
    impl StepExecutor for Hanging {
        async fn execute(&self, _ctx: &StepContext) -> Result<StepOutput, StepError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    struct Panicking;

    #[async_trait]
    impl StepExecutor for Panicking {
        async fn execute(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
            panic!("{} blew up", ctx.step);
        }
    }

    /// Reads the upstream artifact, proving checkpoint artifacts feed later steps.
    struct EchoUpstream;

    #[async_trait]
    impl StepExecutor for EchoUpstream {
        async fn execute(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
            let upstream = ctx.require_artifact(StepName::IngestJob).await?;
            Ok(StepOutput::new(json!({ "upstream": upstream })))
        }
    }

    fn two_step_registry() -> Arc<StepRegistry> {
        Arc::new(
            StepRegistry::new(vec![
                StepDefinition::new(StepName::IngestJob, StepCategory::Ingestion, &[]),
                StepDefinition::new(
                    StepName::ParseJob,
                    StepCategory::Ingestion,
                    &[StepName::IngestJob],
                ),
            ])
            .unwrap(),
        )
    }

    fn orchestrator_with(
        registry: Arc<StepRegistry>,
        executor: impl StepExecutor + Clone + 'static,
    ) -> Orchestrator {
        let mut builder = ExecutorRegistry::builder();
        for name in registry.names() {
            builder = builder.register(name, executor.clone());
        }
        let executors = builder.build(&registry).unwrap();
        Orchestrator::new(
            registry,
            executors,
            Arc::new(MemoryPipelineStore::new()),
            Arc::new(SystemClock),
            32,
        )
    }

    fn standard(executor: &Scripted) -> Orchestrator {
        orchestrator_with(Arc::new(StepRegistry::standard().unwrap()), executor.clone())
    }

    fn never() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_create_run_exposes_zero_dependency_steps() {
        let orch = orchestrator_with(two_step_registry(), Scripted::default());
        let overview = orch.create_run(NewRun::default()).await.unwrap();

        assert_eq!(overview.run.status, RunStatus::Created);
        assert!(overview.availability.completed.is_empty());
        assert_eq!(overview.availability.available, vec![StepName::IngestJob]);
        assert_eq!(overview.availability.blocked, vec![StepName::ParseJob]);
    }

    #[tokio::test]
    async fn test_execute_step_advances_availability() {
        let orch = orchestrator_with(two_step_registry(), Scripted::default());
        let run = orch.create_run(NewRun::default()).await.unwrap().run;

        let result = orch
            .execute_step(run.id, "ingest_job", Some(json!({"job_text": "hi"})), &never())
            .await
            .unwrap();

        assert_eq!(result.step.status, StepStatus::Completed);
        assert!(result.artifact_id.is_some());
        assert_eq!(result.next_available, vec![StepName::ParseJob]);
        assert_eq!(result.checkpoint.step, StepName::IngestJob);
        assert_eq!(result.step.parameters, Some(json!({"job_text": "hi"})));

        let run = orch.get_run(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_dependency_error_lists_missing_and_available() {
        let orch = orchestrator_with(two_step_registry(), Scripted::default());
        let run = orch.create_run(NewRun::default()).await.unwrap().run;

        let err = orch
            .execute_step(run.id, "parse_job", None, &never())
            .await
            .unwrap_err();
        match err {
            PipelineError::DependenciesNotMet { error, available } => {
                assert_eq!(error.step, StepName::ParseJob);
                assert_eq!(error.missing_dependencies, vec![StepName::IngestJob]);
                assert_eq!(available, vec![StepName::IngestJob]);
            }
            other => panic!("expected dependency error, got {other:?}"),
        }
        assert!(orch.store().list_steps(run.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_step_is_distinct_error() {
        let orch = orchestrator_with(two_step_registry(), Scripted::default());
        let run = orch.create_run(NewRun::default()).await.unwrap().run;

        let err = orch
            .execute_step(run.id, "not_a_real_step", None, &never())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownStep(s) if s == "not_a_real_step"));
    }

    #[tokio::test]
    async fn test_missing_run_is_not_found() {
        let orch = orchestrator_with(two_step_registry(), Scripted::default());
        let err = orch
            .execute_step(Uuid::new_v4(), "ingest_job", None, &never())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_second_execution_is_conflict_and_row_unchanged() {
        let executor = Scripted::default();
        let orch = orchestrator_with(two_step_registry(), executor.clone());
        let run = orch.create_run(NewRun::default()).await.unwrap().run;

        orch.execute_step(run.id, "ingest_job", None, &never())
            .await
            .unwrap();
        let before = orch
            .store()
            .get_step(run.id, StepName::IngestJob)
            .await
            .unwrap();

        let err = orch
            .execute_step(run.id, "ingest_job", None, &never())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Conflict {
                step: StepName::IngestJob,
                current: Some(StepStatus::Completed)
            }
        ));

        let after = orch
            .store()
            .get_step(run.id, StepName::IngestJob)
            .await
            .unwrap();
        assert_eq!(before, after);
        assert_eq!(executor.calls(StepName::IngestJob), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_tracks_latest_step() {
        let orch = orchestrator_with(two_step_registry(), Scripted::default());
        let run = orch.create_run(NewRun::default()).await.unwrap().run;

        orch.execute_step(run.id, "ingest_job", None, &never())
            .await
            .unwrap();
        orch.execute_step(run.id, "parse_job", None, &never())
            .await
            .unwrap();

        let latest = orch.latest_checkpoint(run.id).await.unwrap().unwrap();
        assert_eq!(latest.step, StepName::ParseJob);
        assert_eq!(
            latest.completed_steps(),
            vec![StepName::IngestJob, StepName::ParseJob]
        );
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_retry_resets_to_pending() {
        let executor = Scripted::default();
        executor.fail(StepName::IngestJob);
        let orch = orchestrator_with(two_step_registry(), executor.clone());
        let run = orch.create_run(NewRun::default()).await.unwrap().run;

        let err = orch
            .execute_step(run.id, "ingest_job", None, &never())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Execution { step: StepName::IngestJob, .. }));

        let row = orch
            .store()
            .get_step(run.id, StepName::IngestJob)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, StepStatus::Failed);
        assert_eq!(row.error_message.as_deref(), Some("ingest_job exploded"));

        // a single ad-hoc failure does not fail the run
        assert_ne!(orch.get_run(run.id).await.unwrap().status, RunStatus::Failed);

        // executing a failed step directly is a conflict
        let err = orch
            .execute_step(run.id, "ingest_job", None, &never())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Conflict { .. }));

        let reset = orch.retry_step(run.id, "ingest_job").await.unwrap();
        assert_eq!(reset.status, StepStatus::Pending);
        assert!(reset.error_message.is_none());

        let plan = orch.resume_plan(run.id).await.unwrap();
        assert_eq!(plan.available, vec![StepName::IngestJob]);

        executor.heal();
        orch.execute_step(run.id, "ingest_job", None, &never())
            .await
            .unwrap();
        assert_eq!(executor.calls(StepName::IngestJob), 2);
    }

    #[tokio::test]
    async fn test_retry_requires_failed_status() {
        let orch = orchestrator_with(two_step_registry(), Scripted::default());
        let run = orch.create_run(NewRun::default()).await.unwrap().run;

        let err = orch.retry_step(run.id, "ingest_job").await.unwrap_err();
        assert!(matches!(err, PipelineError::Conflict { current: None, .. }));
    }

    #[tokio::test]
    async fn test_skip_never_attempted_step() {
        let executor = Scripted::default();
        let orch = standard(&executor);
        let run = orch.create_run(NewRun::default()).await.unwrap().run;

        let row = orch.skip_step(run.id, "research_company").await.unwrap();
        assert_eq!(row.status, StepStatus::Skipped);
        assert_eq!(row.category, StepCategory::Research);
        assert_eq!(executor.calls(StepName::ResearchCompany), 0);

        let err = orch.skip_step(run.id, "nope").await.unwrap_err();
        assert!(matches!(err, PipelineError::UnknownStep(_)));

        // skipped steps cannot be executed afterwards
        let err = orch
            .execute_step(run.id, "research_company", None, &never())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Conflict {
                current: Some(StepStatus::Skipped),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_skip_completed_step_is_conflict() {
        let orch = orchestrator_with(two_step_registry(), Scripted::default());
        let run = orch.create_run(NewRun::default()).await.unwrap().run;
        orch.execute_step(run.id, "ingest_job", None, &never())
            .await
            .unwrap();

        let err = orch.skip_step(run.id, "ingest_job").await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Conflict {
                current: Some(StepStatus::Completed),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_run_to_completion_executes_every_step_and_fills_subject() {
        let executor = Scripted::default();
        let orch = standard(&executor);
        let run = orch.create_run(NewRun::default()).await.unwrap().run;

        let (emitter, mut events) = ProgressEmitter::channel(run.id);
        let outcome = orch
            .run_to_completion(run.id, RunOptions::default(), &never(), &emitter)
            .await
            .unwrap();
        drop(emitter);

        assert_eq!(outcome.stop_reason, StopReason::Finished);
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.executed.len(), StepName::ALL.len());
        assert!(outcome.next_available.is_empty());

        let run = orch.get_run(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
        assert_eq!(run.company_name.as_deref(), Some("Acme"));

        let mut kinds = Vec::new();
        while let Some(event) = events.recv().await {
            kinds.push(event.kind);
        }
        assert_eq!(kinds.first(), Some(&ProgressKind::RunStarted));
        assert_eq!(kinds.last(), Some(&ProgressKind::RunCompleted));
        assert_eq!(
            kinds.iter().filter(|k| **k == ProgressKind::StepCompleted).count(),
            StepName::ALL.len()
        );
    }

    #[tokio::test]
    async fn test_run_to_completion_halts_on_failure() {
        let executor = Scripted::default();
        executor.fail(StepName::ResearchCompany);
        let orch = standard(&executor);
        let run = orch.create_run(NewRun::default()).await.unwrap().run;

        let outcome = orch
            .run_to_completion(
                run.id,
                RunOptions::default(),
                &never(),
                &ProgressEmitter::detached(run.id),
            )
            .await
            .unwrap();

        assert_eq!(outcome.stop_reason, StopReason::StepFailed);
        assert_eq!(outcome.status, RunStatus::Failed);
        let failed = outcome.failed_step.unwrap();
        assert_eq!(failed.step, StepName::ResearchCompany);
        assert!(failed.error.contains("exploded"));
        // nothing downstream of the failure ran
        assert_eq!(executor.calls(StepName::RewriteSummary), 0);
        assert_eq!(executor.calls(StepName::ValidateDocument), 0);
        assert_eq!(orch.get_run(run.id).await.unwrap().status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_step_limit_bounds_a_batch() {
        let executor = Scripted::default();
        let orch = standard(&executor);
        let run = orch.create_run(NewRun::default()).await.unwrap().run;

        let outcome = orch
            .run_to_completion(
                run.id,
                RunOptions { max_steps: Some(2) },
                &never(),
                &ProgressEmitter::detached(run.id),
            )
            .await
            .unwrap();
        assert_eq!(outcome.stop_reason, StopReason::StepLimit);
        assert_eq!(outcome.executed.len(), 2);
        assert_eq!(outcome.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_resume_never_reexecutes_completed_steps() {
        let executor = Scripted::default();
        let orch = standard(&executor);
        let run = orch.create_run(NewRun::default()).await.unwrap().run;

        orch.run_to_completion(
            run.id,
            RunOptions { max_steps: Some(3) },
            &never(),
            &ProgressEmitter::detached(run.id),
        )
        .await
        .unwrap();

        let resumed = orch
            .resume_from_checkpoint(
                run.id,
                ResumeMode::Execute(RunOptions::default()),
                &never(),
                &ProgressEmitter::detached(run.id),
            )
            .await
            .unwrap();

        assert_eq!(resumed.plan.completed.len(), 3);
        assert!(resumed.plan.latest_checkpoint.is_some());
        let outcome = resumed.outcome.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Finished);
        for name in StepName::ALL {
            assert_eq!(executor.calls(name), 1, "{name} ran more than once");
        }
    }

    #[tokio::test]
    async fn test_resume_plan_only_does_not_execute() {
        let executor = Scripted::default();
        let orch = standard(&executor);
        let run = orch.create_run(NewRun::default()).await.unwrap().run;

        let resumed = orch
            .resume_from_checkpoint(
                run.id,
                ResumeMode::PlanOnly,
                &never(),
                &ProgressEmitter::detached(run.id),
            )
            .await
            .unwrap();
        assert!(resumed.outcome.is_none());
        assert!(resumed.plan.latest_checkpoint.is_none());
        assert_eq!(
            resumed.plan.available,
            vec![StepName::IngestJob, StepName::LoadExperience]
        );
        assert_eq!(executor.calls(StepName::IngestJob), 0);
    }

    #[tokio::test]
    async fn test_skipped_branch_lets_run_finish() {
        let executor = Scripted::default();
        let orch = standard(&executor);
        let run = orch.create_run(NewRun::default()).await.unwrap().run;
        orch.skip_step(run.id, "research_company").await.unwrap();

        let outcome = orch
            .run_to_completion(
                run.id,
                RunOptions::default(),
                &never(),
                &ProgressEmitter::detached(run.id),
            )
            .await
            .unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Finished);
        assert_eq!(outcome.executed.len(), StepName::ALL.len() - 1);
        assert_eq!(executor.calls(StepName::ResearchCompany), 0);
    }

    #[tokio::test]
    async fn test_executing_last_step_ad_hoc_completes_run() {
        let orch = orchestrator_with(two_step_registry(), Scripted::default());
        let run = orch.create_run(NewRun::default()).await.unwrap().run;

        orch.execute_step(run.id, "ingest_job", None, &never())
            .await
            .unwrap();
        assert_eq!(orch.get_run(run.id).await.unwrap().status, RunStatus::Running);

        orch.execute_step(run.id, "parse_job", None, &never())
            .await
            .unwrap();
        let run = orch.get_run(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_run_stays_failed_until_retry() {
        let registry = Arc::new(
            StepRegistry::new(vec![
                StepDefinition::new(StepName::IngestJob, StepCategory::Ingestion, &[]),
                StepDefinition::new(StepName::LoadExperience, StepCategory::Experience, &[]),
                StepDefinition::new(
                    StepName::ParseJob,
                    StepCategory::Ingestion,
                    &[StepName::IngestJob],
                ),
            ])
            .unwrap(),
        );
        let executor = Scripted::default();
        executor.fail(StepName::IngestJob);
        let orch = orchestrator_with(registry, executor.clone());
        let run = orch.create_run(NewRun::default()).await.unwrap().run;

        let first = orch
            .run_to_completion(
                run.id,
                RunOptions::default(),
                &never(),
                &ProgressEmitter::detached(run.id),
            )
            .await
            .unwrap();
        assert_eq!(first.stop_reason, StopReason::StepFailed);
        let failed_at = orch.get_run(run.id).await.unwrap().completed_at;

        let resumed = orch
            .resume_from_checkpoint(
                run.id,
                ResumeMode::Execute(RunOptions::default()),
                &never(),
                &ProgressEmitter::detached(run.id),
            )
            .await
            .unwrap()
            .outcome
            .unwrap();
        assert_eq!(resumed.status, RunStatus::Failed);
        assert_eq!(resumed.stop_reason, StopReason::StepFailed);
        assert!(resumed.executed.is_empty());
        assert_eq!(resumed.failed_step.unwrap().step, StepName::IngestJob);
        assert_eq!(executor.calls(StepName::IngestJob), 1);
        assert_eq!(executor.calls(StepName::LoadExperience), 0);

        let run_after = orch.get_run(run.id).await.unwrap();
        assert_eq!(run_after.status, RunStatus::Failed);
        assert_eq!(run_after.completed_at, failed_at);

        // retry is the way back in
        executor.heal();
        orch.retry_step(run.id, "ingest_job").await.unwrap();
        let outcome = orch
            .run_to_completion(
                run.id,
                RunOptions::default(),
                &never(),
                &ProgressEmitter::detached(run.id),
            )
            .await
            .unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Finished);
        assert_eq!(outcome.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_completed_run_is_not_restamped() {
        let executor = Scripted::default();
        let orch = orchestrator_with(two_step_registry(), executor.clone());
        let run = orch.create_run(NewRun::default()).await.unwrap().run;

        orch.run_to_completion(
            run.id,
            RunOptions::default(),
            &never(),
            &ProgressEmitter::detached(run.id),
        )
        .await
        .unwrap();
        let completed_at = orch.get_run(run.id).await.unwrap().completed_at;
        assert!(completed_at.is_some());

        let again = orch
            .run_to_completion(
                run.id,
                RunOptions::default(),
                &never(),
                &ProgressEmitter::detached(run.id),
            )
            .await
            .unwrap();
        assert_eq!(again.stop_reason, StopReason::Finished);
        assert!(again.executed.is_empty());
        assert_eq!(executor.calls(StepName::IngestJob), 1);
        assert_eq!(orch.get_run(run.id).await.unwrap().completed_at, completed_at);
    }

    #[tokio::test]
    async fn test_upstream_artifacts_reach_downstream_executor() {
        let registry = two_step_registry();
        let executors = ExecutorRegistry::builder()
            .register(StepName::IngestJob, Scripted::default())
            .register(StepName::ParseJob, EchoUpstream)
            .build(&registry)
            .unwrap();
        let store: Arc<dyn PipelineStore> = Arc::new(MemoryPipelineStore::new());
        let orch = Orchestrator::new(registry, executors, store.clone(), Arc::new(SystemClock), 8);
        let run = orch.create_run(NewRun::default()).await.unwrap().run;

        orch.execute_step(run.id, "ingest_job", Some(json!({"k": 1})), &never())
            .await
            .unwrap();
        let result = orch
            .execute_step(run.id, "parse_job", None, &never())
            .await
            .unwrap();

        let artifact = store
            .get_artifact(result.artifact_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(artifact.content["upstream"]["params"]["k"], 1);
    }

    #[tokio::test]
    async fn test_cancellation_leaves_step_in_progress() {
        let registry = two_step_registry();
        let started = Arc::new(AtomicUsize::new(0));
        let executors = ExecutorRegistry::builder()
            .register(StepName::IngestJob, Hanging(started.clone()))
            .register(StepName::ParseJob, Scripted::default())
            .build(&registry)
            .unwrap();
        let orch = Orchestrator::new(
            registry,
            executors,
            Arc::new(MemoryPipelineStore::new()),
            Arc::new(SystemClock),
            8,
        );
        let run = orch.create_run(NewRun::default()).await.unwrap().run;

        let handle = orch.spawn_run(run.id, RunOptions::default()).await.unwrap();
        assert!(orch.is_active(run.id));
        assert!(matches!(
            orch.spawn_run(run.id, RunOptions::default()).await,
            Err(PipelineError::RunActive(_))
        ));

        while started.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(orch.cancel_run(run.id));

        let result = handle.task.await.unwrap();
        assert!(matches!(
            result,
            Err(PipelineError::Cancelled {
                step: Some(StepName::IngestJob)
            })
        ));

        let row = orch
            .store()
            .get_step(run.id, StepName::IngestJob)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, StepStatus::InProgress);
        assert!(!orch.is_active(run.id));

        // the stuck step is still eligible for operator intervention
        let skipped = orch.skip_step(run.id, "ingest_job").await.unwrap();
        assert_eq!(skipped.status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_executing_resume_holds_the_active_slot() {
        let registry = two_step_registry();
        let started = Arc::new(AtomicUsize::new(0));
        let executors = ExecutorRegistry::builder()
            .register(StepName::IngestJob, Hanging(started.clone()))
            .register(StepName::ParseJob, Scripted::default())
            .build(&registry)
            .unwrap();
        let orch = Orchestrator::new(
            registry,
            executors,
            Arc::new(MemoryPipelineStore::new()),
            Arc::new(SystemClock),
            8,
        );
        let run_id = orch.create_run(NewRun::default()).await.unwrap().run.id;

        let resuming = orch.clone();
        let task = tokio::spawn(async move {
            resuming
                .resume_from_checkpoint(
                    run_id,
                    ResumeMode::Execute(RunOptions::default()),
                    &CancellationToken::new(),
                    &ProgressEmitter::detached(run_id),
                )
                .await
        });

        while started.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(orch.is_active(run_id));
        assert!(matches!(
            orch.spawn_run(run_id, RunOptions::default()).await,
            Err(PipelineError::RunActive(_))
        ));

        assert!(orch.cancel_run(run_id));
        let result = task.await.unwrap();
        assert!(matches!(result, Err(PipelineError::Cancelled { .. })));
        assert!(!orch.is_active(run_id));
    }

    #[tokio::test]
    async fn test_panicking_executor_releases_active_slot() {
        let registry = two_step_registry();
        let executors = ExecutorRegistry::builder()
            .register(StepName::IngestJob, Panicking)
            .register(StepName::ParseJob, Scripted::default())
            .build(&registry)
            .unwrap();
        let panicking = Orchestrator::new(
            registry,
            executors,
            Arc::new(MemoryPipelineStore::new()),
            Arc::new(SystemClock),
            8,
        );
        let run = panicking.create_run(NewRun::default()).await.unwrap().run;

        let handle = panicking
            .spawn_run(run.id, RunOptions::default())
            .await
            .unwrap();
        let joined = handle.task.await;
        assert!(joined.unwrap_err().is_panic());
        assert!(!panicking.is_active(run.id));

        // a later start is not refused as already active
        let again = panicking
            .spawn_run(run.id, RunOptions::default())
            .await
            .unwrap();
        assert_eq!(again.run_id, run.id);
    }

    #[tokio::test]
    async fn test_background_run_streams_terminal_event() {
        let orch = orchestrator_with(two_step_registry(), Scripted::default());
        let run = orch.create_run(NewRun::default()).await.unwrap().run;

        let mut handle = orch.spawn_run(run.id, RunOptions::default()).await.unwrap();
        let mut last = None;
        while let Some(event) = handle.events.recv().await {
            last = Some(event);
        }
        let last = last.unwrap();
        assert_eq!(last.kind, ProgressKind::RunCompleted);
        assert_eq!(last.status, Some(RunStatus::Completed));

        let outcome = handle.task.await.unwrap().unwrap();
        assert_eq!(outcome.executed, vec![StepName::IngestJob, StepName::ParseJob]);
    }

    #[tokio::test]
    async fn test_concurrent_claims_let_only_one_execution_through() {
        let executor = Scripted::default();
        let orch = orchestrator_with(two_step_registry(), executor.clone());
        let run_id = orch.create_run(NewRun::default()).await.unwrap().run.id;

        let a = orch.clone();
        let b = orch.clone();
        let (ra, rb) = tokio::join!(
            async move { a.execute_step(run_id, "ingest_job", None, &never()).await },
            async move { b.execute_step(run_id, "ingest_job", None, &never()).await },
        );

        let successes = [ra.is_ok(), rb.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1);
        assert_eq!(executor.calls(StepName::IngestJob), 1);
    }
}
