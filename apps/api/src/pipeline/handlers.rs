use std::collections::BTreeMap;
use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::AppError;
use crate::pipeline::cancel::CancellationToken;
use crate::pipeline::events::{ProgressEmitter, ProgressReceiver};
use crate::pipeline::models::{NewRun, Run, RunCheckpoint, RunStep};
use crate::pipeline::orchestrator::{
    ResumeMode, ResumeOutcome, RunOptions, RunOverview, StepExecution,
};
use crate::pipeline::registry::{StepCategory, StepName};
use crate::pipeline::resolver::{summarize_by_category, CategorySummary, StepView};
use crate::state::AppState;

// ────────────────────────────────────────────────────────────────────────────
// Request / response types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ListRunsQuery {
    pub user_id: Option<Uuid>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct StepFilterQuery {
    pub category: Option<String>,
}

#[derive(Serialize)]
pub struct StepListResponse {
    pub run_id: Uuid,
    pub steps: Vec<StepView>,
    pub summary: BTreeMap<String, CategorySummary>,
}

#[derive(Deserialize, Default)]
pub struct ExecuteStepRequest {
    pub parameters: Option<Value>,
}

#[derive(Serialize)]
pub struct CheckpointResponse {
    pub run_id: Uuid,
    pub checkpoint: Option<RunCheckpoint>,
    pub completed: Vec<StepName>,
    pub next_available: Vec<StepName>,
}

#[derive(Deserialize, Default)]
pub struct ResumeRequest {
    #[serde(default)]
    pub execute: bool,
    pub max_steps: Option<usize>,
}

#[derive(Deserialize, Default)]
pub struct StartRunRequest {
    pub max_steps: Option<usize>,
}

#[derive(Serialize)]
pub struct StartRunResponse {
    pub run_id: Uuid,
    pub started: bool,
}

#[derive(Serialize)]
pub struct CancelRunResponse {
    pub run_id: Uuid,
    pub cancelled: bool,
}

/// Body of `POST /runs/stream`: reuse `run_id` if given, else create a run.
#[derive(Deserialize, Default)]
pub struct StreamRunRequest {
    pub run_id: Option<Uuid>,
    #[serde(flatten)]
    pub new_run: NewRun,
    pub max_steps: Option<usize>,
}

// ────────────────────────────────────────────────────────────────────────────
// Runs
// ────────────────────────────────────────────────────────────────────────────

/// POST /api/v1/runs
pub async fn handle_create_run(
    State(state): State<AppState>,
    Json(req): Json<NewRun>,
) -> Result<(StatusCode, Json<RunOverview>), AppError> {
    let overview = state.orchestrator.create_run(req).await?;
    Ok((StatusCode::CREATED, Json(overview)))
}

/// GET /api/v1/runs
pub async fn handle_list_runs(
    State(state): State<AppState>,
    Query(params): Query<ListRunsQuery>,
) -> Result<Json<Vec<Run>>, AppError> {
    let runs = state
        .orchestrator
        .list_runs(params.user_id, params.limit.unwrap_or(50))
        .await?;
    Ok(Json(runs))
}

/// GET /api/v1/runs/:id
pub async fn handle_get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunOverview>, AppError> {
    Ok(Json(state.orchestrator.overview(run_id).await?))
}

// ────────────────────────────────────────────────────────────────────────────
// Steps
// ────────────────────────────────────────────────────────────────────────────

/// GET /api/v1/runs/:id/steps
pub async fn handle_list_steps(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    Query(params): Query<StepFilterQuery>,
) -> Result<Json<StepListResponse>, AppError> {
    let category = params
        .category
        .as_deref()
        .map(str::parse::<StepCategory>)
        .transpose()
        .map_err(AppError::Validation)?;

    let overview = state.orchestrator.overview(run_id).await?;
    let steps: Vec<StepView> = overview
        .steps
        .into_iter()
        .filter(|v| category.map_or(true, |c| v.category == c))
        .collect();

    Ok(Json(StepListResponse {
        run_id,
        summary: summarize_by_category(&steps),
        steps,
    }))
}

/// GET /api/v1/runs/:id/steps/:step
pub async fn handle_get_step(
    State(state): State<AppState>,
    Path((run_id, step)): Path<(Uuid, String)>,
) -> Result<Json<StepView>, AppError> {
    Ok(Json(state.orchestrator.step_view(run_id, &step).await?))
}

/// POST /api/v1/runs/:id/steps/:step/execute
pub async fn handle_execute_step(
    State(state): State<AppState>,
    Path((run_id, step)): Path<(Uuid, String)>,
    body: Option<Json<ExecuteStepRequest>>,
) -> Result<Json<StepExecution>, AppError> {
    let parameters = body.and_then(|Json(req)| req.parameters);
    let result = state
        .orchestrator
        .execute_step(run_id, &step, parameters, &CancellationToken::new())
        .await?;
    Ok(Json(result))
}

/// POST /api/v1/runs/:id/steps/:step/skip
pub async fn handle_skip_step(
    State(state): State<AppState>,
    Path((run_id, step)): Path<(Uuid, String)>,
) -> Result<Json<RunStep>, AppError> {
    Ok(Json(state.orchestrator.skip_step(run_id, &step).await?))
}

/// POST /api/v1/runs/:id/steps/:step/retry
pub async fn handle_retry_step(
    State(state): State<AppState>,
    Path((run_id, step)): Path<(Uuid, String)>,
) -> Result<Json<RunStep>, AppError> {
    Ok(Json(state.orchestrator.retry_step(run_id, &step).await?))
}

// ────────────────────────────────────────────────────────────────────────────
// Checkpoints and resume
// ────────────────────────────────────────────────────────────────────────────

/// GET /api/v1/runs/:id/checkpoint
pub async fn handle_get_checkpoint(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<CheckpointResponse>, AppError> {
    let checkpoint = state.orchestrator.latest_checkpoint(run_id).await?;
    let plan = state.orchestrator.resume_plan(run_id).await?;
    Ok(Json(CheckpointResponse {
        run_id,
        checkpoint,
        completed: plan.completed,
        next_available: plan.available,
    }))
}

/// POST /api/v1/runs/:id/resume
///
/// Without `execute` this only reports where the run would pick up. An
/// executing resume holds the run's active slot, so `/start` and `/stream`
/// are refused and `/cancel` reaches it until it returns.
pub async fn handle_resume(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    body: Option<Json<ResumeRequest>>,
) -> Result<Json<ResumeOutcome>, AppError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let mode = if req.execute {
        ResumeMode::Execute(RunOptions {
            max_steps: req.max_steps,
        })
    } else {
        ResumeMode::PlanOnly
    };

    let outcome = state
        .orchestrator
        .resume_from_checkpoint(
            run_id,
            mode,
            &CancellationToken::new(),
            &ProgressEmitter::detached(run_id),
        )
        .await?;
    Ok(Json(outcome))
}

// ────────────────────────────────────────────────────────────────────────────
// Background runs
// ────────────────────────────────────────────────────────────────────────────

/// POST /api/v1/runs/:id/start
pub async fn handle_start_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    body: Option<Json<StartRunRequest>>,
) -> Result<(StatusCode, Json<StartRunResponse>), AppError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let handle = state
        .orchestrator
        .spawn_run(
            run_id,
            RunOptions {
                max_steps: req.max_steps,
            },
        )
        .await?;
    info!("Background run {} started", handle.run_id);

    Ok((
        StatusCode::ACCEPTED,
        Json(StartRunResponse {
            run_id,
            started: true,
        }),
    ))
}

/// POST /api/v1/runs/:id/cancel
pub async fn handle_cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<CancelRunResponse>, AppError> {
    if !state.orchestrator.cancel_run(run_id) {
        return Err(AppError::NotFound(format!(
            "Run {run_id} has no active background execution"
        )));
    }
    Ok(Json(CancelRunResponse {
        run_id,
        cancelled: true,
    }))
}

/// POST /api/v1/runs/stream
///
/// Starts (or continues) a run in the background and streams its progress
/// events as server-sent events. Disconnecting does not stop the run.
pub async fn handle_stream_run(
    State(state): State<AppState>,
    Json(req): Json<StreamRunRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let run_id = match req.run_id {
        Some(id) => id,
        None => state.orchestrator.create_run(req.new_run).await?.run.id,
    };

    let handle = state
        .orchestrator
        .spawn_run(
            run_id,
            RunOptions {
                max_steps: req.max_steps,
            },
        )
        .await?;
    info!("Streaming progress for run {run_id}");

    Ok(Sse::new(progress_stream(handle.events)).keep_alive(KeepAlive::default()))
}

fn progress_stream(events: ProgressReceiver) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(events, |mut rx| async move {
        let event = rx.recv().await?;
        let sse = Event::default()
            .event(event.kind.as_str())
            .json_data(&event)
            .unwrap_or_else(|e| {
                warn!("Failed to encode progress event: {e}");
                Event::default().event(event.kind.as_str()).data(event.message.clone())
            });
        Some((Ok(sse), rx))
    })
}
