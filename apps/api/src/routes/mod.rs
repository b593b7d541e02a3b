pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::pipeline::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/v1/health", get(health::health_handler))
        // Runs
        .route(
            "/api/v1/runs",
            post(handlers::handle_create_run).get(handlers::handle_list_runs),
        )
        .route("/api/v1/runs/stream", post(handlers::handle_stream_run))
        .route("/api/v1/runs/:id", get(handlers::handle_get_run))
        // Steps
        .route("/api/v1/runs/:id/steps", get(handlers::handle_list_steps))
        .route("/api/v1/runs/:id/steps/:step", get(handlers::handle_get_step))
        .route(
            "/api/v1/runs/:id/steps/:step/execute",
            post(handlers::handle_execute_step),
        )
        .route(
            "/api/v1/runs/:id/steps/:step/skip",
            post(handlers::handle_skip_step),
        )
        .route(
            "/api/v1/runs/:id/steps/:step/retry",
            post(handlers::handle_retry_step),
        )
        // Checkpoints and background execution
        .route(
            "/api/v1/runs/:id/checkpoint",
            get(handlers::handle_get_checkpoint),
        )
        .route("/api/v1/runs/:id/resume", post(handlers::handle_resume))
        .route("/api/v1/runs/:id/start", post(handlers::handle_start_run))
        .route("/api/v1/runs/:id/cancel", post(handlers::handle_cancel_run))
        .with_state(state)
}
