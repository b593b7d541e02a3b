use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

use crate::pipeline::errors::PipelineError;
use crate::pipeline::registry::StepName;
use crate::pipeline::store::StoreError;

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("Dependencies not met for {step}: {missing:?}")]
    DependenciesNotMet {
        step: StepName,
        missing: Vec<StepName>,
        available: Vec<StepName>,
    },

    #[error("Conflict: {message}")]
    Conflict { message: String, details: Value },

    #[error("Step {step} failed: {error}")]
    StepFailed { step: StepName, error: String },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let message = err.to_string();
        match err {
            PipelineError::UnknownStep(step) => AppError::UnknownStep(step),
            PipelineError::RunNotFound(id) => AppError::NotFound(format!("Run {id} not found")),
            PipelineError::DependenciesNotMet { error, available } => {
                AppError::DependenciesNotMet {
                    step: error.step,
                    missing: error.missing_dependencies,
                    available,
                }
            }
            PipelineError::Conflict { step, current } => AppError::Conflict {
                message,
                details: json!({ "step": step, "current_status": current }),
            },
            PipelineError::RunActive(run_id) => AppError::Conflict {
                message,
                details: json!({ "run_id": run_id }),
            },
            PipelineError::Execution { step, message } => AppError::StepFailed {
                step,
                error: message,
            },
            PipelineError::Cancelled { .. } => AppError::Cancelled(message),
            PipelineError::Store(e) => AppError::Store(e),
        }
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String, Option<Value>) {
        match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone(), None),
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone(), None)
            }
            AppError::UnknownStep(step) => (
                StatusCode::NOT_FOUND,
                "UNKNOWN_STEP",
                format!("Step '{step}' is not registered"),
                Some(json!({ "step": step })),
            ),
            AppError::DependenciesNotMet {
                step,
                missing,
                available,
            } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "DEPENDENCIES_NOT_MET",
                format!("Step '{step}' cannot run until its dependencies complete"),
                Some(json!({
                    "step": step,
                    "missing_dependencies": missing,
                    "available_steps": available,
                })),
            ),
            AppError::Conflict { message, details } => (
                StatusCode::CONFLICT,
                "STATE_CONFLICT",
                message.clone(),
                Some(details.clone()),
            ),
            AppError::StepFailed { step, error } => {
                tracing::warn!("Step {step} failed: {error}");
                (
                    StatusCode::BAD_GATEWAY,
                    "STEP_FAILED",
                    format!("Step '{step}' failed"),
                    Some(json!({ "step": step, "error": error })),
                )
            }
            AppError::Cancelled(msg) => (StatusCode::CONFLICT, "CANCELLED", msg.clone(), None),
            AppError::Store(e) => {
                tracing::error!("Storage error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                    None,
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                    None,
                )
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = self.parts();

        let mut error = json!({
            "code": code,
            "message": message
        });
        if let Some(details) = details {
            error["details"] = details;
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}
