use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::models::StepStatus;
use crate::pipeline::registry::StepName;
use crate::pipeline::resolver::DependencyError;
use crate::pipeline::store::StoreError;

/// Everything the orchestrator can report back to a caller.
///
/// Caller errors (`UnknownStep`, `DependenciesNotMet`, `Conflict`) never leave
/// partial writes behind. `Execution` is always recorded on the RunStep
/// before it is returned. `Store` means the persistence layer itself failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("{error}")]
    DependenciesNotMet {
        error: DependencyError,
        available: Vec<StepName>,
    },

    #[error("step '{step}' cannot change state: current status is {}", status_label(.current))]
    Conflict {
        step: StepName,
        current: Option<StepStatus>,
    },

    #[error("run {0} already has an active background execution")]
    RunActive(Uuid),

    #[error("step '{step}' failed: {message}")]
    Execution { step: StepName, message: String },

    #[error("cancelled{}", cancelled_suffix(.step))]
    Cancelled { step: Option<StepName> },

    #[error("persistence failure: {0}")]
    Store(#[from] StoreError),
}

fn status_label(status: &Option<StepStatus>) -> &'static str {
    status.map_or("not started", |s| s.as_str())
}

fn cancelled_suffix(step: &Option<StepName>) -> String {
    step.map(|s| format!(" while '{s}' was in progress"))
        .unwrap_or_default()
}
