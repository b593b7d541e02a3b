//! Executors for the standard resume-tailoring steps.

pub mod experience;
pub mod ingestion;
pub mod prompts;
pub mod research;
pub mod rewriting;
pub mod validation;

use std::sync::Arc;

use sqlx::PgPool;

use crate::llm_client::TextGenerator;
use crate::pipeline::executor::{ExecutorRegistry, MissingExecutors};
use crate::pipeline::registry::{StepName, StepRegistry};

use experience::{LoadExperience, SelectExperience};
use ingestion::{IngestJob, ParseJob};
use research::ResearchCompany;
use rewriting::{RewriteBullets, RewriteSummary};
use validation::ValidateDocument;

/// External capabilities the executors need.
#[derive(Clone)]
pub struct StepDeps {
    pub llm: Arc<dyn TextGenerator>,
    /// Experience bank; `None` means entries must come in as parameters.
    pub pool: Option<PgPool>,
    pub http: reqwest::Client,
}

/// Registers one executor per standard step and checks that `registry` is
/// fully covered.
pub fn build_executors(
    registry: &StepRegistry,
    deps: StepDeps,
) -> Result<ExecutorRegistry, MissingExecutors> {
    ExecutorRegistry::builder()
        .register(StepName::IngestJob, IngestJob::new(deps.http))
        .register(StepName::ParseJob, ParseJob::new(deps.llm.clone()))
        .register(StepName::LoadExperience, LoadExperience::new(deps.pool))
        .register(StepName::SelectExperience, SelectExperience)
        .register(StepName::ResearchCompany, ResearchCompany::new(deps.llm.clone()))
        .register(StepName::RewriteSummary, RewriteSummary::new(deps.llm.clone()))
        .register(StepName::RewriteBullets, RewriteBullets::new(deps.llm))
        .register(StepName::ValidateDocument, ValidateDocument)
        .build(registry)
}
