use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::llm_client::prompts::json_system;
use crate::llm_client::{generate_json, TextGenerator};
use crate::pipeline::executor::{StepContext, StepError, StepExecutor, StepOutput};
use crate::pipeline::registry::StepName;
use crate::steps::ingestion::ParsedJob;
use crate::steps::prompts::{RESEARCH_PROMPT_TEMPLATE, RESEARCH_ROLE};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompanyResearch {
    #[serde(default)]
    pub company_name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub products: Vec<String>,
    #[serde(default)]
    pub culture_signals: Vec<String>,
    #[serde(default)]
    pub talking_points: Vec<String>,
}

pub struct ResearchCompany {
    llm: Arc<dyn TextGenerator>,
}

impl ResearchCompany {
    pub fn new(llm: Arc<dyn TextGenerator>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl StepExecutor for ResearchCompany {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let parsed: ParsedJob =
            serde_json::from_value(ctx.require_artifact(StepName::ParseJob).await?)
                .map_err(|e| StepError::Failed(format!("unreadable parse_job artifact: {e}")))?;

        // operator-supplied name wins over the parsed one
        let company = ctx
            .parameter_str("company_name")
            .map(str::to_string)
            .or_else(|| ctx.run.company_name.clone())
            .or_else(|| parsed.company_name.clone())
            .ok_or_else(|| {
                StepError::InvalidParameters(
                    "company is unknown; pass company_name or skip this step".to_string(),
                )
            })?;
        let role = ctx
            .run
            .role_title
            .clone()
            .or_else(|| parsed.role_title.clone())
            .unwrap_or_else(|| "unspecified role".to_string());

        let requirements = parsed
            .hard_requirements
            .iter()
            .map(|r| format!("- {}", r.text))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = RESEARCH_PROMPT_TEMPLATE
            .replace("{company_name}", &company)
            .replace("{role_title}", &role)
            .replace("{requirements}", &requirements);

        let mut research: CompanyResearch =
            generate_json(self.llm.as_ref(), &prompt, &json_system(RESEARCH_ROLE))
                .await
                .map_err(|e| StepError::Failed(format!("company research failed: {e}")))?;
        if research.company_name.trim().is_empty() {
            research.company_name = company;
        }
        if research.summary.trim().is_empty() {
            return Err(StepError::Failed(format!(
                "no research summary produced for {}",
                research.company_name
            )));
        }
        info!(
            "Researched {}: {} talking points",
            research.company_name,
            research.talking_points.len()
        );

        let metadata = json!({ "talking_points": research.talking_points.len() });
        let content = serde_json::to_value(&research)
            .map_err(|e| StepError::Failed(format!("could not encode step output: {e}")))?;
        Ok(StepOutput::new(content).with_metadata(metadata))
    }
}
