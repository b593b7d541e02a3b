//! Rewriting steps: generate the tailored summary and bullets from the
//! selected experience, the parsed job and (when not skipped) the company
//! research.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::llm_client::prompts::{json_system, GROUNDING_INSTRUCTION, SCOPE_INSTRUCTION};
use crate::llm_client::{generate_json, TextGenerator};
use crate::pipeline::executor::{StepContext, StepError, StepExecutor, StepOutput};
use crate::pipeline::registry::StepName;
use crate::steps::experience::Selection;
use crate::steps::ingestion::ParsedJob;
use crate::steps::prompts::{
    BULLETS_PROMPT_TEMPLATE, BULLETS_ROLE, SUMMARY_PROMPT_TEMPLATE, SUMMARY_ROLE,
};
use crate::steps::research::CompanyResearch;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewrittenSummary {
    pub summary: String,
    #[serde(default)]
    pub source_entry_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bullet {
    pub text: String,
    /// Must name a selected entry; checked by `validate_document`.
    pub source_entry_id: String,
    #[serde(default)]
    pub jd_keywords_used: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewrittenBullets {
    pub bullets: Vec<Bullet>,
}

/// Inputs shared by both rewriting steps.
struct RewriteInputs {
    parsed: ParsedJob,
    selection: Selection,
    research: Option<CompanyResearch>,
}

impl RewriteInputs {
    async fn load(ctx: &StepContext) -> Result<Self, StepError> {
        let parsed = decode(ctx.require_artifact(StepName::ParseJob).await?, StepName::ParseJob)?;
        let selection = decode(
            ctx.require_artifact(StepName::SelectExperience).await?,
            StepName::SelectExperience,
        )?;
        // absent when research_company was skipped
        let research = match ctx.artifact(StepName::ResearchCompany).await? {
            Some(value) => Some(decode(value, StepName::ResearchCompany)?),
            None => None,
        };
        Ok(Self {
            parsed,
            selection,
            research,
        })
    }

    fn entries_json(&self) -> String {
        let entries: Vec<_> = self
            .selection
            .selected
            .iter()
            .map(|r| {
                json!({
                    "entry_id": r.entry.entry_id,
                    "entry_type": r.entry.entry_type,
                    "contribution_type": r.entry.contribution_type,
                    "text": r.entry.raw_text,
                    "tags": r.entry.tags,
                })
            })
            .collect();
        serde_json::to_string_pretty(&entries).unwrap_or_default()
    }

    fn keywords_json(&self) -> String {
        let keywords: Vec<&str> = self
            .parsed
            .keyword_inventory
            .iter()
            .map(|k| k.keyword.as_str())
            .collect();
        serde_json::to_string(&keywords).unwrap_or_default()
    }

    fn research_text(&self) -> String {
        match &self.research {
            Some(r) => format!("{}\nTalking points: {}", r.summary, r.talking_points.join("; ")),
            None => String::new(),
        }
    }

    fn tone(&self) -> String {
        format!("{:?}", self.parsed.detected_tone)
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
    step: StepName,
) -> Result<T, StepError> {
    serde_json::from_value(value)
        .map_err(|e| StepError::Failed(format!("unreadable {step} artifact: {e}")))
}

fn encode<T: Serialize>(value: &T) -> Result<serde_json::Value, StepError> {
    serde_json::to_value(value)
        .map_err(|e| StepError::Failed(format!("could not encode step output: {e}")))
}

// ────────────────────────────────────────────────────────────────────────────
// rewrite_summary
// ────────────────────────────────────────────────────────────────────────────

pub struct RewriteSummary {
    llm: Arc<dyn TextGenerator>,
}

impl RewriteSummary {
    pub fn new(llm: Arc<dyn TextGenerator>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl StepExecutor for RewriteSummary {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let inputs = RewriteInputs::load(ctx).await?;
        let company = ctx
            .run
            .company_name
            .clone()
            .or_else(|| inputs.parsed.company_name.clone())
            .unwrap_or_else(|| "the company".to_string());
        let role = ctx
            .run
            .role_title
            .clone()
            .or_else(|| inputs.parsed.role_title.clone())
            .unwrap_or_else(|| "the role".to_string());

        let prompt = SUMMARY_PROMPT_TEMPLATE
            .replace("{grounding_instruction}", GROUNDING_INSTRUCTION)
            .replace("{role_title}", &role)
            .replace("{company_name}", &company)
            .replace("{tone}", &inputs.tone())
            .replace("{research}", &inputs.research_text())
            .replace("{entries_json}", &inputs.entries_json())
            .replace("{keywords_json}", &inputs.keywords_json());

        let summary: RewrittenSummary =
            generate_json(self.llm.as_ref(), &prompt, &json_system(SUMMARY_ROLE))
                .await
                .map_err(|e| StepError::Failed(format!("summary generation failed: {e}")))?;
        info!("Generated summary ({} chars)", summary.summary.len());

        let metadata = json!({
            "used_research": inputs.research.is_some(),
            "cited_entries": summary.source_entry_ids.len(),
        });
        Ok(StepOutput::new(encode(&summary)?).with_metadata(metadata))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// rewrite_bullets
// ────────────────────────────────────────────────────────────────────────────

pub struct RewriteBullets {
    llm: Arc<dyn TextGenerator>,
}

impl RewriteBullets {
    pub fn new(llm: Arc<dyn TextGenerator>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl StepExecutor for RewriteBullets {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let inputs = RewriteInputs::load(ctx).await?;

        let prompt = BULLETS_PROMPT_TEMPLATE
            .replace("{grounding_instruction}", GROUNDING_INSTRUCTION)
            .replace("{scope_instruction}", SCOPE_INSTRUCTION)
            .replace("{tone}", &inputs.tone())
            .replace("{research}", &inputs.research_text())
            .replace("{entries_json}", &inputs.entries_json())
            .replace("{keywords_json}", &inputs.keywords_json());

        let generated: RewrittenBullets =
            generate_json(self.llm.as_ref(), &prompt, &json_system(BULLETS_ROLE))
                .await
                .map_err(|e| StepError::Failed(format!("bullet generation failed: {e}")))?;
        if generated.bullets.is_empty() {
            return Err(StepError::Failed("no bullets generated".to_string()));
        }
        info!("Generated {} bullets", generated.bullets.len());

        let metadata = json!({
            "bullet_count": generated.bullets.len(),
            "used_research": inputs.research.is_some(),
        });
        Ok(StepOutput::new(encode(&generated)?).with_metadata(metadata))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::llm_client::testing::CannedGenerator;
    use crate::pipeline::models::{Run, RunStatus};
    use crate::pipeline::store::{MemoryPipelineStore, PipelineStore};

    const ENTRY: &str = "7f0c3c1e-57a4-4c37-9a51-3b2f1c0e9d11";

    async fn ctx(step: StepName, with_research: bool) -> StepContext {
        let store = Arc::new(MemoryPipelineStore::new());
        let run = Run {
            id: Uuid::new_v4(),
            user_id: None,
            company_name: Some("Acme".to_string()),
            role_title: Some("Rust Engineer".to_string()),
            source_url: None,
            job_text: None,
            status: RunStatus::Running,
            created_at: Utc::now(),
            completed_at: None,
        };

        let mut artifacts = BTreeMap::new();
        let put = |name: StepName, content: serde_json::Value| {
            let store = store.clone();
            let run_id = run.id;
            async move {
                let a = store.put_artifact(run_id, name, content, Utc::now()).await.unwrap();
                (name.as_str().to_string(), a.id)
            }
        };
        let (k, v) = put(
            StepName::ParseJob,
            json!({ "keyword_inventory": [
                {"keyword": "Rust", "frequency": 1, "position_weight": 1.0, "weighted_score": 1.0}
            ]}),
        )
        .await;
        artifacts.insert(k, v);
        let (k, v) = put(
            StepName::SelectExperience,
            json!({
                "selected": [{
                    "entry": {
                        "entry_id": ENTRY,
                        "entry_type": "experience",
                        "raw_text": "Built Rust services",
                        "tags": ["rust"],
                        "contribution_type": "sole_author",
                        "impact_score": 0.8,
                        "recency_score": 1.0
                    },
                    "combined_score": 0.9,
                    "job_relevance": 1.0,
                    "matched_keywords": ["Rust"]
                }],
                "excluded": []
            }),
        )
        .await;
        artifacts.insert(k, v);
        if with_research {
            let (k, v) = put(
                StepName::ResearchCompany,
                json!({ "company_name": "Acme", "summary": "Rockets.", "talking_points": ["launch cadence"] }),
            )
            .await;
            artifacts.insert(k, v);
        }

        StepContext::new(run, step, None, artifacts, store)
    }

    #[tokio::test]
    async fn test_bullets_prompt_contains_entries_and_research() {
        let ctx = ctx(StepName::RewriteBullets, true).await;
        let reply = format!(
            r#"{{"bullets": [{{"text": "Built Rust services handling 10k rps", "source_entry_id": "{ENTRY}"}}]}}"#
        );
        let llm = Arc::new(CannedGenerator::replying(&[reply.as_str()]));

        let out = RewriteBullets::new(llm.clone()).execute(&ctx).await.unwrap();
        assert_eq!(out.content["bullets"][0]["source_entry_id"], ENTRY);
        assert_eq!(out.metadata["used_research"], true);

        let prompt = llm.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains(ENTRY));
        assert!(prompt.contains("launch cadence"));
        assert!(prompt.contains("\"Rust\""));
    }

    #[tokio::test]
    async fn test_summary_works_without_research() {
        let ctx = ctx(StepName::RewriteSummary, false).await;
        let llm = Arc::new(CannedGenerator::replying(&[
            r#"{"summary": "Rust engineer.", "source_entry_ids": []}"#,
        ]));

        let out = RewriteSummary::new(llm.clone()).execute(&ctx).await.unwrap();
        assert_eq!(out.content["summary"], "Rust engineer.");
        assert_eq!(out.metadata["used_research"], false);
        assert!(llm.prompts.lock().unwrap()[0].contains("\"Rust Engineer\" at Acme"));
    }

    #[tokio::test]
    async fn test_empty_bullets_fail_the_step() {
        let ctx = ctx(StepName::RewriteBullets, false).await;
        let llm = Arc::new(CannedGenerator::replying(&[r#"{"bullets": []}"#]));
        let err = RewriteBullets::new(llm).execute(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("no bullets"));
    }
}
