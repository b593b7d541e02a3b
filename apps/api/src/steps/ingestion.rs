//! Ingestion steps: obtain the job posting text, then parse it into a
//! structured description.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::llm_client::prompts::json_system;
use crate::llm_client::{generate_json, TextGenerator};
use crate::pipeline::executor::{StepContext, StepError, StepExecutor, StepOutput};
use crate::pipeline::models::SubjectUpdate;
use crate::pipeline::registry::StepName;
use crate::steps::prompts::{PARSE_JOB_PROMPT_TEMPLATE, PARSE_JOB_ROLE};

/// Postings longer than this are truncated before parsing.
const MAX_JOB_TEXT_CHARS: usize = 20_000;

// ────────────────────────────────────────────────────────────────────────────
// ingest_job
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestedJob {
    /// Where the text came from: `parameters`, `run`, or `url`.
    pub source: String,
    pub source_url: Option<String>,
    pub text: String,
    pub char_count: usize,
}

pub struct IngestJob {
    http: reqwest::Client,
}

impl IngestJob {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn fetch(&self, url: &str) -> Result<String, StepError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| StepError::Failed(format!("failed to fetch {url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(StepError::Failed(format!(
                "fetching {url} returned HTTP {status}"
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| StepError::Failed(format!("failed to read {url}: {e}")))?;
        Ok(html_to_text(&body))
    }
}

#[async_trait]
impl StepExecutor for IngestJob {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let source_url = ctx
            .parameter_str("source_url")
            .map(str::to_string)
            .or_else(|| ctx.run.source_url.clone());

        let (source, raw) = if let Some(text) = ctx.parameter_str("job_text") {
            ("parameters", text.to_string())
        } else if let Some(text) = ctx.run.job_text.as_deref().filter(|t| !t.trim().is_empty()) {
            ("run", text.to_string())
        } else if let Some(url) = source_url.as_deref() {
            info!("Fetching job posting from {url}");
            ("url", self.fetch(url).await?)
        } else {
            return Err(StepError::InvalidParameters(
                "no job_text or source_url available for this run".to_string(),
            ));
        };

        let text = truncate_chars(collapse_whitespace(&raw).as_str(), MAX_JOB_TEXT_CHARS);
        if text.is_empty() {
            return Err(StepError::Failed("job posting text is empty".to_string()));
        }

        let ingested = IngestedJob {
            source: source.to_string(),
            char_count: text.chars().count(),
            source_url: source_url.clone(),
            text,
        };
        let mut output = StepOutput::new(serde_json::to_value(&ingested).map_err(invalid)?)
            .with_metadata(json!({ "source": source, "char_count": ingested.char_count }));
        if source_url.is_some() && ctx.run.source_url != source_url {
            output = output.with_subject(SubjectUpdate {
                source_url,
                ..Default::default()
            });
        }
        Ok(output)
    }
}

/// Reduces an HTML page to readable text: drops script and style bodies and
/// all tags, decodes common entities, collapses whitespace. Plain text passes
/// through unchanged apart from whitespace.
pub fn html_to_text(html: &str) -> String {
    let without_blocks = strip_blocks(&strip_blocks(html, "script"), "style");

    let mut text = String::with_capacity(without_blocks.len());
    let mut in_tag = false;
    for c in without_blocks.chars() {
        match c {
            '<' => {
                in_tag = true;
                text.push(' ');
            }
            '>' if in_tag => in_tag = false,
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }

    let decoded = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    collapse_whitespace(&decoded)
}

/// Removes every `<tag ...>...</tag>` block, case-insensitively.
fn strip_blocks(html: &str, tag: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let open = format!("<{tag}");
    let close = format!("</{tag}>");

    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;
    while let Some(start) = lower[cursor..].find(&open).map(|i| i + cursor) {
        out.push_str(&html[cursor..start]);
        match lower[start..].find(&close) {
            Some(end) => cursor = start + end + close.len(),
            None => return out,
        }
    }
    out.push_str(&html[cursor..]);
    out
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn invalid(e: serde_json::Error) -> StepError {
    StepError::Failed(format!("could not encode step output: {e}"))
}

// ────────────────────────────────────────────────────────────────────────────
// parse_job
// ────────────────────────────────────────────────────────────────────────────

/// Detected tone of a job posting. Drives verb selection when rewriting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum JobTone {
    AggressiveStartup,
    #[default]
    CollaborativeEnterprise,
    ResearchOriented,
    ProductOriented,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirement {
    pub text: String,
    pub is_required: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleSignals {
    pub is_startup: bool,
    pub is_ic_focused: bool,
    pub is_research: bool,
    pub seniority: String,
}

/// A keyword weighted by where and how often it appears in the posting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordEntry {
    pub keyword: String,
    pub frequency: u32,
    /// title=1.0, requirements=0.8, responsibilities=0.6, about=0.3
    pub position_weight: f32,
    /// frequency * position_weight
    pub weighted_score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedJob {
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub role_title: Option<String>,
    #[serde(default)]
    pub hard_requirements: Vec<Requirement>,
    #[serde(default)]
    pub soft_signals: Vec<String>,
    #[serde(default)]
    pub role_signals: RoleSignals,
    #[serde(default)]
    pub keyword_inventory: Vec<KeywordEntry>,
    #[serde(default)]
    pub detected_tone: JobTone,
}

impl ParsedJob {
    pub fn subject(&self) -> SubjectUpdate {
        SubjectUpdate {
            company_name: self.company_name.clone(),
            role_title: self.role_title.clone(),
            source_url: None,
        }
    }
}

pub struct ParseJob {
    llm: Arc<dyn TextGenerator>,
}

impl ParseJob {
    pub fn new(llm: Arc<dyn TextGenerator>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl StepExecutor for ParseJob {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let ingested: IngestedJob = serde_json::from_value(
            ctx.require_artifact(StepName::IngestJob).await?,
        )
        .map_err(|e| StepError::Failed(format!("unreadable ingest_job artifact: {e}")))?;

        let prompt = PARSE_JOB_PROMPT_TEMPLATE.replace("{job_text}", &ingested.text);
        let parsed: ParsedJob = generate_json(
            self.llm.as_ref(),
            &prompt,
            &json_system(PARSE_JOB_ROLE),
        )
        .await
        .map_err(|e| StepError::Failed(format!("job parsing failed: {e}")))?;

        info!(
            "Parsed job: {:?} at {:?}, {} keywords",
            parsed.role_title,
            parsed.company_name,
            parsed.keyword_inventory.len()
        );

        let metadata = json!({
            "keyword_count": parsed.keyword_inventory.len(),
            "requirement_count": parsed.hard_requirements.len(),
            "tone": parsed.detected_tone,
        });
        let subject = parsed.subject();
        Ok(
            StepOutput::new(serde_json::to_value(&parsed).map_err(invalid)?)
                .with_metadata(metadata)
                .with_subject(subject),
        )
    }
}
