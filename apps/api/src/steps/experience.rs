//! Experience steps: load the candidate's experience bank, then rank it
//! against the parsed job.
//!
//! Ranking is a pure function: no text-generation calls.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{FromRow, PgPool};
use tracing::info;
use uuid::Uuid;

use crate::pipeline::executor::{StepContext, StepError, StepExecutor, StepOutput};
use crate::pipeline::registry::StepName;
use crate::steps::ingestion::ParsedJob;

/// Default number of entries kept by `select_experience`.
const DEFAULT_SELECTION_LIMIT: usize = 8;

// ────────────────────────────────────────────────────────────────────────────
// Data models
// ────────────────────────────────────────────────────────────────────────────

/// One experience-bank entry: a role, project or achievement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ExperienceEntry {
    pub entry_id: Uuid,
    pub entry_type: String,
    pub raw_text: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_contribution")]
    pub contribution_type: String,
    #[serde(default)]
    pub impact_score: f64,
    #[serde(default = "default_recency")]
    pub recency_score: f64,
}

fn default_contribution() -> String {
    "team_member".to_string()
}

fn default_recency() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedExperience {
    /// `parameters` or `database`
    pub source: String,
    pub entries: Vec<ExperienceEntry>,
}

/// Weights for the combined score: 0.5*recency + 0.3*impact + 0.2*job_relevance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub recency: f64,
    pub impact: f64,
    pub job_relevance: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            recency: 0.5,
            impact: 0.3,
            job_relevance: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedEntry {
    pub entry: ExperienceEntry,
    pub combined_score: f64,
    pub job_relevance: f64,
    pub matched_keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExcludedEntry {
    pub entry_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    pub selected: Vec<RankedEntry>,
    pub excluded: Vec<ExcludedEntry>,
}

impl Selection {
    pub fn selected_ids(&self) -> HashSet<Uuid> {
        self.selected.iter().map(|r| r.entry.entry_id).collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// load_experience
// ────────────────────────────────────────────────────────────────────────────

pub struct LoadExperience {
    pool: Option<PgPool>,
}

impl LoadExperience {
    pub fn new(pool: Option<PgPool>) -> Self {
        Self { pool }
    }
}

/// Current version of every entry for `user_id`.
pub async fn fetch_current_entries(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Vec<ExperienceEntry>, sqlx::Error> {
    sqlx::query_as::<_, ExperienceEntry>(
        r#"
        SELECT DISTINCT ON (entry_id)
            entry_id, entry_type, raw_text, tags, contribution_type, impact_score, recency_score
        FROM context_entries
        WHERE user_id = $1
        ORDER BY entry_id, version DESC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
}

#[async_trait]
impl StepExecutor for LoadExperience {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let loaded = if let Some(entries) = ctx.parameters.get("entries") {
            let entries: Vec<ExperienceEntry> = serde_json::from_value(entries.clone())
                .map_err(|e| StepError::InvalidParameters(format!("entries: {e}")))?;
            LoadedExperience {
                source: "parameters".to_string(),
                entries,
            }
        } else {
            let user_id = ctx.run.user_id.ok_or_else(|| {
                StepError::InvalidParameters(
                    "run has no user_id and no entries were supplied".to_string(),
                )
            })?;
            let pool = self.pool.as_ref().ok_or_else(|| {
                StepError::Failed("no database configured for the experience bank".to_string())
            })?;
            let entries = fetch_current_entries(pool, user_id)
                .await
                .map_err(|e| StepError::Failed(format!("failed to load experience: {e}")))?;
            LoadedExperience {
                source: "database".to_string(),
                entries,
            }
        };

        if loaded.entries.is_empty() {
            return Err(StepError::Failed("experience bank is empty".to_string()));
        }
        info!(
            "Loaded {} experience entries from {}",
            loaded.entries.len(),
            loaded.source
        );

        let metadata = json!({ "entry_count": loaded.entries.len(), "source": loaded.source });
        Ok(StepOutput::new(to_value(&loaded)?).with_metadata(metadata))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// select_experience
// ────────────────────────────────────────────────────────────────────────────

pub struct SelectExperience;

#[async_trait]
impl StepExecutor for SelectExperience {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let parsed: ParsedJob = read_artifact(ctx, StepName::ParseJob).await?;
        let loaded: LoadedExperience = read_artifact(ctx, StepName::LoadExperience).await?;
        let limit = ctx
            .parameters
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_SELECTION_LIMIT);

        let selection = select_entries(loaded.entries, &parsed, limit, &ScoringWeights::default());
        if selection.selected.is_empty() {
            return Err(StepError::Failed("no experience entries selected".to_string()));
        }

        let metadata = json!({
            "selected": selection.selected.len(),
            "excluded": selection.excluded.len(),
        });
        Ok(StepOutput::new(to_value(&selection)?).with_metadata(metadata))
    }
}

/// Ranks `entries` by combined score and keeps the top `limit`.
pub fn select_entries(
    entries: Vec<ExperienceEntry>,
    parsed: &ParsedJob,
    limit: usize,
    weights: &ScoringWeights,
) -> Selection {
    let mut ranked: Vec<RankedEntry> = entries
        .into_iter()
        .map(|entry| {
            let (job_relevance, matched_keywords) = job_relevance(&entry, parsed);
            let combined_score = (weights.recency * entry.recency_score
                + weights.impact * entry.impact_score
                + weights.job_relevance * job_relevance)
                .clamp(0.0, 1.0);
            RankedEntry {
                entry,
                combined_score,
                job_relevance,
                matched_keywords,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.entry.entry_id.cmp(&b.entry.entry_id))
    });

    let mut selected = Vec::new();
    let mut excluded = Vec::new();
    for r in ranked {
        if r.entry.raw_text.as_deref().map_or(true, |t| t.trim().is_empty()) {
            excluded.push(ExcludedEntry {
                entry_id: r.entry.entry_id,
                reason: "entry has no text".to_string(),
            });
        } else if selected.len() >= limit {
            excluded.push(ExcludedEntry {
                entry_id: r.entry.entry_id,
                reason: format!("below top {limit} (score {:.2})", r.combined_score),
            });
        } else {
            selected.push(r);
        }
    }

    Selection { selected, excluded }
}

/// Share of the job's weighted keywords that an entry mentions (tags or text),
/// plus the keywords it matched.
pub fn job_relevance(entry: &ExperienceEntry, parsed: &ParsedJob) -> (f64, Vec<String>) {
    let total: f32 = parsed.keyword_inventory.iter().map(|k| k.weighted_score).sum();
    if total <= 0.0 {
        return (0.0, Vec::new());
    }

    let text = entry.raw_text.as_deref().unwrap_or_default().to_lowercase();
    let mut matched_weight = 0.0f32;
    let mut matched = Vec::new();
    for kw in &parsed.keyword_inventory {
        let needle = kw.keyword.to_lowercase();
        let tag_hit = entry.tags.iter().any(|t| t.to_lowercase() == needle);
        if tag_hit || text.contains(&needle) {
            matched_weight += kw.weighted_score;
            matched.push(kw.keyword.clone());
        }
    }
    ((matched_weight / total) as f64, matched)
}

async fn read_artifact<T: serde::de::DeserializeOwned>(
    ctx: &StepContext,
    step: StepName,
) -> Result<T, StepError> {
    serde_json::from_value(ctx.require_artifact(step).await?)
        .map_err(|e| StepError::Failed(format!("unreadable {step} artifact: {e}")))
}

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value, StepError> {
    serde_json::to_value(value)
        .map_err(|e| StepError::Failed(format!("could not encode step output: {e}")))
}
