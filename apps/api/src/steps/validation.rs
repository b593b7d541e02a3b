//! `validate_document`: pure checks over the rewritten document.
//!
//! A bullet citing an entry that was not selected fails the step. Everything
//! else lands in the report without failing it.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::pipeline::executor::{StepContext, StepError, StepExecutor, StepOutput};
use crate::pipeline::registry::StepName;
use crate::steps::experience::Selection;
use crate::steps::rewriting::{RewrittenBullets, RewrittenSummary};

const VAGUE_VERBS: &[&str] = &[
    "improved",
    "enhanced",
    "helped",
    "worked on",
    "assisted",
    "supported",
    "participated",
    "involved",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    pub code: String,
    pub message: String,
}

impl ValidationIssue {
    fn error(code: &str, message: String) -> Self {
        Self {
            severity: IssueSeverity::Error,
            code: code.to_string(),
            message,
        }
    }

    fn warning(code: &str, message: String) -> Self {
        Self {
            severity: IssueSeverity::Warning,
            code: code.to_string(),
            message,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub bullet_count: usize,
    pub cited_entries: Vec<String>,
    pub unknown_citations: Vec<String>,
    pub issues: Vec<ValidationIssue>,
}

/// Checks `summary` and `bullets` against the selected entry ids.
pub fn validate(
    summary: Option<&RewrittenSummary>,
    bullets: Option<&RewrittenBullets>,
    selected: &HashSet<String>,
) -> ValidationReport {
    let mut issues = Vec::new();

    match summary {
        Some(s) if !s.summary.trim().is_empty() => {
            for id in s.source_entry_ids.iter().filter(|id| !selected.contains(*id)) {
                issues.push(ValidationIssue::warning(
                    "SUMMARY_UNKNOWN_SOURCE",
                    format!("summary cites entry {id}, which was not selected"),
                ));
            }
        }
        _ => issues.push(ValidationIssue::error(
            "MISSING_SUMMARY",
            "document has no summary".to_string(),
        )),
    }

    let bullets = bullets.map(|b| b.bullets.as_slice()).unwrap_or_default();
    if bullets.is_empty() {
        issues.push(ValidationIssue::error(
            "NO_BULLETS",
            "document has no bullets".to_string(),
        ));
    }

    let mut cited = Vec::new();
    let mut unknown = Vec::new();
    for (i, bullet) in bullets.iter().enumerate() {
        let id = bullet.source_entry_id.trim();
        if bullet.text.trim().is_empty() {
            issues.push(ValidationIssue::error(
                "EMPTY_BULLET",
                format!("bullet {} has no text", i + 1),
            ));
        }
        if selected.contains(id) {
            if !cited.iter().any(|c| c == id) {
                cited.push(id.to_string());
            }
        } else {
            unknown.push(id.to_string());
            issues.push(ValidationIssue::error(
                "UNKNOWN_CITATION",
                format!("bullet {} cites entry '{id}', which was not selected", i + 1),
            ));
        }
        if let Some(verb) = vague_unquantified(&bullet.text) {
            issues.push(ValidationIssue::warning(
                "UNQUANTIFIED_IMPACT",
                format!("bullet {} uses '{verb}' without a metric", i + 1),
            ));
        }
    }

    ValidationReport {
        passed: !issues.iter().any(|i| i.severity == IssueSeverity::Error),
        bullet_count: bullets.len(),
        cited_entries: cited,
        unknown_citations: unknown,
        issues,
    }
}

/// The first vague verb in `text` when the bullet carries no number, percent
/// or currency sign.
fn vague_unquantified(text: &str) -> Option<&'static str> {
    let quantified = text
        .chars()
        .any(|c| c.is_ascii_digit() || matches!(c, '%' | '$' | '€' | '£'));
    if quantified {
        return None;
    }
    let lower = text.to_lowercase();
    VAGUE_VERBS.iter().copied().find(|v| lower.contains(v))
}

pub struct ValidateDocument;

#[async_trait]
impl StepExecutor for ValidateDocument {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let selection: Selection = decode(ctx, StepName::SelectExperience)
            .await?
            .ok_or(StepError::MissingInput(StepName::SelectExperience))?;
        let summary: Option<RewrittenSummary> = decode(ctx, StepName::RewriteSummary).await?;
        let bullets: Option<RewrittenBullets> = decode(ctx, StepName::RewriteBullets).await?;

        let selected: HashSet<String> = selection
            .selected_ids()
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        let report = validate(summary.as_ref(), bullets.as_ref(), &selected);

        if !report.unknown_citations.is_empty() {
            warn!(
                "Validation rejected {} bullet citation(s): {:?}",
                report.unknown_citations.len(),
                report.unknown_citations
            );
            return Err(StepError::Failed(format!(
                "bullets cite entries that were not selected: {}",
                report.unknown_citations.join(", ")
            )));
        }
        info!(
            "Validation {} with {} issue(s)",
            if report.passed { "passed" } else { "flagged" },
            report.issues.len()
        );

        let metadata = json!({ "passed": report.passed, "issues": report.issues.len() });
        let content = serde_json::to_value(&report)
            .map_err(|e| StepError::Failed(format!("could not encode step output: {e}")))?;
        Ok(StepOutput::new(content).with_metadata(metadata))
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    ctx: &StepContext,
    step: StepName,
) -> Result<Option<T>, StepError> {
    ctx.artifact(step)
        .await?
        .map(|v| {
            serde_json::from_value(v)
                .map_err(|e| StepError::Failed(format!("unreadable {step} artifact: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::rewriting::Bullet;

    fn selected(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn summary(text: &str) -> RewrittenSummary {
        RewrittenSummary {
            summary: text.to_string(),
            source_entry_ids: vec![],
        }
    }

    fn bullets(items: &[(&str, &str)]) -> RewrittenBullets {
        RewrittenBullets {
            bullets: items
                .iter()
                .map(|(text, id)| Bullet {
                    text: text.to_string(),
                    source_entry_id: id.to_string(),
                    jd_keywords_used: vec![],
                })
                .collect(),
        }
    }

    #[test]
    fn test_clean_document_passes() {
        let report = validate(
            Some(&summary("Rust engineer")),
            Some(&bullets(&[("Cut p99 latency by 40%", "a"), ("Shipped 3 services", "a")])),
            &selected(&["a", "b"]),
        );
        assert!(report.passed);
        assert_eq!(report.bullet_count, 2);
        assert_eq!(report.cited_entries, vec!["a".to_string()]);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn test_unknown_citation_is_reported() {
        let report = validate(
            Some(&summary("s")),
            Some(&bullets(&[("Did 5 things", "zzz")])),
            &selected(&["a"]),
        );
        assert!(!report.passed);
        assert_eq!(report.unknown_citations, vec!["zzz".to_string()]);
        assert_eq!(report.issues[0].code, "UNKNOWN_CITATION");
    }

    #[test]
    fn test_missing_summary_and_empty_bullet_are_errors() {
        let report = validate(None, Some(&bullets(&[("  ", "a")])), &selected(&["a"]));
        assert!(!report.passed);
        let codes: Vec<&str> = report.issues.iter().map(|i| i.code.as_str()).collect();
        assert_eq!(codes, vec!["MISSING_SUMMARY", "EMPTY_BULLET"]);
    }

    #[test]
    fn test_skipped_bullets_are_flagged() {
        let report = validate(Some(&summary("s")), None, &selected(&[]));
        assert_eq!(report.issues[0].code, "NO_BULLETS");
    }

    #[test]
    fn test_vague_verbs_only_warn_when_unquantified() {
        assert_eq!(vague_unquantified("Helped the team"), Some("helped"));
        assert_eq!(vague_unquantified("Improved throughput 3x"), None);
        assert_eq!(vague_unquantified("Designed the API"), None);

        let report = validate(
            Some(&summary("s")),
            Some(&bullets(&[("Worked on billing", "a")])),
            &selected(&["a"]),
        );
        assert!(report.passed);
        assert_eq!(report.issues[0].severity, IssueSeverity::Warning);
    }
}
