//! Pure classification of a run's steps into
//! completed / available / blocked, and per-step prerequisite validation.
//!
//! Nothing here touches storage. Callers load the run's `RunStep` rows and
//! hand them in as a [`StepStatuses`] snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::models::{RunStep, StepStatus};
use crate::pipeline::registry::{StepCategory, StepDefinition, StepName, StepRegistry};

/// A failed prerequisite check: the requested step and the prerequisites
/// that have not reached a satisfying status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("step '{step}' is missing dependencies: {missing_dependencies:?}")]
pub struct DependencyError {
    pub step: StepName,
    pub missing_dependencies: Vec<StepName>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error(transparent)]
    Dependencies(#[from] DependencyError),
}

/// Persisted status per step for one run. Steps without a row are absent.
#[derive(Debug, Clone, Default)]
pub struct StepStatuses(HashMap<StepName, StepStatus>);

impl StepStatuses {
    pub fn from_steps(steps: &[RunStep]) -> Self {
        Self(steps.iter().map(|s| (s.step, s.status)).collect())
    }

    pub fn get(&self, step: StepName) -> Option<StepStatus> {
        self.0.get(&step).copied()
    }

    pub fn set(&mut self, step: StepName, status: StepStatus) {
        self.0.insert(step, status);
    }

    fn is(&self, step: StepName, status: StepStatus) -> bool {
        self.get(step) == Some(status)
    }
}

/// Disjoint partition of every registry step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepAvailability {
    pub completed: Vec<StepName>,
    pub available: Vec<StepName>,
    pub blocked: Vec<StepName>,
}

/// Display state of a step. `Available` and `Blocked` are derived from
/// pending (or absent) rows and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Available,
    Blocked,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepView {
    pub step: StepName,
    pub category: StepCategory,
    pub state: StepState,
    pub dependencies: Vec<StepName>,
    pub missing_dependencies: Vec<StepName>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub artifact_id: Option<Uuid>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CategorySummary {
    pub total: usize,
    pub completed: usize,
    pub available: usize,
    pub blocked: usize,
    pub in_progress: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct DependencyResolver {
    registry: Arc<StepRegistry>,
}

impl DependencyResolver {
    pub fn new(registry: Arc<StepRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Prerequisites of `definition` not yet completed (or skipped).
    pub fn missing_dependencies(
        &self,
        statuses: &StepStatuses,
        definition: &StepDefinition,
    ) -> Vec<StepName> {
        definition
            .dependencies
            .iter()
            .filter(|dep| !statuses.get(**dep).is_some_and(|s| s.satisfies_dependents()))
            .copied()
            .collect()
    }

    pub fn validate_dependencies(
        &self,
        statuses: &StepStatuses,
        step: &str,
    ) -> Result<&StepDefinition, ValidationError> {
        let definition = self
            .registry
            .lookup_str(step)
            .ok_or_else(|| ValidationError::UnknownStep(step.to_string()))?;

        let missing_dependencies = self.missing_dependencies(statuses, definition);
        if !missing_dependencies.is_empty() {
            return Err(DependencyError {
                step: definition.name,
                missing_dependencies,
            }
            .into());
        }
        Ok(definition)
    }

    /// Steps whose prerequisites are satisfied and which have no row yet or
    /// a `pending` row. Registry order.
    pub fn available_steps(&self, statuses: &StepStatuses) -> Vec<StepName> {
        self.registry
            .all()
            .iter()
            .filter(|def| self.is_available(statuses, def))
            .map(|def| def.name)
            .collect()
    }

    /// Everything neither available nor completed, including failed,
    /// skipped and in-progress steps.
    pub fn blocked_steps(&self, statuses: &StepStatuses) -> Vec<StepName> {
        self.registry
            .all()
            .iter()
            .filter(|def| {
                !statuses.is(def.name, StepStatus::Completed) && !self.is_available(statuses, def)
            })
            .map(|def| def.name)
            .collect()
    }

    pub fn completed_steps(&self, statuses: &StepStatuses) -> Vec<StepName> {
        self.registry
            .names()
            .filter(|name| statuses.is(*name, StepStatus::Completed))
            .collect()
    }

    pub fn classify(&self, statuses: &StepStatuses) -> StepAvailability {
        StepAvailability {
            completed: self.completed_steps(statuses),
            available: self.available_steps(statuses),
            blocked: self.blocked_steps(statuses),
        }
    }

    /// True once every step is completed or skipped.
    pub fn is_finished(&self, statuses: &StepStatuses) -> bool {
        self.registry
            .names()
            .all(|name| statuses.get(name).is_some_and(|s| s.satisfies_dependents()))
    }

    fn is_available(&self, statuses: &StepStatuses, definition: &StepDefinition) -> bool {
        matches!(statuses.get(definition.name), None | Some(StepStatus::Pending))
            && self.missing_dependencies(statuses, definition).is_empty()
    }

    /// One view per registry step, merging persisted rows with derived state.
    pub fn step_views(&self, steps: &[RunStep]) -> Vec<StepView> {
        let statuses = StepStatuses::from_steps(steps);
        let rows: HashMap<StepName, &RunStep> = steps.iter().map(|s| (s.step, s)).collect();

        self.registry
            .all()
            .iter()
            .map(|def| {
                let row = rows.get(&def.name).copied();
                let missing_dependencies = self.missing_dependencies(&statuses, def);
                let state = match row.map(|r| r.status) {
                    Some(StepStatus::InProgress) => StepState::InProgress,
                    Some(StepStatus::Completed) => StepState::Completed,
                    Some(StepStatus::Failed) => StepState::Failed,
                    Some(StepStatus::Skipped) => StepState::Skipped,
                    None | Some(StepStatus::Pending) if missing_dependencies.is_empty() => {
                        StepState::Available
                    }
                    None | Some(StepStatus::Pending) => StepState::Blocked,
                };
                StepView {
                    step: def.name,
                    category: def.category,
                    state,
                    dependencies: def.dependencies.clone(),
                    missing_dependencies,
                    started_at: row.and_then(|r| r.started_at),
                    completed_at: row.and_then(|r| r.completed_at),
                    duration_ms: row.and_then(|r| r.duration_ms),
                    artifact_id: row.and_then(|r| r.artifact_id),
                    error_message: row.and_then(|r| r.error_message.clone()),
                }
            })
            .collect()
    }
}

/// Per-category counts over a set of step views.
pub fn summarize_by_category(views: &[StepView]) -> BTreeMap<String, CategorySummary> {
    let mut summary: BTreeMap<String, CategorySummary> = BTreeMap::new();
    for view in views {
        let entry = summary.entry(view.category.as_str().to_string()).or_default();
        entry.total += 1;
        match view.state {
            StepState::Available => entry.available += 1,
            StepState::Blocked => entry.blocked += 1,
            StepState::InProgress => entry.in_progress += 1,
            StepState::Completed => entry.completed += 1,
            StepState::Failed => entry.failed += 1,
            StepState::Skipped => entry.skipped += 1,
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn two_step_resolver() -> DependencyResolver {
        let registry = StepRegistry::new(vec![
            StepDefinition::new(StepName::IngestJob, StepCategory::Ingestion, &[]),
            StepDefinition::new(StepName::ParseJob, StepCategory::Ingestion, &[StepName::IngestJob]),
        ])
        .unwrap();
        DependencyResolver::new(Arc::new(registry))
    }

    fn standard_resolver() -> DependencyResolver {
        DependencyResolver::new(Arc::new(StepRegistry::standard().unwrap()))
    }

    fn assert_partition(resolver: &DependencyResolver, statuses: &StepStatuses) {
        let a = resolver.classify(statuses);
        let all: Vec<StepName> = resolver.registry().names().collect();
        let mut seen = HashSet::new();
        for name in a.completed.iter().chain(&a.available).chain(&a.blocked) {
            assert!(seen.insert(*name), "{name} appears in more than one set");
        }
        assert_eq!(seen.len(), all.len());
    }

    #[test]
    fn test_new_run_partition() {
        let resolver = two_step_resolver();
        let statuses = StepStatuses::default();
        assert_eq!(resolver.available_steps(&statuses), vec![StepName::IngestJob]);
        assert_eq!(resolver.blocked_steps(&statuses), vec![StepName::ParseJob]);
        assert_partition(&resolver, &statuses);
    }

    #[test]
    fn test_zero_dependency_steps_always_validate() {
        let resolver = standard_resolver();
        let statuses = StepStatuses::default();
        for def in resolver.registry().all().iter().filter(|d| d.dependencies.is_empty()) {
            assert!(resolver.validate_dependencies(&statuses, def.name.as_str()).is_ok());
        }
    }

    #[test]
    fn test_missing_dependency_reported() {
        let resolver = two_step_resolver();
        let err = resolver
            .validate_dependencies(&StepStatuses::default(), "parse_job")
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::Dependencies(DependencyError {
                step: StepName::ParseJob,
                missing_dependencies: vec![StepName::IngestJob],
            })
        );
    }

    #[test]
    fn test_unknown_step_is_distinct() {
        let resolver = two_step_resolver();
        let err = resolver
            .validate_dependencies(&StepStatuses::default(), "not_a_real_step")
            .unwrap_err();
        assert!(matches!(err, ValidationError::UnknownStep(s) if s == "not_a_real_step"));
    }

    #[test]
    fn test_in_progress_dependency_does_not_satisfy() {
        let resolver = two_step_resolver();
        let mut statuses = StepStatuses::default();
        statuses.set(StepName::IngestJob, StepStatus::InProgress);
        assert!(resolver.available_steps(&statuses).is_empty());
        assert!(resolver.validate_dependencies(&statuses, "parse_job").is_err());
        assert_partition(&resolver, &statuses);
    }

    #[test]
    fn test_skipped_dependency_unblocks_dependents() {
        let resolver = standard_resolver();
        let mut statuses = StepStatuses::default();
        statuses.set(StepName::IngestJob, StepStatus::Completed);
        statuses.set(StepName::ParseJob, StepStatus::Completed);
        statuses.set(StepName::ResearchCompany, StepStatus::Skipped);
        statuses.set(StepName::LoadExperience, StepStatus::Completed);
        statuses.set(StepName::SelectExperience, StepStatus::Completed);

        let available = resolver.available_steps(&statuses);
        assert_eq!(
            available,
            vec![StepName::RewriteSummary, StepName::RewriteBullets]
        );
        assert!(resolver.blocked_steps(&statuses).contains(&StepName::ResearchCompany));
        assert_partition(&resolver, &statuses);
    }

    #[test]
    fn test_failed_step_is_blocked_until_reset() {
        let resolver = two_step_resolver();
        let mut statuses = StepStatuses::default();
        statuses.set(StepName::IngestJob, StepStatus::Failed);
        assert!(resolver.available_steps(&statuses).is_empty());
        assert_eq!(
            resolver.blocked_steps(&statuses),
            vec![StepName::IngestJob, StepName::ParseJob]
        );

        statuses.set(StepName::IngestJob, StepStatus::Pending);
        assert_eq!(resolver.available_steps(&statuses), vec![StepName::IngestJob]);
    }

    #[test]
    fn test_partition_holds_for_every_status_combination() {
        let resolver = two_step_resolver();
        let options = [
            None,
            Some(StepStatus::Pending),
            Some(StepStatus::InProgress),
            Some(StepStatus::Completed),
            Some(StepStatus::Failed),
            Some(StepStatus::Skipped),
        ];
        for a in options {
            for b in options {
                let mut statuses = StepStatuses::default();
                if let Some(s) = a {
                    statuses.set(StepName::IngestJob, s);
                }
                if let Some(s) = b {
                    statuses.set(StepName::ParseJob, s);
                }
                assert_partition(&resolver, &statuses);
            }
        }
    }

    #[test]
    fn test_step_views_and_summary() {
        let resolver = two_step_resolver();
        let views = resolver.step_views(&[]);
        assert_eq!(views[0].state, StepState::Available);
        assert_eq!(views[1].state, StepState::Blocked);
        assert_eq!(views[1].missing_dependencies, vec![StepName::IngestJob]);

        let summary = summarize_by_category(&views);
        let ingestion = &summary["ingestion"];
        assert_eq!(ingestion.total, 2);
        assert_eq!(ingestion.available, 1);
        assert_eq!(ingestion.blocked, 1);
    }
}
