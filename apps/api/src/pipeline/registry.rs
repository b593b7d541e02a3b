//! The immutable catalog of pipeline steps and their prerequisites.
//!
//! Built once at startup and shared by reference (`Arc<StepRegistry>`).
//! Construction rejects unknown dependency names, duplicate steps, and cycles,
//! so every other component may assume a valid DAG.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ────────────────────────────────────────────────────────────────────────────
// Step names and categories
// ────────────────────────────────────────────────────────────────────────────

/// Closed set of step identifiers. Free-form strings from callers are parsed
/// into this type at the boundary; anything else is an unknown step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    IngestJob,
    ParseJob,
    LoadExperience,
    SelectExperience,
    ResearchCompany,
    RewriteSummary,
    RewriteBullets,
    ValidateDocument,
}

impl StepName {
    pub const ALL: [StepName; 8] = [
        StepName::IngestJob,
        StepName::ParseJob,
        StepName::LoadExperience,
        StepName::SelectExperience,
        StepName::ResearchCompany,
        StepName::RewriteSummary,
        StepName::RewriteBullets,
        StepName::ValidateDocument,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::IngestJob => "ingest_job",
            StepName::ParseJob => "parse_job",
            StepName::LoadExperience => "load_experience",
            StepName::SelectExperience => "select_experience",
            StepName::ResearchCompany => "research_company",
            StepName::RewriteSummary => "rewrite_summary",
            StepName::RewriteBullets => "rewrite_bullets",
            StepName::ValidateDocument => "validate_document",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name any known step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown step '{0}'")]
pub struct UnknownStepName(pub String);

impl FromStr for StepName {
    type Err = UnknownStepName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| UnknownStepName(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCategory {
    Ingestion,
    Experience,
    Research,
    Rewriting,
    Validation,
}

impl StepCategory {
    pub const ALL: [StepCategory; 5] = [
        StepCategory::Ingestion,
        StepCategory::Experience,
        StepCategory::Research,
        StepCategory::Rewriting,
        StepCategory::Validation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepCategory::Ingestion => "ingestion",
            StepCategory::Experience => "experience",
            StepCategory::Research => "research",
            StepCategory::Rewriting => "rewriting",
            StepCategory::Validation => "validation",
        }
    }
}

impl fmt::Display for StepCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown step category '{s}'"))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Definitions and registry
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepDefinition {
    pub name: StepName,
    pub category: StepCategory,
    pub dependencies: Vec<StepName>,
}

impl StepDefinition {
    pub fn new(name: StepName, category: StepCategory, dependencies: &[StepName]) -> Self {
        Self {
            name,
            category,
            dependencies: dependencies.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("step '{0}' is defined more than once")]
    DuplicateStep(StepName),

    #[error("step '{step}' depends on '{dependency}', which is not registered")]
    UnknownDependency { step: StepName, dependency: StepName },

    #[error("dependency cycle detected among steps: {0:?}")]
    Cycle(Vec<StepName>),
}

/// Read-only catalog of step definitions, in declaration order.
#[derive(Debug, Clone)]
pub struct StepRegistry {
    steps: Vec<StepDefinition>,
    index: HashMap<StepName, usize>,
}

impl StepRegistry {
    /// Validates the definitions and builds the registry.
    ///
    /// Fails on duplicate names, dependencies on unregistered steps, or a
    /// dependency graph with no valid topological order.
    pub fn new(steps: Vec<StepDefinition>) -> Result<Self, RegistryError> {
        let mut index = HashMap::with_capacity(steps.len());
        for (i, def) in steps.iter().enumerate() {
            if index.insert(def.name, i).is_some() {
                return Err(RegistryError::DuplicateStep(def.name));
            }
        }

        for def in &steps {
            if let Some(dependency) = def.dependencies.iter().find(|d| !index.contains_key(d)) {
                return Err(RegistryError::UnknownDependency {
                    step: def.name,
                    dependency: *dependency,
                });
            }
        }

        let registry = Self { steps, index };
        registry.topological_order()?;
        Ok(registry)
    }

    /// The resume-tailoring workflow used in production.
    pub fn standard() -> Result<Self, RegistryError> {
        use StepCategory::*;
        use StepName::*;

        Self::new(vec![
            StepDefinition::new(IngestJob, Ingestion, &[]),
            StepDefinition::new(ParseJob, Ingestion, &[IngestJob]),
            StepDefinition::new(LoadExperience, Experience, &[]),
            StepDefinition::new(SelectExperience, Experience, &[ParseJob, LoadExperience]),
            StepDefinition::new(ResearchCompany, Research, &[ParseJob]),
            StepDefinition::new(
                RewriteSummary,
                Rewriting,
                &[SelectExperience, ResearchCompany],
            ),
            StepDefinition::new(
                RewriteBullets,
                Rewriting,
                &[SelectExperience, ResearchCompany],
            ),
            StepDefinition::new(ValidateDocument, Validation, &[RewriteSummary, RewriteBullets]),
        ])
    }

    pub fn lookup(&self, name: StepName) -> Option<&StepDefinition> {
        self.index.get(&name).map(|&i| &self.steps[i])
    }

    /// Parses and looks up a caller-supplied step name in one go.
    pub fn lookup_str(&self, name: &str) -> Option<&StepDefinition> {
        name.parse::<StepName>().ok().and_then(|n| self.lookup(n))
    }

    pub fn all(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn names(&self) -> impl Iterator<Item = StepName> + '_ {
        self.steps.iter().map(|d| d.name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Kahn's algorithm. Steps left with a non-zero in-degree form a cycle.
    pub fn topological_order(&self) -> Result<Vec<StepName>, RegistryError> {
        let mut in_degree: HashMap<StepName, usize> = self
            .steps
            .iter()
            .map(|d| (d.name, d.dependencies.len()))
            .collect();

        let mut queue: VecDeque<StepName> = self
            .steps
            .iter()
            .filter(|d| d.dependencies.is_empty())
            .map(|d| d.name)
            .collect();

        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(name) = queue.pop_front() {
            order.push(name);
            for dependent in self.steps.iter().filter(|d| d.dependencies.contains(&name)) {
                if let Some(degree) = in_degree.get_mut(&dependent.name) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent.name);
                    }
                }
            }
        }

        if order.len() != self.steps.len() {
            let ordered: HashSet<StepName> = order.iter().copied().collect();
            let cyclic = self
                .names()
                .filter(|n| !ordered.contains(n))
                .collect::<Vec<_>>();
            return Err(RegistryError::Cycle(cyclic));
        }

        Ok(order)
    }
}
