//! Maps each step to the capability that does its work.
//!
//! The orchestrator never knows what a step computes. It hands the executor a
//! [`StepContext`] and records whatever comes back. Registration is checked
//! once at startup: every registry step must have an executor.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::models::{Run, SubjectUpdate};
use crate::pipeline::registry::{StepName, StepRegistry};
use crate::pipeline::store::{PipelineStore, StoreError};

#[derive(Debug, Error)]
pub enum StepError {
    #[error("missing input: step '{0}' has no artifact for this run")]
    MissingInput(StepName),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("{0}")]
    Failed(String),

    #[error("failed to load step input: {0}")]
    Store(#[from] StoreError),
}

/// What a successful executor hands back.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    /// Persisted as the step's artifact.
    pub content: Value,
    /// Free-form metadata copied into the checkpoint.
    pub metadata: Value,
    /// Subject fields learned by this step (company, role, ...).
    pub subject: Option<SubjectUpdate>,
}

impl StepOutput {
    pub fn new(content: Value) -> Self {
        Self {
            content,
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_subject(mut self, subject: SubjectUpdate) -> Self {
        self.subject = Some(subject);
        self
    }
}

/// Everything an executor may read: the run, its caller parameters, and
/// lazy access to earlier steps' artifacts.
pub struct StepContext {
    pub run: Run,
    pub step: StepName,
    pub parameters: Value,
    artifacts: BTreeMap<String, Uuid>,
    store: Arc<dyn PipelineStore>,
}

impl StepContext {
    pub fn new(
        run: Run,
        step: StepName,
        parameters: Option<Value>,
        artifacts: BTreeMap<String, Uuid>,
        store: Arc<dyn PipelineStore>,
    ) -> Self {
        Self {
            run,
            step,
            parameters: parameters.unwrap_or(Value::Null),
            artifacts,
            store,
        }
    }

    /// Content of `step`'s artifact, or `None` if it was skipped or never ran.
    pub async fn artifact(&self, step: StepName) -> Result<Option<Value>, StepError> {
        let Some(id) = self.artifacts.get(step.as_str()) else {
            return Ok(None);
        };
        Ok(self.store.get_artifact(*id).await?.map(|a| a.content))
    }

    pub async fn require_artifact(&self, step: StepName) -> Result<Value, StepError> {
        self.artifact(step)
            .await?
            .ok_or(StepError::MissingInput(step))
    }

    pub fn parameter_str(&self, key: &str) -> Option<&str> {
        self.parameters
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutput, StepError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no executor registered for steps: {0:?}")]
pub struct MissingExecutors(pub Vec<StepName>);

#[derive(Default)]
pub struct ExecutorRegistryBuilder {
    executors: HashMap<StepName, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistryBuilder {
    pub fn register(mut self, step: StepName, executor: impl StepExecutor + 'static) -> Self {
        self.executors.insert(step, Arc::new(executor));
        self
    }

    /// Fails if any step in `registry` is left without an executor.
    pub fn build(self, registry: &StepRegistry) -> Result<ExecutorRegistry, MissingExecutors> {
        let missing: Vec<StepName> = registry
            .names()
            .filter(|name| !self.executors.contains_key(name))
            .collect();
        if !missing.is_empty() {
            return Err(MissingExecutors(missing));
        }
        Ok(ExecutorRegistry {
            executors: self.executors,
        })
    }
}

pub struct ExecutorRegistry {
    executors: HashMap<StepName, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn builder() -> ExecutorRegistryBuilder {
        ExecutorRegistryBuilder::default()
    }

    pub fn get(&self, step: StepName) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(&step).cloned()
    }
}
