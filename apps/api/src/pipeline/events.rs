//! Ordered lifecycle events for one orchestration call.
//!
//! Sending never blocks: the channel is unbounded and a dropped receiver is
//! ignored. State has already been written to the store by the time an event
//! goes out, so a lost event loses nothing durable.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::pipeline::models::RunStatus;
use crate::pipeline::registry::{StepCategory, StepDefinition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    RunStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    RunCompleted,
}

impl ProgressKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressKind::RunStarted => "run_started",
            ProgressKind::StepStarted => "step_started",
            ProgressKind::StepCompleted => "step_completed",
            ProgressKind::StepFailed => "step_failed",
            ProgressKind::RunCompleted => "run_completed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    /// Position in this emitter's stream, starting at 0.
    pub sequence: u64,
    pub run_id: Uuid,
    pub kind: ProgressKind,
    pub step: Option<String>,
    pub category: Option<StepCategory>,
    pub message: String,
    /// Final run status; set on `run_completed` only.
    pub status: Option<RunStatus>,
    pub timestamp: DateTime<Utc>,
}

pub type ProgressReceiver = mpsc::UnboundedReceiver<ProgressEvent>;

pub struct ProgressEmitter {
    run_id: Uuid,
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
    sequence: AtomicU64,
}

impl ProgressEmitter {
    pub fn channel(run_id: Uuid) -> (Self, ProgressReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                run_id,
                tx: Some(tx),
                sequence: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// An emitter with no listener. Events are only logged.
    pub fn detached(run_id: Uuid) -> Self {
        Self {
            run_id,
            tx: None,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn emit(
        &self,
        kind: ProgressKind,
        step: Option<&StepDefinition>,
        message: String,
        status: Option<RunStatus>,
    ) {
        let event = ProgressEvent {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            run_id: self.run_id,
            kind,
            step: step.map(|s| s.name.as_str().to_string()),
            category: step.map(|s| s.category),
            message,
            status,
            timestamp: Utc::now(),
        };
        debug!(
            "run {} event #{} {}: {}",
            event.run_id,
            event.sequence,
            kind.as_str(),
            event.message
        );
        if let Some(tx) = &self.tx {
            // receiver gone means nobody is listening any more
            let _ = tx.send(event);
        }
    }

    pub fn run_started(&self, message: impl Into<String>) {
        self.emit(ProgressKind::RunStarted, None, message.into(), None);
    }

    pub fn step_started(&self, step: &StepDefinition) {
        self.emit(
            ProgressKind::StepStarted,
            Some(step),
            format!("Starting {}", step.name),
            None,
        );
    }

    pub fn step_completed(&self, step: &StepDefinition, duration_ms: i64) {
        self.emit(
            ProgressKind::StepCompleted,
            Some(step),
            format!("Completed {} in {duration_ms}ms", step.name),
            None,
        );
    }

    pub fn step_failed(&self, step: &StepDefinition, error: &str) {
        self.emit(
            ProgressKind::StepFailed,
            Some(step),
            format!("{} failed: {error}", step.name),
            None,
        );
    }

    pub fn run_completed(&self, status: RunStatus, message: impl Into<String>) {
        self.emit(ProgressKind::RunCompleted, None, message.into(), Some(status));
    }
}
