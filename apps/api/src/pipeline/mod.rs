//! Step pipeline: a fixed registry of named, dependency-ordered steps that
//! are executed one at a time per run, with every status change and
//! checkpoint persisted so a run can be resumed after a crash.

pub mod cancel;
pub mod checkpoint;
pub mod errors;
pub mod events;
pub mod executor;
pub mod handlers;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod resolver;
pub mod store;

pub use orchestrator::{Orchestrator, SystemClock};
pub use registry::StepRegistry;
