use crate::config::Config;
use crate::pipeline::Orchestrator;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    /// Owns the registry, executors and the pluggable run/step store.
    pub orchestrator: Orchestrator,
    pub config: Config,
}
