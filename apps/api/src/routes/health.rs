use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health
/// Returns service status, version and the registered pipeline steps.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let steps: Vec<&str> = state
        .orchestrator
        .registry()
        .names()
        .map(|s| s.as_str())
        .collect();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "tailor-api",
        "store_backend": format!("{:?}", state.config.store_backend).to_lowercase(),
        "steps": steps,
    }))
}
