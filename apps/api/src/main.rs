mod config;
mod db;
mod errors;
mod llm_client;
mod pipeline;
mod routes;
mod state;
mod steps;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, StoreBackend};
use crate::db::create_pool;
use crate::llm_client::{LlmClient, TextGenerator};
use crate::pipeline::store::{MemoryPipelineStore, PgPipelineStore, PipelineStore};
use crate::pipeline::{Orchestrator, StepRegistry, SystemClock};
use crate::routes::build_router;
use crate::state::AppState;
use crate::steps::{build_executors, StepDeps};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Tailor API v{}", env!("CARGO_PKG_VERSION"));

    let pool = match &config.database_url {
        Some(url) => Some(create_pool(url, config.db_max_connections).await?),
        None => None,
    };

    let store: Arc<dyn PipelineStore> = match (config.store_backend, &pool) {
        (StoreBackend::Postgres, Some(pool)) => Arc::new(PgPipelineStore::new(pool.clone())),
        (StoreBackend::Postgres, None) => {
            anyhow::bail!("STORE_BACKEND=postgres requires DATABASE_URL")
        }
        (StoreBackend::Memory, _) => Arc::new(MemoryPipelineStore::new()),
    };
    info!("Pipeline store: {:?}", config.store_backend);

    let llm: Arc<dyn TextGenerator> = Arc::new(LlmClient::new(config.anthropic_api_key.clone())?);
    info!("LLM client initialized (model: {})", llm_client::MODEL);

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.job_fetch_timeout_secs))
        .user_agent(concat!("tailor-api/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let registry = Arc::new(StepRegistry::standard()?);
    let executors = build_executors(&registry, StepDeps { llm, pool, http })?;
    info!("Registered {} pipeline steps", registry.len());

    let orchestrator = Orchestrator::new(
        registry,
        executors,
        store,
        Arc::new(SystemClock),
        config.pipeline_max_steps,
    );

    let state = AppState {
        orchestrator,
        config: config.clone(),
    };

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: restrict allowed origins once the web client has a fixed host

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
