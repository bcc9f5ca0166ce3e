//! Round engine service entry point.
//!
//! Starts a background scheduler that retires expired rounds and refreshes
//! QF matching, and exposes the engine through a small Axum REST API.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use reqwest::Client;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use round_engine::api;
use round_engine::config::Config;
use round_engine::db;
use round_engine::engine::Engine;
use round_engine::reputation::{
    DisabledReputationProvider, HttpReputationProvider, ReputationProvider,
};
use round_engine::scheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    let reputation: Arc<dyn ReputationProvider> = match &config.reputation_api_url {
        Some(url) => {
            let client = Client::builder()
                .timeout(config.engine.reputation_timeout)
                .build()?;
            info!("Reputation scorer: {url}");
            Arc::new(HttpReputationProvider::new(
                client,
                url.clone(),
                config.reputation_api_key.clone(),
                config.engine.reputation_timeout,
            ))
        }
        None => {
            warn!("REPUTATION_API_URL not set; stale reputation scores cannot be refreshed");
            Arc::new(DisabledReputationProvider)
        }
    };

    let engine = Arc::new(Engine::new(pool, reputation, config.engine.clone()));

    // ─── Background scheduler ─────────────────────────────
    tokio::spawn(scheduler::run(
        engine.clone(),
        Duration::from_secs(config.scheduler_interval_secs),
    ));

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState { engine });

    let app = Router::new()
        .route("/health", get(api::health))
        .route("/rounds/active", get(api::get_active_round))
        .route("/rounds/deactivate-expired", post(api::deactivate_expired))
        .route("/rounds/:id/caps", get(api::get_round_caps))
        .route("/projects/:id/capacity", get(api::get_capacity))
        .route("/projects/:id/qf-round", get(api::get_qf_round))
        .route(
            "/qf-rounds/:id/matching",
            get(api::get_matching).post(api::recompute_matching),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(api_state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
