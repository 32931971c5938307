pub mod config;
pub mod delivery;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod retry;
pub mod routes;
pub mod telemetry;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use config::Config;
use pipeline::MarketAnalyzer;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub analyzer: Arc<MarketAnalyzer>,
}

/// API routes without the HTTP middleware stack, which `main` adds.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/api/analysis", post(routes::analysis::run_analysis))
        .route("/api/analysis/summary", post(routes::analysis::run_summary))
        .route("/api/reports/render", post(routes::analysis::render_report))
        .with_state(state)
}
