use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "market-report-agent",
        "version": env!("CARGO_PKG_VERSION"),
        "llm_provider": state.config.llm_provider,
        "email_enabled": state.analyzer.can_deliver(),
    }))
}
