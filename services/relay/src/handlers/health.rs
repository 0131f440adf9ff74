use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;
use crate::SERVICE_VERSION;

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let stats = state.channel.stats();
    Json(json!({
        "status": "ok",
        "version": SERVICE_VERSION,
        "subscribers": state.channel.subscriber_count(),
        "backlog": state.channel.backlog_len(),
        "published": stats.published,
    }))
}
