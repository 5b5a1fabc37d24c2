use axum::Json;
use serde_json::{json, Value};

/// GET /health — the readiness gate `start --daemon` and CLI clients poll.
pub async fn health_handler() -> Json<Value> {
    Json(json!({ "ok": true }))
}
