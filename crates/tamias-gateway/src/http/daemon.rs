//! DELETE /daemon — graceful shutdown trigger.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use tracing::info;

use crate::app::AppState;

pub async fn shutdown_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    info!("shutdown requested via DELETE /daemon");
    // Responding first; the stop sequence runs on its own task and the
    // server drains through the cancellation token.
    let state2 = Arc::clone(&state);
    tokio::spawn(async move {
        crate::stop::run(state2).await;
    });
    Json(json!({ "ok": true, "stopping": true }))
}
