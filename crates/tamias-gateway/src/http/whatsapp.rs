//! WhatsApp Business webhook ingress, mounted per configured bridge key:
//! `GET /webhooks/whatsapp/:key` (verify handshake) and
//! `POST /webhooks/whatsapp/:key` (message payloads).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use tracing::warn;

use tamias_whatsapp::WhatsappBridge;

use crate::app::AppState;

/// The dispatcher stores `dyn Bridge`; the webhook routes need the
/// concrete type for verify/ingest, so `AppState` keeps a typed side map.
fn bridge_for(state: &AppState, key: &str) -> Option<Arc<WhatsappBridge>> {
    state
        .whatsapp
        .get(&format!("whatsapp:{key}"))
        .map(|e| e.value().clone())
}

/// GET — verification handshake with `hub.mode`, `hub.verify_token`,
/// `hub.challenge` query params.
pub async fn verify_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<String, StatusCode> {
    let bridge = bridge_for(&state, &key).ok_or(StatusCode::NOT_FOUND)?;
    let mode = params.get("hub.mode").map(String::as_str).unwrap_or("");
    let token = params
        .get("hub.verify_token")
        .map(String::as_str)
        .unwrap_or("");
    let challenge = params
        .get("hub.challenge")
        .map(String::as_str)
        .unwrap_or("");
    bridge
        .verify(mode, token, challenge)
        .ok_or(StatusCode::FORBIDDEN)
}

/// POST — message payloads. Always 200 so the platform does not retry
/// rejected messages; the accepted count is informational.
pub async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let Some(bridge) = bridge_for(&state, &key) else {
        warn!(key = %key, "webhook for unknown whatsapp bridge");
        return Err(StatusCode::NOT_FOUND);
    };
    let accepted = bridge.ingest(&payload).await;
    Ok(Json(json!({ "ok": true, "accepted": accepted })))
}
