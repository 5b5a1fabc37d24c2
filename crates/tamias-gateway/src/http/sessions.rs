//! Session CRUD endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use tamias_core::TamiasError;
use tamias_sessions::CreateSessionParams;

use crate::app::AppState;

use super::error_response;

/// GET /sessions — list-view projection, newest first.
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.store.list()))
}

/// GET /sessions/:id — full session snapshot including messages.
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let handle = state.store.get_session(&id).ok_or_else(|| {
        error_response(
            StatusCode::NOT_FOUND,
            &TamiasError::SessionNotFound { id: id.clone() },
        )
    })?;
    let mut body = serde_json::to_value(handle.snapshot()).unwrap_or(json!({}));
    body["queueLength"] = json!(handle.queue_len());
    body["processing"] = json!(handle.is_processing());
    Ok(Json(body))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub channel_user_id: Option<String>,
}

/// POST /sessions — create a session; body `{model?, channelId?, channelUserId?}`.
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let handle = state
        .store
        .create_session(CreateSessionParams {
            model: body.model,
            channel_id: body.channel_id,
            channel_user_id: body.channel_user_id,
            ..Default::default()
        })
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, &e))?;
    Ok(Json(serde_json::to_value(handle.snapshot()).unwrap_or(json!({}))))
}

/// DELETE /sessions/:id
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state
        .store
        .delete_session(&id)
        .map_err(|e| error_response(StatusCode::NOT_FOUND, &e))?;
    Ok(Json(json!({ "ok": true })))
}
