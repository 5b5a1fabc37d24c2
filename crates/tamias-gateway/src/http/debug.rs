//! GET /debug — daemon introspection for support sessions.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use tamias_core::types::ModelRef;

use crate::app::AppState;

pub async fn debug_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = state.config();
    let connections: Vec<Value> = config
        .connections
        .iter()
        .map(|(nickname, conn)| {
            json!({
                "nickname": nickname,
                "provider": conn.provider.as_str(),
                "envKeyName": conn.env_key_name,
                "envKeyPresent": std::env::var(&conn.env_key_name).is_ok(),
                "selectedModels": conn.selected_models,
            })
        })
        .collect();

    let sessions: Vec<Value> = state
        .store
        .list()
        .iter()
        .map(|s| {
            let nickname = ModelRef::parse(&s.model).map(|m| m.nickname);
            let exists = nickname
                .as_deref()
                .map(|n| config.connections.contains_key(n))
                .unwrap_or(false);
            json!({
                "id": s.id,
                "connectionNickname": nickname,
                "connectionExistsInConfig": exists,
            })
        })
        .collect();

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "execPath": std::env::current_exe().ok().map(|p| p.display().to_string()),
        "verboseMode": config.debug,
        "connections": connections,
        "defaultModels": config.default_models,
        "sessions": sessions,
    }))
}
