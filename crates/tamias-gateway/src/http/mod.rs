pub mod chat;
pub mod daemon;
pub mod debug;
pub mod health;
pub mod sessions;
pub mod stream;
pub mod whatsapp;

use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

/// Standard error payload: `{error, code}`.
pub fn error_response(status: StatusCode, error: &tamias_core::TamiasError) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({ "error": error.to_string(), "code": error.code() })),
    )
}
