//! POST /chat?sessionId=… — enqueue one message and stream the resulting
//! turn's events as SSE until `done`/`error`.
//!
//! The subscription is taken before the enqueue so the `start` frame is
//! never missed. Omitting `sessionId` creates a fresh session, returned in
//! every event's context via the `sessionId` field of `start`/`done`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

use tamias_core::types::DaemonEvent;
use tamias_core::TamiasError;
use tamias_sessions::CreateSessionParams;

use crate::app::AppState;

use super::error_response;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatQuery {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    pub message: String,
    #[serde(default)]
    pub author_name: Option<String>,
}

pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChatQuery>,
    Json(body): Json<ChatBody>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<Value>)>
{
    if body.message.trim().is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            &TamiasError::Internal("message cannot be empty".to_string()),
        ));
    }

    let handle = match &query.session_id {
        Some(id) => state.store.get_session(id).ok_or_else(|| {
            error_response(
                StatusCode::NOT_FOUND,
                &TamiasError::SessionNotFound { id: id.clone() },
            )
        })?,
        None => state
            .store
            .create_session(CreateSessionParams::default())
            .map_err(|e| error_response(StatusCode::BAD_REQUEST, &e))?,
    };

    let mut rx = handle.subscribe();
    state
        .store
        .enqueue_message(&handle.id, body.message, body.author_name)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, &e))?;

    let shutdown = state.shutdown.clone();
    let stream = async_stream::stream! {
        loop {
            let received = tokio::select! {
                r = rx.recv() => r,
                // Shutdown closes the stream so the server can drain.
                _ = shutdown.cancelled() => break,
            };
            match received {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    if let Some(frame) = frame(&event) {
                        yield Ok(frame);
                    }
                    if terminal {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Frame helper shared with the `/session/:id/stream` endpoint — one JSON
/// object per `data:` line.
pub fn frame(event: &DaemonEvent) -> Option<Event> {
    serde_json::to_string(event)
        .ok()
        .map(|data| Event::default().data(data))
}
