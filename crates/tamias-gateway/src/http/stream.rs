//! GET /session/:id/stream — raw SSE firehose of a session's events.
//!
//! Every `DaemonEvent` is one `data: {json}` frame; the connection closes
//! on `done`/`error`. Chunks appear here even when a heartbeat turn later
//! suppresses bridge delivery — SSE subscribers see the raw stream.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

use tamias_core::TamiasError;

use crate::app::AppState;

use super::chat::frame;
use super::error_response;

pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<Value>)>
{
    let handle = state.store.get_session(&id).ok_or_else(|| {
        error_response(
            StatusCode::NOT_FOUND,
            &TamiasError::SessionNotFound { id: id.clone() },
        )
    })?;
    let mut rx = handle.subscribe();

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
