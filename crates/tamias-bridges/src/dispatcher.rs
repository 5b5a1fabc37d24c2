//! Fan-out of session events to the bridges that own them.
//!
//! One pump task per non-terminal session reads the session's emitter and
//! forwards each event to the bridge registered for the session's channel.
//! A failing or missing bridge never stops other sessions — and SSE
//! subscribers read the emitter directly, so they are unaffected too.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use tamias_core::types::TERMINAL_CHANNEL;
use tamias_sessions::SessionHandle;

use crate::bridge::{Bridge, SessionContext};

#[derive(Default)]
pub struct Dispatcher {
    /// channel id → owning bridge.
    bridges: DashMap<String, Arc<dyn Bridge>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_bridge(&self, bridge: Arc<dyn Bridge>) {
        debug!(channel = %bridge.name(), "bridge registered");
        self.bridges.insert(bridge.name().to_string(), bridge);
    }

    pub fn unregister_bridge(&self, channel_id: &str) {
        self.bridges.remove(channel_id);
    }

    pub fn bridge(&self, channel_id: &str) -> Option<Arc<dyn Bridge>> {
        self.bridges.get(channel_id).map(|e| e.value().clone())
    }

    pub fn bridges(&self) -> Vec<Arc<dyn Bridge>> {
        self.bridges.iter().map(|e| e.value().clone()).collect()
    }

    /// Wire a session's emitter to its owning bridge. Terminal sessions
    /// are skipped — the terminal bridge reads its emitter directly. The
    /// pump task is tied to the session and dies with it.
    pub fn attach_session(self: &Arc<Self>, handle: &Arc<SessionHandle>) {
        let (channel_id, channel_user_id) =
            handle.with(|s| (s.channel_id.clone(), s.channel_user_id.clone()));
        if channel_id.is_empty() || channel_id == TERMINAL_CHANNEL {
            return;
        }

        let ctx = SessionContext {
            session_id: handle.id.clone(),
            channel_id,
            channel_user_id,
        };
        let dispatcher = Arc::clone(self);
        let mut rx = handle.subscribe();
        let session_id = handle.id.clone();
        let pump = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(bridge) = dispatcher.bridge(&ctx.channel_id) else {
                            debug!(channel = %ctx.channel_id, "no bridge for channel, event dropped");
                            continue;
                        };
                        // Sequential delivery keeps per-channel operations
                        // from interleaving.
                        bridge.handle_daemon_event(&event, &ctx).await;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(session = %session_id, missed, "bridge subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        handle.attach_task(pump);
    }
}
