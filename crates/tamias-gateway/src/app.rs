//! Central shared state and the Axum router.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::routing::{delete, get, post};
use axum::Router;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use tamias_agent::agents::{handoff_session, AgentsStore};
use tamias_bridges::Dispatcher;
use tamias_core::config::TamiasConfig;
use tamias_core::paths::DataRoot;
use tamias_core::types::Agent;
use tamias_sessions::SessionStore;
use tamias_tools::ToolHost;

/// Shared state — passed as `Arc<AppState>` to every handler, and the
/// `ToolHost` the registry hands to session-bound tools.
pub struct AppState {
    pub root: DataRoot,
    pub store: Arc<SessionStore>,
    pub agents: Arc<AgentsStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub shutdown: CancellationToken,
    pub started_at: String,
    pub port: AtomicU16,
    /// Typed handles for the webhook routes, keyed by bridge name
    /// (`"whatsapp:{key}"`).
    pub whatsapp: DashMap<String, Arc<tamias_whatsapp::WhatsappBridge>>,
}

impl AppState {
    pub fn new(
        root: DataRoot,
        store: Arc<SessionStore>,
        agents: Arc<AgentsStore>,
        dispatcher: Arc<Dispatcher>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            root,
            store,
            agents,
            dispatcher,
            shutdown,
            started_at: chrono::Utc::now().to_rfc3339(),
            port: AtomicU16::new(0),
            whatsapp: DashMap::new(),
        })
    }

    pub fn config(&self) -> &TamiasConfig {
        self.store.config()
    }

    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::Relaxed);
    }
}

#[async_trait]
impl ToolHost for AppState {
    fn store(&self) -> &SessionStore {
        &self.store
    }

    fn find_agent(&self, key: &str) -> Option<Agent> {
        self.agents.find(key).cloned()
    }

    fn agents(&self) -> Vec<Agent> {
        self.agents.list().to_vec()
    }

    async fn handoff(
        &self,
        session_id: &str,
        target_agent: &str,
        reason: &str,
        context: Option<String>,
    ) -> Result<String, String> {
        handoff_session(
            &self.store,
            &self.agents,
            session_id,
            target_agent,
            reason,
            context,
        )
        .await
        .map_err(|e| e.to_string())
    }

    fn debug(&self) -> bool {
        self.config().debug
    }
}

/// Assemble the full router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/sessions",
            get(crate::http::sessions::list_sessions).post(crate::http::sessions::create_session),
        )
        .route(
            "/sessions/{id}",
            get(crate::http::sessions::get_session).delete(crate::http::sessions::delete_session),
        )
        .route("/chat", post(crate::http::chat::chat_handler))
        .route(
            "/session/{id}/stream",
            get(crate::http::stream::stream_handler),
        )
        .route("/debug", get(crate::http::debug::debug_handler))
        .route("/daemon", delete(crate::http::daemon::shutdown_handler))
        .route(
            "/webhooks/whatsapp/{key}",
            get(crate::http::whatsapp::verify_handler).post(crate::http::whatsapp::ingest_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
