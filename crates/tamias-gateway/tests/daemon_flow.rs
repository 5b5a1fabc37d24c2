//! End-to-end daemon flow over the in-process router: session CRUD, a
//! streamed chat turn against the scripted mock backend, and debug
//! introspection.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use tamias_agent::mock::{MockBackend, MockFactory};
use tamias_agent::{AgentsStore, BackendFactory, Runner};
use tamias_bridges::Dispatcher;
use tamias_core::config::{Connection, Provider, TamiasConfig};
use tamias_core::paths::DataRoot;
use tamias_gateway::app::{build_router, AppState};
use tamias_sessions::SessionStore;
use tamias_tools::ToolHost;

struct Fixture {
    _dir: tempfile::TempDir,
    state: Arc<AppState>,
    router: axum::Router,
}

fn fixture(reply: &str) -> Fixture {
    let mut config = TamiasConfig::default();
    config.connections.insert(
        "openai".to_string(),
        Connection {
            provider: Provider::OpenAi,
            env_key_name: "OPENAI_API_KEY".to_string(),
            base_url: None,
            selected_models: vec!["gpt-4o".to_string()],
        },
    );
    config.default_models = vec!["openai/gpt-4o".to_string()];

    let dir = tempfile::tempdir().unwrap();
    let root = DataRoot::at(dir.path());
    let shutdown = CancellationToken::new();
    let store = Arc::new(SessionStore::new(root.clone(), config));
    let agents = Arc::new(AgentsStore::default());
    let dispatcher = Arc::new(Dispatcher::new());
    let state = AppState::new(
        root,
        Arc::clone(&store),
        Arc::clone(&agents),
        dispatcher,
        shutdown.clone(),
    );

    let factory = Arc::new(MockFactory::new());
    factory.register("openai", MockBackend::always("openai", reply));

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    store.set_runner(tx);
    let host: Arc<dyn ToolHost> = state.clone();
    let runner = Runner::new(
        Arc::clone(&store),
        agents,
        factory as Arc<dyn BackendFactory>,
        host,
        shutdown,
        false,
    );
    runner.spawn_loop(rx);

    let router = build_router(Arc::clone(&state));
    Fixture {
        _dir: dir,
        state,
        router,
    }
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8_lossy(&bytes).to_string()
}

#[tokio::test]
async fn health_answers_ok() {
    let f = fixture("hi");
    let response = f
        .router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_string(response).await.contains("\"ok\":true"));
}

#[tokio::test]
async fn session_crud_round_trip() {
    let f = fixture("hi");

    let response = f
        .router
        .clone()
        .oneshot(
            Request::post("/sessions")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"model":"openai/gpt-4o"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created: serde_json::Value =
        serde_json::from_str(&body_string(response).await).unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    assert!(id.starts_with("sess_"));

    let response = f
        .router
        .clone()
        .oneshot(Request::get("/sessions").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let list: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(list.as_array().unwrap().len(), 1);

    let response = f
        .router
        .clone()
        .oneshot(
            Request::get(format!("/sessions/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = f
        .router
        .clone()
        .oneshot(
            Request::delete(format!("/sessions/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(f.state.store.get_session(&id).is_none());
}

#[tokio::test]
async fn unknown_connection_is_a_bad_request() {
    let f = fixture("hi");
    let response = f
        .router
        .clone()
        .oneshot(
            Request::post("/sessions")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"model":"ghost/x"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_string(response).await.contains("UNKNOWN_CONNECTION"));
}

#[tokio::test]
async fn chat_streams_start_chunk_done() {
    let f = fixture("hello");
    let response = f
        .router
        .clone()
        .oneshot(
            Request::post("/chat")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"message":"Say 'hello'"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let body = body_string(response).await;
    assert!(body.contains(r#""type":"start""#));
    assert!(body.contains(r#""type":"chunk""#));
    assert!(body.contains("hello"));
    assert!(body.contains(r#""type":"done""#));
    assert!(body.contains(r#""suppressed":false"#));
}

#[tokio::test]
async fn heartbeat_turn_is_marked_suppressed_on_the_wire() {
    let f = fixture("HEARTBEAT_OK");
    let response = f
        .router
        .clone()
        .oneshot(
            Request::post("/chat")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"message":"heartbeat"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_string(response).await;
    // SSE is a raw firehose: the sentinel text is visible here even though
    // bridges will not forward it.
    assert!(body.contains("HEARTBEAT_OK"));
    assert!(body.contains(r#""suppressed":true"#));
}

#[tokio::test]
async fn debug_reports_connections_and_sessions() {
    let f = fixture("hi");
    f.state
        .store
        .create_session(tamias_sessions::CreateSessionParams::default())
        .unwrap();

    let response = f
        .router
        .clone()
        .oneshot(Request::get("/debug").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["defaultModels"][0], "openai/gpt-4o");
    assert_eq!(body["connections"][0]["nickname"], "openai");
    assert_eq!(body["sessions"][0]["connectionExistsInConfig"], true);
}
