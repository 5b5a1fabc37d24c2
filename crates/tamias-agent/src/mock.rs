//! Deterministic mock backend for tests.
//!
//! Each `stream` call pops the next script from the front of the queue, so
//! tests can specify exact event sequences — including tool calls and
//! mid-stream failures — without network access.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use tamias_core::config::Connection;

use crate::provider::{
    BackendFactory, ChatRequest, ModelBackend, ProviderError, StreamEvent, Usage,
};

/// One scripted response.
pub enum MockTurn {
    /// Emit these events in order. A trailing `Done` is appended when the
    /// script doesn't end with one.
    Events(Vec<StreamEvent>),
    /// Fail the whole call before emitting anything (connection error,
    /// 4xx) — exercises the model fallback chain.
    Failure(String),
}

impl MockTurn {
    /// Plain single-text response.
    pub fn text(content: impl Into<String>) -> Self {
        MockTurn::Events(vec![StreamEvent::TextDelta {
            text: content.into(),
        }])
    }
}

pub struct MockBackend {
    backend_name: String,
    turns: Mutex<Vec<MockTurn>>,
    /// Requests seen, for assertions.
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl MockBackend {
    pub fn new(name: &str, turns: Vec<MockTurn>) -> Arc<Self> {
        Arc::new(Self {
            backend_name: name.to_string(),
            turns: Mutex::new(turns),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Backend whose scripted reply is a single text turn; later calls
    /// answer with an empty completion.
    pub fn always(name: &str, content: &str) -> Arc<Self> {
        let content = content.to_string();
        Arc::new(Self {
            backend_name: name.to_string(),
            turns: Mutex::new(vec![MockTurn::text(content)]),
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    fn name(&self) -> &str {
        &self.backend_name
    }

    async fn stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        self.requests.lock().unwrap().push(req.clone());
        let turn = {
            let mut turns = self.turns.lock().unwrap();
            if turns.is_empty() {
                // Script exhausted: answer with an empty completion.
                MockTurn::Events(vec![])
            } else {
                turns.remove(0)
            }
        };
        match turn {
            MockTurn::Failure(message) => Err(ProviderError::Api {
                status: 500,
                message,
            }),
            MockTurn::Events(events) => {
                let mut saw_done = false;
                for event in events {
                    if matches!(event, StreamEvent::Done { .. }) {
                        saw_done = true;
                    }
                    let _ = tx.send(event).await;
                }
                if !saw_done {
                    let _ = tx
                        .send(StreamEvent::Done {
                            usage: Usage {
                                tokens_in: 10,
                                tokens_out: 10,
                            },
                            stop_reason: "end_turn".to_string(),
                        })
                        .await;
                }
                Ok(())
            }
        }
    }
}

/// Factory resolving connection nicknames to pre-registered mocks.
#[derive(Default)]
pub struct MockFactory {
    backends: Mutex<HashMap<String, Arc<MockBackend>>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, nickname: &str, backend: Arc<MockBackend>) {
        self.backends
            .lock()
            .unwrap()
            .insert(nickname.to_string(), backend);
    }
}

impl BackendFactory for MockFactory {
    fn backend(
        &self,
        nickname: &str,
        _connection: &Connection,
    ) -> Result<Arc<dyn ModelBackend>, ProviderError> {
        self.backends
            .lock()
            .unwrap()
            .get(nickname)
            .cloned()
            .map(|b| b as Arc<dyn ModelBackend>)
            .ok_or_else(|| ProviderError::Parse(format!("no mock registered for {nickname}")))
    }
}
