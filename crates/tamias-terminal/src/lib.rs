//! The terminal bridge — stdin lines in, live-streamed stdout out.
//!
//! Unlike the chat-platform bridges, the terminal delivers `chunk` events
//! as they arrive instead of buffering to `done`, and it renders tool
//! calls inline when debug mode is on. It reads its session's emitter
//! directly; the dispatcher skips `"terminal"` sessions.

use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use tamias_agent::agents::{resolve_bridge_session, AgentsStore};
use tamias_bridges::{Bridge, BridgeError, BridgeStatus, SessionContext};
use tamias_core::types::{DaemonEvent, TERMINAL_CHANNEL};
use tamias_sessions::SessionStore;

/// `channel_user_id` for the single local conversation.
const LOCAL_USER: &str = "local";

pub struct TerminalBridge {
    store: Arc<SessionStore>,
    agents: Arc<AgentsStore>,
    debug: bool,
    status: Mutex<BridgeStatus>,
}

impl TerminalBridge {
    pub fn new(store: Arc<SessionStore>, agents: Arc<AgentsStore>, debug: bool) -> Arc<Self> {
        Arc::new(Self {
            store,
            agents,
            debug,
            status: Mutex::new(BridgeStatus::Disconnected),
        })
    }
}

#[async_trait]
impl Bridge for TerminalBridge {
    fn name(&self) -> &str {
        TERMINAL_CHANNEL
    }

    async fn connect(&self) -> Result<(), BridgeError> {
        let handle = resolve_bridge_session(
            &self.store,
            &self.agents,
            TERMINAL_CHANNEL,
            LOCAL_USER,
            None,
        )
        .map_err(|e| BridgeError::Connect(e.to_string()))?;

        // Live output: pump the session emitter straight to stdout.
        let mut rx = handle.subscribe();
        let debug = self.debug;
        handle.attach_task(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => render_event(&event, debug),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        // Input: one enqueued message per stdin line.
        let store = Arc::clone(&self.store);
        let session_id = handle.id.clone();
        handle.attach_task(tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if let Err(e) = store.enqueue_message(&session_id, line, None) {
                    warn!(error = %e, "terminal enqueue failed");
                    break;
                }
            }
        }));

        *self.status.lock().unwrap() = BridgeStatus::Connected;
        Ok(())
    }

    async fn disconnect(&self) {
        *self.status.lock().unwrap() = BridgeStatus::Disconnected;
    }

    fn status(&self) -> BridgeStatus {
        self.status.lock().unwrap().clone()
    }

    async fn handle_daemon_event(&self, event: &DaemonEvent, _ctx: &SessionContext) {
        render_event(event, self.debug);
    }
}

fn render_event(event: &DaemonEvent, debug: bool) {
    let mut out = std::io::stdout();
    match event {
        DaemonEvent::Start { .. } => {}
        DaemonEvent::Chunk { text } => {
            let _ = write!(out, "{text}");
            let _ = out.flush();
        }
        DaemonEvent::ToolCall { name, input } => {
            if debug {
                let _ = writeln!(out, "\n[tool] {name} {input}");
            }
        }
        DaemonEvent::ToolResult { name, output } => {
            if debug {
                let _ = writeln!(out, "[tool result] {name}: {output}");
            }
        }
        DaemonEvent::Done { .. } => {
            let _ = writeln!(out);
        }
        DaemonEvent::Error { message } => {
            let _ = writeln!(out, "\n⚠️ Error: {message}");
        }
        DaemonEvent::File {
            name,
            mime_type,
            buffer,
        } => {
            let _ = writeln!(out, "\n[file] {name} ({mime_type}, {} bytes)", buffer.len());
        }
        DaemonEvent::SubagentStatus {
            task_slug,
            status,
            message,
            ..
        } => {
            let note = message.as_deref().unwrap_or("");
            let _ = writeln!(out, "\n[sub-agent {task_slug}] {status} {note}");
        }
        DaemonEvent::AgentHandoff {
            from_agent,
            to_agent,
            reason,
        } => {
            let _ = writeln!(out, "\n[handoff] {from_agent} → {to_agent}: {reason}");
        }
    }
}
