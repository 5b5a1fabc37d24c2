//! The provider contract: one request shape, one stream-event shape, one
//! trait every backend implements.
//!
//! Backends receive `(model, system, messages, tools)` and push
//! [`StreamEvent`]s over a channel; the runner turns those into
//! `DaemonEvent`s and tool executions. Anything provider-specific beyond
//! this contract stays inside the backend modules.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use tamias_core::config::{Connection, Provider};
use tamias_sessions::ChatMessage;
use tamias_tools::ToolDefinition;

/// Default output token cap per request.
pub const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Request to an LLM provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Bare model id — the connection nickname is already resolved.
    pub model: String,
    /// System prompt, attached out-of-band (never part of `messages`).
    pub system: String,
    /// Plain conversation history. Ignored when `raw_messages` is set.
    pub messages: Vec<ChatMessage>,
    /// Structured history for tool rounds: Anthropic-style content blocks
    /// (`tool_use` / `tool_result`); non-Anthropic backends convert.
    pub raw_messages: Option<Vec<serde_json::Value>>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
}

/// Events a backend pushes while streaming one completion.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental assistant text.
    TextDelta { text: String },

    /// The model requested a tool call. Backends emit this only once the
    /// call's input JSON is complete.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// Stream completed.
    Done {
        usage: Usage,
        stop_reason: String,
    },

    /// Stream failed mid-flight.
    Error { message: String },
}

/// Final usage record. Best-effort — zeros when a provider omits it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub tokens_in: u32,
    pub tokens_out: u32,
}

/// Common interface for all LLM provider backends.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Stream one completion, pushing events into `tx`. Implementations
    /// must end every successful stream with exactly one `Done`.
    async fn stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Missing API key: env variable {0} is not set")]
    MissingKey(String),

    #[error("Stream aborted: {0}")]
    Aborted(String),
}

/// Builds a backend for a configured connection. The indirection exists so
/// tests can swap in the scripted mock backend.
pub trait BackendFactory: Send + Sync {
    fn backend(
        &self,
        nickname: &str,
        connection: &Connection,
    ) -> Result<Arc<dyn ModelBackend>, ProviderError>;
}

/// Production factory: reads the API key from the env variable the
/// connection names and dispatches on the provider kind.
pub struct EnvBackendFactory;

impl BackendFactory for EnvBackendFactory {
    fn backend(
        &self,
        nickname: &str,
        connection: &Connection,
    ) -> Result<Arc<dyn ModelBackend>, ProviderError> {
        let key = || {
            std::env::var(&connection.env_key_name)
                .map_err(|_| ProviderError::MissingKey(connection.env_key_name.clone()))
        };
        let backend: Arc<dyn ModelBackend> = match connection.provider {
            Provider::OpenAi => Arc::new(crate::openai_compat::OpenAiCompatBackend::openai(
                nickname,
                key()?,
                connection.base_url.clone(),
            )),
            Provider::OpenRouter => Arc::new(crate::openai_compat::OpenAiCompatBackend::openrouter(
                nickname,
                key()?,
                connection.base_url.clone(),
            )),
            Provider::Ollama => Arc::new(crate::openai_compat::OpenAiCompatBackend::ollama(
                nickname,
                connection.base_url.clone(),
            )),
            Provider::Anthropic => Arc::new(crate::anthropic::AnthropicBackend::new(
                nickname,
                key()?,
                connection.base_url.clone(),
            )),
            Provider::Google => Arc::new(crate::google::GoogleBackend::new(
                nickname,
                key()?,
                connection.base_url.clone(),
            )),
        };
        Ok(backend)
    }
}

/// Parse a single SSE line: `event: <type>` or `data: <json>`.
pub(crate) fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data: ")
            .map(|data| SseParsed::Data(data.to_string()))
    }
}

#[derive(Debug)]
pub(crate) enum SseParsed {
    Event(String),
    Data(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_line_parse() {
        assert!(matches!(
            parse_sse_line("event: message_start"),
            Some(SseParsed::Event(e)) if e == "message_start"
        ));
        assert!(matches!(
            parse_sse_line("data: {\"x\":1}"),
            Some(SseParsed::Data(_))
        ));
        assert!(parse_sse_line(": keepalive").is_none());
    }
}
