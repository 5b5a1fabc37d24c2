//! Daemon configuration — `config.json` plus `TAMIAS_*` env overrides.
//!
//! Secrets never live in the config file: connections and bridges store only
//! the *name* of the environment variable that holds the key or bot token.
//! The values themselves come from the process environment, seeded once from
//! `~/.tamias/.env` at startup.

use std::collections::BTreeMap;
use std::path::Path;

use figment::{
    providers::{Env, Format, Json},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TamiasError};

/// Default cap for a single shell tool invocation (seconds).
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;
/// Cap for external LLM CLI tools (seconds).
pub const EXTERNAL_CLI_TIMEOUT_SECS: u64 = 600;
/// Wall-clock cap for one session turn (seconds).
pub const TURN_TIMEOUT_SECS: u64 = 600;

/// Top-level `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TamiasConfig {
    pub version: String,
    /// LLM provider connections, keyed by user-chosen nickname.
    pub connections: BTreeMap<String, Connection>,
    /// Global default model chain, entries are `"{nickname}/{modelId}"`.
    pub default_models: Vec<String>,
    pub default_image_models: Vec<String>,
    /// Internal tool categories, keyed by category name.
    pub internal_tools: BTreeMap<String, InternalToolConfig>,
    /// External MCP servers, keyed by server name.
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
    pub bridges: BridgesConfig,
    /// Email accounts — consumed by the email tool collaborator, opaque here.
    pub emails: serde_json::Value,
    /// AI-writable sandbox root, relative to the data dir when not absolute.
    pub workspace_path: Option<String>,
    pub sandbox: SandboxConfig,
    pub debug: bool,
    #[serde(rename = "_configVersion")]
    pub config_version: u64,
}

/// One LLM provider connection. The API key is read from the env variable
/// named in `env_key_name`; it is never stored here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub provider: Provider,
    pub env_key_name: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub selected_models: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Google,
    OpenRouter,
    Ollama,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
            Provider::OpenRouter => "openrouter",
            Provider::Ollama => "ollama",
        }
    }
}

/// Enablement and per-function filters for one internal tool category.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalToolConfig {
    pub enabled: bool,
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// When non-empty, the JSON-serialised input must match at least one
    /// of these regexes or the call is blocked without executing.
    #[serde(default)]
    pub allowlist: Vec<String>,
    /// Per-function execution cap; falls back to the category default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// One external MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    pub enabled: bool,
    pub transport: McpTransport,
    /// stdio transport: command + args + extra env.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// http transport: endpoint URL + request headers.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransport {
    Stdio,
    Http,
}

/// Per-transport bridge instances, indexed by a user-chosen key.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgesConfig {
    pub terminal: TerminalBridgeConfig,
    pub discords: BTreeMap<String, DiscordBridgeConfig>,
    pub telegrams: BTreeMap<String, TelegramBridgeConfig>,
    pub whatsapps: BTreeMap<String, WhatsappBridgeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TerminalBridgeConfig {
    pub enabled: bool,
}

impl Default for TerminalBridgeConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Inbound acceptance mode shared by the chat-platform bridges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BridgeMode {
    /// Accept every message from an allowed channel.
    #[default]
    Full,
    /// Accept only when the bot is mentioned.
    MentionOnly,
    /// Never accept, never produce output.
    ListenOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscordBridgeConfig {
    pub enabled: bool,
    pub env_key_name: String,
    /// Channel id allowlist; empty accepts all.
    #[serde(default)]
    pub allowed_channels: Vec<String>,
    #[serde(default)]
    pub mode: BridgeMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramBridgeConfig {
    pub enabled: bool,
    pub env_key_name: String,
    #[serde(default)]
    pub allowed_chats: Vec<String>,
    #[serde(default)]
    pub mode: BridgeMode,
    /// Opt out of per-message queue reactions and fall back to
    /// send-on-done only.
    #[serde(default)]
    pub simple_queue: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhatsappBridgeConfig {
    pub enabled: bool,
    /// Env variable holding the Graph API access token.
    pub env_key_name: String,
    /// Env variable holding the webhook verify token.
    #[serde(default)]
    pub verify_token_env: Option<String>,
    /// Business phone number id used for outbound sends.
    #[serde(default)]
    pub phone_number_id: Option<String>,
    #[serde(default)]
    pub allowed_chats: Vec<String>,
    #[serde(default)]
    pub mode: BridgeMode,
    /// Mention prefix for `mention-only` mode (e.g. "@tamias").
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxConfig {
    pub engine: SandboxEngine,
    pub image: String,
    pub memory_limit: String,
    pub cpu_limit: String,
    pub network_enabled: bool,
    /// Seconds before a sandboxed command is killed.
    pub timeout: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            engine: SandboxEngine::None,
            image: "debian:bookworm-slim".to_string(),
            memory_limit: "512m".to_string(),
            cpu_limit: "1".to_string(),
            network_enabled: false,
            timeout: DEFAULT_TOOL_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxEngine {
    #[default]
    None,
    Docker,
    Podman,
}

impl TamiasConfig {
    /// Load from the given path, layering `TAMIAS_*` env overrides on top.
    ///
    /// A missing file yields defaults (first-run); a present-but-invalid
    /// file is `ConfigInvalid` — the daemon must fail fast with exit code 3.
    pub fn load(path: &Path) -> Result<Self> {
        let mut figment = Figment::new();
        if path.exists() {
            figment = figment.merge(Json::file(path));
        }
        let config: TamiasConfig = figment
            .merge(Env::prefixed("TAMIAS_").split("__"))
            .extract()
            .map_err(|e| TamiasError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        for (nickname, conn) in &self.connections {
            if conn.env_key_name.is_empty() {
                return Err(TamiasError::Config(format!(
                    "connection '{nickname}' has an empty envKeyName"
                )));
            }
        }
        for entry in &self.default_models {
            if crate::types::ModelRef::parse(entry).is_none() {
                return Err(TamiasError::Config(format!(
                    "defaultModels entry '{entry}' is not '{{nickname}}/{{modelId}}'"
                )));
            }
        }
        for (name, server) in &self.mcp_servers {
            match server.transport {
                McpTransport::Stdio if server.command.is_none() => {
                    return Err(TamiasError::Config(format!(
                        "mcpServers.{name}: stdio transport requires a command"
                    )));
                }
                McpTransport::Http if server.url.is_none() => {
                    return Err(TamiasError::Config(format!(
                        "mcpServers.{name}: http transport requires a url"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Pick the default model for a new session with no override:
    /// first default-chain entry, else the first selected model of the
    /// first connection, else `NoModelConfigured`.
    pub fn pick_default_model(&self) -> Result<String> {
        if let Some(first) = self.default_models.first() {
            return Ok(first.clone());
        }
        for (nickname, conn) in &self.connections {
            if let Some(model) = conn.selected_models.first() {
                return Ok(format!("{nickname}/{model}"));
            }
        }
        Err(TamiasError::NoModelConfigured)
    }
}

/// Load a `.env` file into the process environment via dotenvy.
///
/// Existing variables win — the file only fills gaps, so an operator can
/// override any secret from the shell. Parsing (comments, `export`
/// prefixes, quoting) is dotenvy's; malformed entries are skipped.
pub fn load_env_file(path: &Path) -> Result<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let entries = dotenvy::from_path_iter(path)
        .map_err(|e| TamiasError::Config(format!("{}: {e}", path.display())))?;
    let mut loaded = 0;
    for entry in entries {
        let Ok((key, value)) = entry else {
            continue;
        };
        if std::env::var_os(&key).is_some() {
            continue;
        }
        std::env::set_var(&key, value);
        loaded += 1;
    }
    Ok(loaded)
}

fn bool_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("config.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = TamiasConfig::load(&dir.path().join("nope.json")).unwrap();
        assert!(config.connections.is_empty());
        assert!(config.bridges.terminal.enabled);
    }

    #[test]
    fn malformed_file_is_config_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "{not json");
        assert!(matches!(
            TamiasConfig::load(&path),
            Err(TamiasError::Config(_))
        ));
    }

    #[test]
    fn parses_connections_and_bridges() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"{
                "version": "1.0",
                "connections": {
                    "openai": {
                        "provider": "openai",
                        "envKeyName": "OPENAI_API_KEY",
                        "selectedModels": ["gpt-4o"]
                    }
                },
                "defaultModels": ["openai/gpt-4o"],
                "bridges": {
                    "discords": {
                        "main": {
                            "enabled": true,
                            "envKeyName": "DISCORD_TOKEN",
                            "mode": "mention-only"
                        }
                    }
                }
            }"#,
        );
        let config = TamiasConfig::load(&path).unwrap();
        assert_eq!(config.connections["openai"].provider, Provider::OpenAi);
        assert_eq!(
            config.bridges.discords["main"].mode,
            BridgeMode::MentionOnly
        );
        assert_eq!(config.pick_default_model().unwrap(), "openai/gpt-4o");
    }

    #[test]
    fn default_model_falls_back_to_first_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"{
                "connections": {
                    "local": {
                        "provider": "ollama",
                        "envKeyName": "OLLAMA_KEY",
                        "selectedModels": ["llama3.1"]
                    }
                }
            }"#,
        );
        let config = TamiasConfig::load(&path).unwrap();
        assert_eq!(config.pick_default_model().unwrap(), "local/llama3.1");
    }

    #[test]
    fn no_models_anywhere_is_an_error() {
        let config = TamiasConfig::default();
        assert!(matches!(
            config.pick_default_model(),
            Err(TamiasError::NoModelConfigured)
        ));
    }

    #[test]
    fn bad_default_model_entry_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, r#"{"defaultModels": ["gpt-4o"]}"#);
        assert!(TamiasConfig::load(&path).is_err());
    }

    #[test]
    fn env_file_fills_gaps_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "TAMIAS_TEST_A=one\n# comment\nTAMIAS_TEST_B=\"two\"\nexport TAMIAS_TEST_C=three\n",
        )
        .unwrap();
        std::env::set_var("TAMIAS_TEST_A", "preset");
        let loaded = load_env_file(&path).unwrap();
        assert_eq!(loaded, 2);
        assert_eq!(std::env::var("TAMIAS_TEST_A").unwrap(), "preset");
        assert_eq!(std::env::var("TAMIAS_TEST_B").unwrap(), "two");
        // `export` prefixes are part of the dotenvy grammar.
        assert_eq!(std::env::var("TAMIAS_TEST_C").unwrap(), "three");
        std::env::remove_var("TAMIAS_TEST_A");
        std::env::remove_var("TAMIAS_TEST_B");
        std::env::remove_var("TAMIAS_TEST_C");
    }
}
