//! Per-session tool resolution.
//!
//! `build_active_tools` composes the effective tool set for one session:
//! enabled internal categories, per-function filters and allowlist guards,
//! the bound agent's restrictions, and connected MCP servers. MCP
//! connection failures are logged and skipped — a dead server never takes
//! the session down with it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::warn;

use tamias_core::config::{FunctionConfig, TamiasConfig};
use tamias_core::types::Agent;
use tamias_sessions::{SessionHandle, SessionStore};

use crate::builtin;
use crate::mcp::{McpClient, McpTool};
use crate::tool::{to_definitions, GuardedTool, Tool, ToolDefinition};

/// Internal tool categories the config may address. Categories without
/// in-core implementations are external collaborators; their configs are
/// resolved the same way but contribute nothing here.
pub const INTERNAL_CATEGORIES: &[&str] = &[
    "terminal",
    "workspace",
    "session",
    "subagent",
    "image",
    "github",
    "cron",
    "email",
    "tamias-self",
    "swarm",
    "memory",
];

/// Capabilities tools need from their host process. Implemented by the
/// gateway's `AppState`; tools and the registry stay free of any dependency
/// on the orchestrator or the HTTP layer.
#[async_trait]
pub trait ToolHost: Send + Sync {
    fn store(&self) -> &SessionStore;

    /// Look up a named agent by id or slug.
    fn find_agent(&self, key: &str) -> Option<Agent>;

    /// All configured agents.
    fn agents(&self) -> Vec<Agent>;

    /// Perform an agent handoff for the given session. Returns the new
    /// session id, or a user-presentable error string.
    async fn handoff(
        &self,
        session_id: &str,
        target_agent: &str,
        reason: &str,
        context: Option<String>,
    ) -> Result<String, String>;

    fn debug(&self) -> bool {
        false
    }
}

/// The effective tool set for one session, plus the MCP client handles the
/// runner must close on session shutdown.
pub struct ActiveTools {
    pub tools: Vec<Arc<dyn Tool>>,
    pub tool_names: Vec<String>,
    pub mcp_clients: Vec<Arc<McpClient>>,
}

impl ActiveTools {
    pub fn find(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        to_definitions(&self.tools)
    }

    pub async fn shutdown(&self) {
        for client in &self.mcp_clients {
            client.shutdown().await;
        }
    }
}

/// Compose the effective tool set for `session`.
pub async fn build_active_tools(
    host: &Arc<dyn ToolHost>,
    session: &Arc<SessionHandle>,
) -> ActiveTools {
    let config = host.store().config().clone();
    let agent = session
        .with(|s| s.agent_id.clone().or_else(|| s.agent_slug.clone()))
        .and_then(|key| host.find_agent(&key));

    let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
    let mut mcp_clients = Vec::new();

    collect_internal(host, session, &config, agent.as_ref(), &mut tools);
    collect_mcp(&config, agent.as_ref(), &mut tools, &mut mcp_clients).await;

    let tool_names = tools.iter().map(|t| t.name().to_string()).collect();
    ActiveTools {
        tools,
        tool_names,
        mcp_clients,
    }
}

fn collect_internal(
    host: &Arc<dyn ToolHost>,
    session: &Arc<SessionHandle>,
    config: &TamiasConfig,
    agent: Option<&Agent>,
    out: &mut Vec<Arc<dyn Tool>>,
) {
    let restriction = agent
        .map(|a| a.allowed_tools.as_slice())
        .filter(|list| !list.is_empty());

    for category in INTERNAL_CATEGORIES.iter().copied() {
        let category_config = config.internal_tools.get(category);
        if category_config.map(|c| !c.enabled).unwrap_or(false) {
            continue;
        }
        if let Some(allowed) = restriction {
            if !allowed.iter().any(|t| t == category) {
                continue;
            }
        }
        for tool in builtin::category_tools(category, host, &session.id) {
            let function_config = category_config.and_then(|c| c.functions.get(tool.name()));
            if function_config.map(|f| !f.enabled).unwrap_or(false) {
                continue;
            }
            let qualified = format!("{category}__{}", tool.name());
            out.push(guard(qualified, tool, function_config));
        }
    }
}

async fn collect_mcp(
    config: &TamiasConfig,
    agent: Option<&Agent>,
    out: &mut Vec<Arc<dyn Tool>>,
    clients: &mut Vec<Arc<McpClient>>,
) {
    let restriction = agent
        .map(|a| a.allowed_mcp_servers.as_slice())
        .filter(|list| !list.is_empty());

    for (name, server) in &config.mcp_servers {
        if !server.enabled {
            continue;
        }
        if let Some(allowed) = restriction {
            if !allowed.iter().any(|s| s == name) {
                continue;
            }
        }
        let client = match McpClient::connect(name, server).await {
            Ok(c) => Arc::new(c),
            Err(e) => {
                warn!(server = %name, error = %e, "MCP connect failed, skipping server");
                continue;
            }
        };
        let remote_tools = match client.list_tools().await {
            Ok(t) => t,
            Err(e) => {
                warn!(server = %name, error = %e, "MCP listTools failed, skipping server");
                client.shutdown().await;
                continue;
            }
        };
        for remote in remote_tools {
            let function_config = server.functions.get(&remote.name);
            if function_config.map(|f| !f.enabled).unwrap_or(false) {
                continue;
            }
            let tool: Arc<dyn Tool> = Arc::new(McpTool::new(client.clone(), remote));
            let qualified = tool.name().to_string();
            out.push(guard(qualified, tool, function_config));
        }
        clients.push(client);
    }
}

/// Apply a function's config guards, keeping the fully qualified name.
fn guard(
    qualified: String,
    tool: Arc<dyn Tool>,
    function_config: Option<&FunctionConfig>,
) -> Arc<dyn Tool> {
    let mut allowlist = Vec::new();
    let mut timeout = None;
    if let Some(fc) = function_config {
        for pattern in &fc.allowlist {
            match Regex::new(pattern) {
                Ok(re) => allowlist.push(re),
                Err(e) => {
                    warn!(tool = %qualified, pattern = %pattern, error = %e, "invalid allowlist regex ignored")
                }
            }
        }
        timeout = fc.timeout_secs.map(Duration::from_secs);
    }
    Arc::new(GuardedTool::new(qualified, tool, allowlist, timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tamias_core::config::{Connection, InternalToolConfig, Provider};
    use tamias_core::paths::DataRoot;
    use tamias_sessions::CreateSessionParams;

    struct TestHost {
        store: SessionStore,
        agents: Vec<Agent>,
    }

    #[async_trait]
    impl ToolHost for TestHost {
        fn store(&self) -> &SessionStore {
            &self.store
        }
        fn find_agent(&self, key: &str) -> Option<Agent> {
            self.agents
                .iter()
                .find(|a| a.id == key || a.slug == key)
                .cloned()
        }
        fn agents(&self) -> Vec<Agent> {
            self.agents.clone()
        }
        async fn handoff(
            &self,
            _session_id: &str,
            _target_agent: &str,
            _reason: &str,
            _context: Option<String>,
        ) -> Result<String, String> {
            Err("no orchestrator in tests".to_string())
        }
    }

    fn base_config() -> TamiasConfig {
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
        config
    }

    fn host_with(config: TamiasConfig, agents: Vec<Agent>) -> (tempfile::TempDir, Arc<dyn ToolHost>) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(DataRoot::at(dir.path()), config);
        (dir, Arc::new(TestHost { store, agents }))
    }

    #[tokio::test]
    async fn default_set_contains_qualified_builtin_names() {
        let (_dir, host) = host_with(base_config(), vec![]);
        let session = host
            .store()
            .create_session(CreateSessionParams::default())
            .unwrap();
        let active = build_active_tools(&host, &session).await;
        assert!(active.tool_names.contains(&"subagent__spawn".to_string()));
        assert!(active.tool_names.contains(&"swarm__transfer_to_agent".to_string()));
        assert!(active.tool_names.contains(&"session__status".to_string()));
        assert!(active.mcp_clients.is_empty());
    }

    #[tokio::test]
    async fn disabled_category_is_skipped_entirely() {
        let mut config = base_config();
        config.internal_tools.insert(
            "subagent".to_string(),
            InternalToolConfig {
                enabled: false,
                functions: BTreeMap::new(),
            },
        );
        let (_dir, host) = host_with(config, vec![]);
        let session = host
            .store()
            .create_session(CreateSessionParams::default())
            .unwrap();
        let active = build_active_tools(&host, &session).await;
        assert!(!active
            .tool_names
            .iter()
            .any(|n| n.starts_with("subagent__")));
        assert!(active.tool_names.contains(&"swarm__list_agents".to_string()));
    }

    #[tokio::test]
    async fn disabled_function_is_dropped() {
        let mut config = base_config();
        let mut functions = BTreeMap::new();
        functions.insert(
            "spawn".to_string(),
            FunctionConfig {
                enabled: false,
                allowlist: Vec::new(),
                timeout_secs: None,
            },
        );
        config.internal_tools.insert(
            "subagent".to_string(),
            InternalToolConfig {
                enabled: true,
                functions,
            },
        );
        let (_dir, host) = host_with(config, vec![]);
        let session = host
            .store()
            .create_session(CreateSessionParams::default())
            .unwrap();
        let active = build_active_tools(&host, &session).await;
        assert!(!active.tool_names.contains(&"subagent__spawn".to_string()));
        assert!(active.tool_names.contains(&"subagent__callback".to_string()));
    }

    #[tokio::test]
    async fn agent_allowed_tools_restricts_categories() {
        let agent = Agent {
            id: "ag_1".to_string(),
            slug: "alice".to_string(),
            name: "Alice".to_string(),
            instructions: String::new(),
            model: None,
            model_fallbacks: vec![],
            enabled: true,
            channels: vec![],
            extra_skills: vec![],
            allowed_tools: vec!["session".to_string()],
            allowed_mcp_servers: vec![],
        };
        let (_dir, host) = host_with(base_config(), vec![agent]);
        let session = host
            .store()
            .create_session(CreateSessionParams {
                agent_id: Some("ag_1".to_string()),
                agent_slug: Some("alice".to_string()),
                ..Default::default()
            })
            .unwrap();
        let active = build_active_tools(&host, &session).await;
        assert!(active.tool_names.iter().all(|n| n.starts_with("session__")));
        assert!(!active.tool_names.is_empty());
    }

    #[tokio::test]
    async fn unreachable_mcp_server_is_nonfatal() {
        let mut config = base_config();
        config.mcp_servers.insert(
            "broken".to_string(),
            tamias_core::config::McpServerConfig {
                enabled: true,
                transport: tamias_core::config::McpTransport::Stdio,
                command: Some("/nonexistent/mcp-server".to_string()),
                args: vec![],
                env: BTreeMap::new(),
                url: None,
                headers: BTreeMap::new(),
                functions: BTreeMap::new(),
            },
        );
        let (_dir, host) = host_with(config, vec![]);
        let session = host
            .store()
            .create_session(CreateSessionParams::default())
            .unwrap();
        let active = build_active_tools(&host, &session).await;
        assert!(active.mcp_clients.is_empty());
        assert!(active.tool_names.contains(&"session__status".to_string()));
    }
}
