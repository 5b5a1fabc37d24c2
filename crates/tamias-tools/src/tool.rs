use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Result of executing a tool, as fed back to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Text content returned to the LLM.
    pub content: String,
    /// Whether the tool execution failed.
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    /// Structured failure — the LLM receives `{"success":false,"error":…}`
    /// and decides how to react; the turn continues.
    pub fn failure(error: impl Into<String>) -> Self {
        let body = serde_json::json!({ "success": false, "error": error.into() });
        Self {
            content: body.to_string(),
            is_error: true,
        }
    }
}

/// Trait implemented by every callable tool, internal or MCP-backed.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Fully qualified name as exposed to the LLM (e.g. `subagent__spawn`).
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the input parameters.
    fn input_schema(&self) -> serde_json::Value;
    async fn execute(&self, input: serde_json::Value) -> ToolResult;
}

/// API-level tool definition handed to provider backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Convert a tool slice to API-level definitions.
pub fn to_definitions(tools: &[Arc<dyn Tool>]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .map(|t| ToolDefinition {
            name: t.name().to_string(),
            description: t.description().to_string(),
            input_schema: t.input_schema(),
        })
        .collect()
}

/// Wrapper applying the per-function guards from config: qualified naming,
/// allowlist regexes over the serialised input, and an execution timeout.
pub struct GuardedTool {
    qualified: String,
    inner: Arc<dyn Tool>,
    allowlist: Vec<Regex>,
    timeout: Option<Duration>,
}

impl GuardedTool {
    pub fn new(
        qualified: impl Into<String>,
        inner: Arc<dyn Tool>,
        allowlist: Vec<Regex>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            qualified: qualified.into(),
            inner,
            allowlist,
            timeout,
        }
    }
}

#[async_trait]
impl Tool for GuardedTool {
    fn name(&self) -> &str {
        &self.qualified
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn input_schema(&self) -> serde_json::Value {
        self.inner.input_schema()
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        if !self.allowlist.is_empty() {
            let serialised = input.to_string();
            if !self.allowlist.iter().any(|re| re.is_match(&serialised)) {
                debug!(tool = %self.qualified, "allowlist blocked call");
                return ToolResult::failure("Allowlist blocked");
            }
        }
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.inner.execute(input)).await {
                Ok(result) => result,
                Err(_) => ToolResult::failure(format!(
                    "Tool timed out after {}s",
                    limit.as_secs()
                )),
            },
            None => self.inner.execute(input).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo input back"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object" })
        }
        async fn execute(&self, input: serde_json::Value) -> ToolResult {
            ToolResult::success(input.to_string())
        }
    }

    struct Sleepy;

    #[async_trait]
    impl Tool for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }
        fn description(&self) -> &str {
            "sleeps forever"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object" })
        }
        async fn execute(&self, _input: serde_json::Value) -> ToolResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ToolResult::success("never")
        }
    }

    #[tokio::test]
    async fn allowlist_blocks_without_invoking() {
        let guarded = GuardedTool::new(
            "cat__echo",
            Arc::new(Echo),
            vec![Regex::new(r#""path":"/safe/"#).unwrap()],
            None,
        );
        let blocked = guarded
            .execute(serde_json::json!({ "path": "/etc/passwd" }))
            .await;
        assert!(blocked.is_error);
        assert!(blocked.content.contains("Allowlist blocked"));

        let allowed = guarded
            .execute(serde_json::json!({ "path": "/safe/notes.txt" }))
            .await;
        assert!(!allowed.is_error);
    }

    #[tokio::test]
    async fn timeout_surfaces_as_structured_failure() {
        let guarded = GuardedTool::new(
            "cat__sleepy",
            Arc::new(Sleepy),
            Vec::new(),
            Some(Duration::from_millis(50)),
        );
        let result = guarded.execute(serde_json::json!({})).await;
        assert!(result.is_error);
        assert!(result.content.contains("timed out"));
    }

    #[test]
    fn failure_is_structured_json() {
        let r = ToolResult::failure("Allowlist blocked");
        let v: serde_json::Value = serde_json::from_str(&r.content).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["error"], "Allowlist blocked");
    }
}
