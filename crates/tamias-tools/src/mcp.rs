//! MCP client connections — stdio subprocess and streamable HTTP.
//!
//! Protocol: JSON-RPC 2.0, one object per line on stdio, one POST per
//! request over HTTP. The handshake is `initialize` followed by the
//! `notifications/initialized` notification; after that `tools/list` and
//! `tools/call` are the only methods the registry uses.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tracing::{debug, warn};

use tamias_core::config::{McpServerConfig, McpTransport};
use tamias_core::error::TamiasError;

use crate::tool::{Tool, ToolResult};

const PROTOCOL_VERSION: &str = "2025-06-18";
/// Cap on a single JSON-RPC round trip, handshake included.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// A remote tool as reported by `tools/list`.
#[derive(Debug, Clone)]
pub struct RemoteTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One connected MCP server.
pub struct McpClient {
    pub server_name: String,
    transport: Transport,
    next_id: AtomicU64,
}

enum Transport {
    /// Subprocess with piped stdio. The pair is behind one lock so a
    /// request and its response can never interleave with another call's.
    Stdio {
        child: std::sync::Mutex<Option<Child>>,
        io: tokio::sync::Mutex<(ChildStdin, BufReader<ChildStdout>)>,
    },
    Http {
        client: reqwest::Client,
        url: String,
        headers: BTreeMap<String, String>,
    },
}

impl McpClient {
    /// Connect and perform the initialize handshake.
    pub async fn connect(name: &str, config: &McpServerConfig) -> Result<Self, TamiasError> {
        let transport = match config.transport {
            McpTransport::Stdio => {
                let command = config.command.as_deref().ok_or_else(|| TamiasError::Mcp {
                    server: name.to_string(),
                    reason: "stdio transport requires a command".to_string(),
                })?;
                let mut cmd = tokio::process::Command::new(command);
                cmd.args(&config.args)
                    .envs(&config.env)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .kill_on_drop(true);
                let mut child = cmd.spawn().map_err(|e| TamiasError::Mcp {
                    server: name.to_string(),
                    reason: format!("spawn {command}: {e}"),
                })?;
                let stdin = child.stdin.take().ok_or_else(|| TamiasError::Mcp {
                    server: name.to_string(),
                    reason: "child stdin unavailable".to_string(),
                })?;
                let stdout = child.stdout.take().ok_or_else(|| TamiasError::Mcp {
                    server: name.to_string(),
                    reason: "child stdout unavailable".to_string(),
                })?;
                Transport::Stdio {
                    child: std::sync::Mutex::new(Some(child)),
                    io: tokio::sync::Mutex::new((stdin, BufReader::new(stdout))),
                }
            }
            McpTransport::Http => {
                let url = config.url.clone().ok_or_else(|| TamiasError::Mcp {
                    server: name.to_string(),
                    reason: "http transport requires a url".to_string(),
                })?;
                Transport::Http {
                    client: reqwest::Client::new(),
                    url,
                    headers: config.headers.clone(),
                }
            }
        };

        let client = Self {
            server_name: name.to_string(),
            transport,
            next_id: AtomicU64::new(1),
        };

        client
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "tamias",
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
            )
            .await?;
        client.notify("notifications/initialized", json!({})).await?;
        debug!(server = %name, "MCP server connected");
        Ok(client)
    }

    /// List the server's tools.
    pub async fn list_tools(&self) -> Result<Vec<RemoteTool>, TamiasError> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(|t| t.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(tools
            .iter()
            .filter_map(|t| {
                Some(RemoteTool {
                    name: t.get("name")?.as_str()?.to_string(),
                    description: t
                        .get("description")
                        .and_then(|d| d.as_str())
                        .unwrap_or("")
                        .to_string(),
                    input_schema: t
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| json!({ "type": "object" })),
                })
            })
            .collect())
    }

    /// Invoke a remote tool and flatten the content blocks to text.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> ToolResult {
        let result = match self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await
        {
            Ok(r) => r,
            Err(e) => return ToolResult::failure(e.to_string()),
        };
        let text: String = result
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        if result
            .get("isError")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            ToolResult::failure(text)
        } else {
            ToolResult::success(text)
        }
    }

    /// Close the connection. In-flight calls surface as tool errors; the
    /// owning session is not terminated.
    pub async fn shutdown(&self) {
        if let Transport::Stdio { child, .. } = &self.transport {
            let taken = child.lock().unwrap().take();
            if let Some(mut child) = taken {
                let _ = child.start_kill();
            }
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, TamiasError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let response = tokio::time::timeout(RPC_TIMEOUT, self.round_trip(frame, Some(id)))
            .await
            .map_err(|_| TamiasError::Mcp {
                server: self.server_name.clone(),
                reason: format!("{method} timed out"),
            })??;
        if let Some(error) = response.get("error") {
            return Err(TamiasError::Mcp {
                server: self.server_name.clone(),
                reason: error.to_string(),
            });
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), TamiasError> {
        let frame = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        tokio::time::timeout(RPC_TIMEOUT, self.round_trip(frame, None))
            .await
            .map_err(|_| TamiasError::Mcp {
                server: self.server_name.clone(),
                reason: format!("{method} timed out"),
            })??;
        Ok(())
    }

    /// Send one frame; when `wait_for` is set, read until the response
    /// with that id arrives (skipping server-initiated notifications).
    async fn round_trip(&self, frame: Value, wait_for: Option<u64>) -> Result<Value, TamiasError> {
        match &self.transport {
            Transport::Stdio { io, .. } => {
                let mut guard = io.lock().await;
                let (stdin, stdout) = &mut *guard;
                let mut line = serde_json::to_string(&frame)?;
                line.push('\n');
                stdin
                    .write_all(line.as_bytes())
                    .await
                    .map_err(|e| self.transport_err(e))?;
                stdin.flush().await.map_err(|e| self.transport_err(e))?;

                let Some(expect) = wait_for else {
                    return Ok(Value::Null);
                };
                let mut buf = String::new();
                loop {
                    buf.clear();
                    let n = stdout
                        .read_line(&mut buf)
                        .await
                        .map_err(|e| self.transport_err(e))?;
                    if n == 0 {
                        return Err(TamiasError::Mcp {
                            server: self.server_name.clone(),
                            reason: "server closed stdout".to_string(),
                        });
                    }
                    let trimmed = buf.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let value: Value = match serde_json::from_str(trimmed) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(server = %self.server_name, error = %e, "unparseable MCP frame");
                            continue;
                        }
                    };
                    if value.get("id").and_then(|v| v.as_u64()) == Some(expect) {
                        return Ok(value);
                    }
                    // Notification or an answer to someone else — skip.
                }
            }
            Transport::Http {
                client,
                url,
                headers,
            } => {
                let mut req = client
                    .post(url)
                    .header("content-type", "application/json")
                    .header("accept", "application/json, text/event-stream");
                for (k, v) in headers {
                    req = req.header(k.as_str(), v.as_str());
                }
                let resp = req
                    .json(&frame)
                    .send()
                    .await
                    .map_err(|e| self.transport_err(e))?;
                if wait_for.is_none() {
                    return Ok(Value::Null);
                }
                let status = resp.status();
                let body = resp.text().await.map_err(|e| self.transport_err(e))?;
                if !status.is_success() {
                    return Err(TamiasError::Mcp {
                        server: self.server_name.clone(),
                        reason: format!("HTTP {status}: {body}"),
                    });
                }
                parse_http_body(&body).ok_or_else(|| TamiasError::Mcp {
                    server: self.server_name.clone(),
                    reason: "unparseable response body".to_string(),
                })
            }
        }
    }

    fn transport_err(&self, e: impl std::fmt::Display) -> TamiasError {
        TamiasError::Mcp {
            server: self.server_name.clone(),
            reason: e.to_string(),
        }
    }
}

/// Streamable-HTTP servers may answer a plain JSON body or a short SSE
/// stream; take the first `data:` frame in the latter case.
fn parse_http_body(body: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str(body) {
        return Some(v);
    }
    for line in body.lines() {
        if let Some(data) = line.strip_prefix("data: ") {
            if let Ok(v) = serde_json::from_str(data) {
                return Some(v);
            }
        }
    }
    None
}

/// A remote tool exposed to the LLM as `"{serverName}__{toolName}"`.
pub struct McpTool {
    client: Arc<McpClient>,
    qualified: String,
    remote_name: String,
    description: String,
    schema: Value,
}

impl McpTool {
    pub fn new(client: Arc<McpClient>, remote: RemoteTool) -> Self {
        let qualified = format!("{}__{}", client.server_name, remote.name);
        Self {
            client,
            qualified,
            remote_name: remote.name,
            description: remote.description,
            schema: remote.input_schema,
        }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.qualified
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, input: Value) -> ToolResult {
        self.client.call_tool(&self.remote_name, input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_body_accepts_json_and_sse() {
        let json_body = r#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
        assert!(parse_http_body(json_body).is_some());

        let sse_body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"tools\":[]}}\n\n";
        let parsed = parse_http_body(sse_body).unwrap();
        assert_eq!(parsed["id"], 1);

        assert!(parse_http_body("not json at all").is_none());
    }

    #[tokio::test]
    async fn stdio_handshake_and_call_against_scripted_server() {
        // A minimal MCP server in shell: answers initialize, tools/list and
        // one tools/call, reading line-delimited JSON-RPC from stdin.
        let script = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *initialize*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-06-18","capabilities":{"tools":{}}}}\n' "$id" ;;
    *tools/list*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"ping","description":"pong","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *tools/call*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}],"isError":false}}\n' "$id" ;;
  esac
done
"#;
        let config = McpServerConfig {
            enabled: true,
            transport: McpTransport::Stdio,
            command: Some("sh".to_string()),
            args: vec!["-c".to_string(), script.to_string()],
            env: BTreeMap::new(),
            url: None,
            headers: BTreeMap::new(),
            functions: BTreeMap::new(),
        };

        let client = McpClient::connect("demo", &config).await.expect("connect");
        let tools = client.list_tools().await.expect("list");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "ping");

        let result = client.call_tool("ping", json!({})).await;
        assert!(!result.is_error);
        assert_eq!(result.content, "pong");
        client.shutdown().await;
    }
}
