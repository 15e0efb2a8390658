//! MCP client registry and executor.
//!
//! Holds one lazily-spawned [`StdioClient`](mcp::StdioClient) per
//! configured server, a copy-on-write tool-name → server-name index built
//! at discovery, and the [`McpExecutor`] that routes `Mcp`-mode tool
//! dispatches through it. Duplicate tool names across servers resolve to
//! the first registration and are logged; a dead child gets a single
//! respawn attempt on the next call.

use async_trait::async_trait;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

use mcp::{McpError, ServerConfig, StdioClient, ToolInfo};

use crate::colloquy::error::BoxError;
use crate::colloquy::tool_registry::{
    ExecutionMode, ToolDescriptor, ToolExecution, ToolExecutor, ToolInvocation, ToolOutcome,
};

struct ServerSlot {
    config: ServerConfig,
    client: Mutex<Option<Arc<StdioClient>>>,
}

/// Registry of MCP servers with tool routing.
pub struct McpRegistry {
    slots: HashMap<String, Arc<ServerSlot>>,
    // tool name -> server name; replaced wholesale on discovery.
    index: RwLock<Arc<HashMap<String, String>>>,
}

impl McpRegistry {
    /// Create a registry over the given server configs. No processes are
    /// spawned until first use.
    pub fn new(servers: Vec<ServerConfig>) -> Self {
        let slots = servers
            .into_iter()
            .map(|config| {
                (
                    config.name.clone(),
                    Arc::new(ServerSlot {
                        config,
                        client: Mutex::new(None),
                    }),
                )
            })
            .collect();
        Self {
            slots,
            index: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Names of the configured servers.
    pub fn server_names(&self) -> Vec<String> {
        self.slots.keys().cloned().collect()
    }

    /// The server currently routing a tool name, if any.
    pub fn server_for(&self, tool_name: &str) -> Option<String> {
        self.index.read().unwrap().get(tool_name).cloned()
    }

    async fn client_for(&self, server: &str) -> Result<Arc<StdioClient>, McpError> {
        let slot = self
            .slots
            .get(server)
            .ok_or_else(|| McpError::Spawn(format!("unknown server '{}'", server)))?;
        let mut guard = slot.client.lock().await;
        if let Some(client) = guard.as_ref() {
            if client.is_alive() {
                return Ok(Arc::clone(client));
            }
            // Child died since last use; drop the stale client and respawn.
            warn!("mcp server '{}' died, respawning", server);
        }
        let client = Arc::new(StdioClient::spawn(&slot.config)?);
        client.initialize().await?;
        *guard = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Spawn every server (as needed), list its tools, and rebuild the
    /// routing index. Returns the discovered tools with their owning
    /// server so callers can register descriptors. Duplicate names keep
    /// the first server seen, in configured order.
    pub async fn discover(&self) -> Result<Vec<(String, ToolInfo)>, BoxError> {
        let mut index: HashMap<String, String> = HashMap::new();
        let mut discovered = Vec::new();

        // Deterministic order: configured server names sorted for stable
        // first-wins resolution across runs.
        let mut names: Vec<&String> = self.slots.keys().collect();
        names.sort();

        for server in names {
            let client = self.client_for(server).await?;
            let tools = client.list_tools().await?;
            for tool in tools {
                if let Some(existing) = index.get(&tool.name) {
                    warn!(
                        "duplicate mcp tool '{}' on server '{}'; keeping '{}'",
                        tool.name, server, existing
                    );
                    continue;
                }
                index.insert(tool.name.clone(), server.clone());
                discovered.push((server.clone(), tool));
            }
        }

        info!("mcp discovery indexed {} tool(s)", index.len());
        *self.index.write().unwrap() = Arc::new(index);
        Ok(discovered)
    }

    /// Call a tool, routing via the index (or a pinned server). A dead
    /// child gets one respawn-and-retry before the call fails.
    pub async fn call(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        pinned_server: Option<&str>,
    ) -> Result<serde_json::Value, McpError> {
        let server = match pinned_server {
            Some(name) => name.to_string(),
            None => self.server_for(tool_name).ok_or_else(|| {
                McpError::Spawn(format!("no server routes tool '{}'", tool_name))
            })?,
        };

        let client = self.client_for(&server).await?;
        match client.call_tool(tool_name, arguments.clone()).await {
            Err(McpError::Closed) | Err(McpError::Transport(_)) => {
                // Single respawn attempt; client_for sees the dead client.
                let client = self.client_for(&server).await?;
                client.call_tool(tool_name, arguments).await
            }
            other => other,
        }
    }

    /// Close every spawned client.
    pub async fn close_all(&self) {
        for slot in self.slots.values() {
            let mut guard = slot.client.lock().await;
            if let Some(client) = guard.take() {
                client.close().await;
            }
        }
    }
}

/// Tool executor routing `Mcp`-mode dispatches to the registry.
pub struct McpExecutor {
    registry: Arc<McpRegistry>,
}

impl McpExecutor {
    /// Wrap a registry.
    pub fn new(registry: Arc<McpRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ToolExecutor for McpExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Mcp
    }

    async fn execute(
        &self,
        descriptor: &ToolDescriptor,
        invocation: &ToolInvocation,
    ) -> Result<ToolExecution, BoxError> {
        let pinned = descriptor.config.server.as_deref();
        let outcome = match self
            .registry
            .call(&invocation.name, invocation.arguments.clone(), pinned)
            .await
        {
            Ok(result) => ToolOutcome::ok(result),
            Err(McpError::Rpc(err)) => ToolOutcome::error(err.to_string()),
            Err(McpError::Spawn(msg)) => ToolOutcome::error(format!("server-unavailable: {}", msg)),
            Err(err) => ToolOutcome::error(err.to_string()),
        };
        Ok(ToolExecution::Completed(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn responder(name: &str, tool: &str) -> ServerConfig {
        ServerConfig {
            name: name.into(),
            command: "sh".into(),
            args: vec![
                "-c".into(),
                format!(
                    r#"i=1; while read line; do case "$line" in *tools/list*) printf '{{"jsonrpc":"2.0","id":%d,"result":{{"tools":[{{"name":"{tool}","description":"d","inputSchema":{{"type":"object"}}}}]}}}}\n' "$i";; *) printf '{{"jsonrpc":"2.0","id":%d,"result":{{"from":"{name}"}}}}\n' "$i";; esac; i=$((i+1)); done"#
                ),
            ],
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn discovery_builds_first_wins_index() {
        // Both servers advertise "shared"; sorted order makes "a" win.
        let registry = McpRegistry::new(vec![responder("a", "shared"), responder("b", "shared")]);
        let discovered = registry.discover().await.unwrap();
        assert_eq!(discovered.len(), 1);
        assert_eq!(registry.server_for("shared").as_deref(), Some("a"));
        registry.close_all().await;
    }

    #[tokio::test]
    async fn call_routes_through_index() {
        let registry = McpRegistry::new(vec![responder("only", "echo")]);
        registry.discover().await.unwrap();
        let result = registry
            .call("echo", serde_json::json!({"x": 1}), None)
            .await
            .unwrap();
        assert_eq!(result["from"], "only");
        registry.close_all().await;
    }

    #[tokio::test]
    async fn unrouted_tool_fails() {
        let registry = McpRegistry::new(vec![]);
        let err = registry
            .call("ghost", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no server routes"));
    }

    #[tokio::test]
    async fn dead_server_respawns_once() {
        // Server exits after the first non-list request; next call must
        // succeed through a respawn.
        let config = ServerConfig {
            name: "flaky".into(),
            command: "sh".into(),
            args: vec![
                "-c".into(),
                r#"i=1; while read line; do case "$line" in *initialize*) printf '{"jsonrpc":"2.0","id":%d,"result":{}}\n' "$i";; *) printf '{"jsonrpc":"2.0","id":%d,"result":{"ok":true}}\n' "$i"; exit 0;; esac; i=$((i+1)); done"#.into(),
            ],
            env: HashMap::new(),
        };
        let registry = McpRegistry::new(vec![config]);
        let first = registry
            .call("anything", serde_json::json!({}), Some("flaky"))
            .await
            .unwrap();
        assert_eq!(first["ok"], true);

        // Give the child time to exit so is_alive flips.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let second = registry
            .call("anything", serde_json::json!({}), Some("flaky"))
            .await
            .unwrap();
        assert_eq!(second["ok"], true);
        registry.close_all().await;
    }
}
