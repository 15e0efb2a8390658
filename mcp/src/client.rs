//! Supervised stdio MCP client.
//!
//! [`StdioClient::spawn`] launches the configured command with piped
//! stdio, dedicates one task to reading stdout frames and one to draining
//! stderr, and serializes writes behind a mutex. Requests are correlated
//! to responses by id through a pending map; when the child exits, every
//! in-flight request fails with [`McpError::Closed`] and the client
//! reports itself dead so the owning registry can respawn.

use log::{debug, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};

use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::{INITIAL_BUFFER_BYTES, MAX_LINE_BYTES};

/// Description of an MCP server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Registry name for this server.
    pub name: String,
    /// Executable to spawn.
    pub command: String,
    /// Command arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
}

/// A tool advertised by a server's `tools/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolInfo {
    /// Tool name.
    pub name: String,
    /// Tool description.
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the arguments.
    #[serde(rename = "inputSchema", default)]
    pub input_schema: serde_json::Value,
}

/// Errors surfaced by the stdio client.
#[derive(Debug)]
pub enum McpError {
    /// The child process could not be started.
    Spawn(String),
    /// A read or write on the child's stdio failed.
    Transport(String),
    /// The server answered with a JSON-RPC error.
    Rpc(crate::protocol::JsonRpcError),
    /// The child exited (or was closed) with requests in flight.
    Closed,
    /// A frame exceeded [`MAX_LINE_BYTES`].
    FrameTooLarge(usize),
}

impl std::fmt::Display for McpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            McpError::Spawn(msg) => write!(f, "failed to spawn server: {}", msg),
            McpError::Transport(msg) => write!(f, "transport error: {}", msg),
            McpError::Rpc(err) => write!(f, "{}", err),
            McpError::Closed => write!(f, "server connection closed"),
            McpError::FrameTooLarge(len) => {
                write!(f, "frame of {} bytes exceeds {} byte limit", len, MAX_LINE_BYTES)
            }
        }
    }
}

impl std::error::Error for McpError {}

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value, McpError>>>>>;

/// Line-delimited JSON-RPC 2.0 client over a child process's stdio.
pub struct StdioClient {
    name: String,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    pending: PendingMap,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    reader: tokio::task::JoinHandle<()>,
    stderr_drain: Option<tokio::task::JoinHandle<()>>,
}

impl StdioClient {
    /// Spawn the server process and start its supervision tasks.
    pub fn spawn(config: &ServerConfig) -> Result<Self, McpError> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| McpError::Spawn(format!("{}: {}", config.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Spawn("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Spawn("child stdout unavailable".into()))?;
        let stderr = child.stderr.take();

        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let reader_pending = Arc::clone(&pending);
        let reader_alive = Arc::clone(&alive);
        let server_name = config.name.clone();
        let reader = tokio::spawn(async move {
            let mut reader = BufReader::with_capacity(INITIAL_BUFFER_BYTES, stdout);
            let mut line = Vec::with_capacity(INITIAL_BUFFER_BYTES);
            loop {
                line.clear();
                match read_limited_line(&mut reader, &mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = match std::str::from_utf8(&line) {
                            Ok(t) => t.trim(),
                            Err(_) => {
                                warn!("mcp[{}]: non-UTF-8 frame dropped", server_name);
                                continue;
                            }
                        };
                        if text.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcResponse>(text) {
                            Ok(response) => {
                                route_response(&reader_pending, response, &server_name);
                            }
                            Err(err) => {
                                warn!("mcp[{}]: unparseable frame: {}", server_name, err);
                            }
                        }
                    }
                    Err(err) => {
                        warn!("mcp[{}]: read failed: {}", server_name, err);
                        break;
                    }
                }
            }
            reader_alive.store(false, Ordering::SeqCst);
            // Fail everything still waiting.
            let mut pending = reader_pending.lock().unwrap();
            for (_, sender) in pending.drain() {
                let _ = sender.send(Err(McpError::Closed));
            }
        });

        let stderr_drain = stderr.map(|stderr| {
            let server_name = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("mcp[{}] stderr: {}", server_name, line);
                }
            })
        });

        Ok(Self {
            name: config.name.clone(),
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            reader,
            stderr_drain,
        })
    }

    /// Registry name of the server this client talks to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True while the child's stdout is open.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Send one request and await its response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        if !self.is_alive() {
            return Err(McpError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = serde_json::to_string(&JsonRpcRequest::new(id, method, params))
            .map_err(|e| McpError::Transport(e.to_string()))?;
        if frame.len() + 1 > MAX_LINE_BYTES {
            return Err(McpError::FrameTooLarge(frame.len() + 1));
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        {
            let mut stdin = self.stdin.lock().await;
            let write = async {
                stdin.write_all(frame.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await
            };
            if let Err(err) = write.await {
                self.pending.lock().unwrap().remove(&id);
                return Err(McpError::Transport(err.to_string()));
            }
        }

        rx.await.map_err(|_| McpError::Closed)?
    }

    /// Perform the MCP `initialize` handshake.
    pub async fn initialize(&self) -> Result<serde_json::Value, McpError> {
        self.request(
            "initialize",
            Some(serde_json::json!({
                "protocolVersion": "2024-11-05",
                "clientInfo": {"name": "colloquy", "version": env!("CARGO_PKG_VERSION")},
                "capabilities": {}
            })),
        )
        .await
    }

    /// List the server's tools.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>, McpError> {
        let result = self.request("tools/list", None).await?;
        let tools = result
            .get("tools")
            .cloned()
            .unwrap_or_else(|| serde_json::json!([]));
        serde_json::from_value(tools).map_err(|e| McpError::Transport(e.to_string()))
    }

    /// Invoke a tool.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        self.request(
            "tools/call",
            Some(serde_json::json!({"name": name, "arguments": arguments})),
        )
        .await
    }

    /// Kill the child and stop the supervision tasks.
    pub async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
        self.reader.abort();
        if let Some(handle) = &self.stderr_drain {
            handle.abort();
        }
    }
}

fn route_response(pending: &PendingMap, response: JsonRpcResponse, server_name: &str) {
    let Some(id) = response.id else {
        debug!("mcp[{}]: notification ignored", server_name);
        return;
    };
    let sender = pending.lock().unwrap().remove(&id);
    let Some(sender) = sender else {
        warn!("mcp[{}]: response for unknown id {}", server_name, id);
        return;
    };
    let outcome = match (response.result, response.error) {
        (_, Some(error)) => Err(McpError::Rpc(error)),
        (Some(result), None) => Ok(result),
        (None, None) => Ok(serde_json::Value::Null),
    };
    let _ = sender.send(outcome);
}

/// Read one newline-terminated line, failing when it exceeds the frame
/// limit. Returns the number of bytes read (0 on EOF).
async fn read_limited_line<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<usize> {
    let mut total = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(total);
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                if total + pos > MAX_LINE_BYTES {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "frame exceeds line limit",
                    ));
                }
                buf.extend_from_slice(&available[..pos]);
                let consumed = pos + 1;
                reader.consume(consumed);
                return Ok(total + consumed);
            }
            None => {
                let len = available.len();
                if total + len > MAX_LINE_BYTES {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "frame exceeds line limit",
                    ));
                }
                buf.extend_from_slice(available);
                reader.consume(len);
                total += len;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_responder() -> ServerConfig {
        // Answers every line with a result frame whose id counts up from 1,
        // matching the client's id sequence.
        ServerConfig {
            name: "responder".into(),
            command: "sh".into(),
            args: vec![
                "-c".into(),
                r#"i=1; while read line; do printf '{"jsonrpc":"2.0","id":%d,"result":{"tools":[{"name":"echo","description":"echoes","inputSchema":{"type":"object"}}]}}\n' "$i"; i=$((i+1)); done"#.into(),
            ],
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn initialize_and_list_tools() {
        let client = StdioClient::spawn(&echo_responder()).unwrap();
        client.initialize().await.unwrap();
        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
        client.close().await;
    }

    #[tokio::test]
    async fn rpc_error_is_surfaced() {
        let config = ServerConfig {
            name: "errorer".into(),
            command: "sh".into(),
            args: vec![
                "-c".into(),
                r#"read line; printf '{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"no such method"}}\n'"#.into(),
            ],
            env: HashMap::new(),
        };
        let client = StdioClient::spawn(&config).unwrap();
        let err = client.request("nope", None).await.unwrap_err();
        assert!(matches!(err, McpError::Rpc(ref e) if e.code == -32601));
        client.close().await;
    }

    #[tokio::test]
    async fn child_exit_fails_in_flight_requests() {
        let config = ServerConfig {
            name: "quitter".into(),
            command: "sh".into(),
            args: vec!["-c".into(), "read line; exit 0".into()],
            env: HashMap::new(),
        };
        let client = StdioClient::spawn(&config).unwrap();
        let err = client.request("anything", None).await.unwrap_err();
        assert!(matches!(err, McpError::Closed));
        assert!(!client.is_alive());
        client.close().await;
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let config = ServerConfig {
            name: "ghost".into(),
            command: "/definitely/not/a/binary".into(),
            args: vec![],
            env: HashMap::new(),
        };
        assert!(matches!(
            StdioClient::spawn(&config),
            Err(McpError::Spawn(_))
        ));
    }
}
