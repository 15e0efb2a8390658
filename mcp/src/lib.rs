//! Reusable MCP stdio runtime.
//!
//! This crate carries the pieces of the Model Context Protocol that are
//! independent of any particular agent runtime: the JSON-RPC 2.0 frame
//! types ([`protocol`]) and a supervised child-process client speaking
//! line-delimited JSON-RPC over stdio ([`client`]).
//!
//! Frames are UTF-8 lines of at most [`MAX_LINE_BYTES`]; the read buffer
//! starts at [`INITIAL_BUFFER_BYTES`] and grows as needed.

pub mod client;
pub mod protocol;

/// Maximum accepted line length (10 MB).
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// Initial read-buffer capacity (64 KB).
pub const INITIAL_BUFFER_BYTES: usize = 64 * 1024;

pub use client::{McpError, ServerConfig, StdioClient, ToolInfo};
pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION};
