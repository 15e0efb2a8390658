//! JSON-RPC 2.0 frame types.
//!
//! Only the subset MCP uses over stdio: requests with numeric ids,
//! responses carrying either `result` or `error`, and the standard error
//! codes −32700…−32603.

use serde::{Deserialize, Serialize};

/// The fixed `jsonrpc` field value.
pub const JSONRPC_VERSION: &str = "2.0";

/// Parse error (`-32700`).
pub const PARSE_ERROR: i64 = -32700;
/// Invalid request (`-32600`).
pub const INVALID_REQUEST: i64 = -32600;
/// Method not found (`-32601`).
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid params (`-32602`).
pub const INVALID_PARAMS: i64 = -32602;
/// Internal error (`-32603`).
pub const INTERNAL_ERROR: i64 = -32603;

/// An outgoing JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Request id. `None` for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Method name, e.g. `"tools/call"`.
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Build a request frame.
    pub fn new(id: u64, method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code; standard codes are −32700…−32603.
    pub code: i64,
    /// Short error description.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.message)
    }
}

/// An incoming JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Id of the request this answers; absent on notifications.
    #[serde(default)]
    pub id: Option<u64>,
    /// Success payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Failure payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_without_null_params() {
        let req = JsonRpcRequest::new(1, "tools/list", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn response_parses_result_and_error_shapes() {
        let ok: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"result":{"tools":[]}}"#).unwrap();
        assert_eq!(ok.id, Some(3));
        assert!(ok.result.is_some());
        assert!(ok.error.is_none());

        let err: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"no such method"}}"#,
        )
        .unwrap();
        assert_eq!(err.error.as_ref().unwrap().code, METHOD_NOT_FOUND);
    }
}
