//! Orchestrator protocol — newline-delimited JSON-RPC 2.0 over stdio
//!
//! Wire format:
//!
//! Orchestrator → Bridge (request):
//!   { "jsonrpc": "2.0", "id": 1, "method": "tools/call",
//!     "params": { "name": "assign_task", "arguments": { ... } } }
//!
//! Bridge → Orchestrator (response):
//!   { "jsonrpc": "2.0", "id": 1, "result": { ... } }
//!   { "jsonrpc": "2.0", "id": 1, "error": { "code": -32601, "message": "..." } }
//!
//! Tool results are wrapped as
//!   { "content": [{ "type": "text", "text": "<json-string>" }], "isError": true? }
//!
//! Stdout carries protocol traffic only; all logging goes to stderr.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// RPC request from the orchestrator.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    /// Absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// RPC response to the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self::err(id, -32601, format!("Method not found: {}", method))
    }

    pub fn invalid_params(id: Value, message: impl Into<String>) -> Self {
        Self::err(id, -32602, message)
    }

    pub fn internal_error(id: Value, message: impl Into<String>) -> Self {
        Self::err(id, -32603, message)
    }
}

/// RPC error detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Tool-call result payloads
// ---------------------------------------------------------------------------

/// One content block of a tool result. Only text blocks are produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".into(),
            text: text.into(),
        }
    }
}

/// The `tools/call` result shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default, skip_serializing_if = "is_false")]
    pub is_error: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl ToolCallResult {
    /// Successful result carrying a JSON payload serialized into a text block.
    pub fn json(value: &Value) -> Self {
        Self {
            content: vec![ToolContent::text(
                serde_json::to_string(value).unwrap_or_else(|_| value.to_string()),
            )],
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(message)],
            is_error: true,
        }
    }
}
