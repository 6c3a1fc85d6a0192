//! JSON-RPC handler for the attestation service
//!
//! The service speaks the tool-call dialect used by agent clients: a session
//! opens with `initialize`, and the status is fetched by calling the
//! `attestation_status` tool.
//!
//! ## Supported Methods
//!
//! - `initialize`: Returns server info and capabilities
//! - `ping`: Liveness check, returns `{}`
//! - `tools/list`: Lists the available tools
//! - `tools/call`: Calls a tool; `attestation_status` always, the
//!   secret-consuming tools when a [`Toolbox`] is attached
//!
//! Requests without an `id` are notifications and get no response.

use crate::error::{Error, Result};
use crate::status::StatusAggregator;
use crate::tools::Toolbox;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Protocol revision announced in `initialize`
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// Name of the status query tool
pub const STATUS_TOOL: &str = "attestation_status";

/// JSON-RPC request structure
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

impl RpcRequest {
    pub fn call(method: &str, params: Option<serde_json::Value>, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: Some(serde_json::Value::from(id)),
        }
    }

    pub fn notification(method: &str) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: None,
            id: None,
        }
    }
}

/// JSON-RPC response structure
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: serde_json::Value,
}

/// JSON-RPC error structure
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

// RPC error codes
pub(crate) const PARSE_ERROR: i32 = -32700;
pub(crate) const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;

/// Parameters for tools/call
#[derive(Debug, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<serde_json::Value>,
}

/// RPC handler for the attestation service
#[derive(Debug, Clone)]
pub struct RpcHandler {
    status: StatusAggregator,
    tools: Option<Arc<Toolbox>>,
}

impl RpcHandler {
    /// Creates a handler serving only the status tool
    pub fn new(status: StatusAggregator) -> Self {
        Self {
            status,
            tools: None,
        }
    }

    /// Creates a handler that also serves the secret-consuming tools
    pub fn with_tools(status: StatusAggregator, tools: Arc<Toolbox>) -> Self {
        Self {
            status,
            tools: Some(tools),
        }
    }

    /// Handles an incoming JSON-RPC message
    ///
    /// Returns `None` for notifications.
    pub async fn handle(&self, request_body: &[u8]) -> Option<Vec<u8>> {
        let response = match serde_json::from_slice::<RpcRequest>(request_body) {
            Ok(request) => self.process_request(request).await?,
            Err(e) => error_response(serde_json::Value::Null, PARSE_ERROR, format!("Parse error: {}", e)),
        };

        Some(serde_json::to_vec(&response).unwrap_or_else(|_| {
            br#"{"jsonrpc":"2.0","error":{"code":-32603,"message":"Internal error"},"id":null}"#
                .to_vec()
        }))
    }

    /// Processes a parsed RPC request
    async fn process_request(&self, request: RpcRequest) -> Option<RpcResponse> {
        debug!(method = %request.method, "Processing RPC request");

        let Some(id) = request.id else {
            debug!(method = %request.method, "Received notification");
            return None;
        };

        if request.jsonrpc != "2.0" {
            return Some(error_response(
                id,
                INVALID_REQUEST,
                "Invalid JSON-RPC version".to_string(),
            ));
        }

        let result = match request.method.as_str() {
            "initialize" => self.handle_initialize(),
            "ping" => Ok(serde_json::json!({})),
            "tools/list" => self.handle_tools_list(),
            "tools/call" => self.handle_tools_call(request.params).await,
            _ => Err(Error::Rpc(format!("Method not found: {}", request.method))),
        };

        Some(match result {
            Ok(value) => RpcResponse {
                jsonrpc: "2.0".to_string(),
                result: Some(value),
                error: None,
                id,
            },
            Err(e) => {
                let code = match &e {
                    Error::Rpc(msg) if msg.starts_with("Method not found") => METHOD_NOT_FOUND,
                    Error::Rpc(msg) if msg.starts_with("Invalid params") => INVALID_PARAMS,
                    _ => INTERNAL_ERROR,
                };
                error_response(id, code, e.to_string())
            }
        })
    }

    /// Handles "initialize" - returns server identity and capabilities
    fn handle_initialize(&self) -> Result<serde_json::Value> {
        let status = self.status.status();
        info!(server = %status.server, "Client session initialized");
        Ok(serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": {
                "name": status.server,
                "version": status.version,
            },
            "capabilities": {
                "tools": { "listChanged": false }
            }
        }))
    }

    /// Handles "tools/list"
    fn handle_tools_list(&self) -> Result<serde_json::Value> {
        let mut tools = vec![serde_json::json!({
            "name": STATUS_TOOL,
            "description": "Report whether the server runs inside a hardware TEE and which \
                            secrets were loaded (names only, never values).",
            "inputSchema": {
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }
        })];
        if let Some(toolbox) = &self.tools {
            tools.extend(toolbox.definitions());
        }
        Ok(serde_json::json!({ "tools": tools }))
    }

    /// Handles "tools/call"
    async fn handle_tools_call(
        &self,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let params: ToolCallParams = parse_params(params)?;

        if params.name != STATUS_TOOL {
            return match &self.tools {
                Some(toolbox) if toolbox.handles(&params.name) => {
                    match toolbox.call(&params.name, params.arguments).await {
                        Ok(output) => tool_result(serde_json::to_string(&output)?, false),
                        Err(e @ Error::Rpc(_)) => Err(e),
                        Err(e) => {
                            warn!(tool = %params.name, error = %e, "Tool call failed");
                            tool_result(e.to_string(), true)
                        }
                    }
                }
                _ => Err(Error::Rpc(format!("Invalid params: unknown tool {}", params.name))),
            };
        }

        let status = self.status.query();
        info!(
            running_in_tee = status.running_in_tee,
            verdict = status.verdict(),
            "Serving attestation status"
        );

        tool_result(serde_json::to_string(&status)?, false)
    }
}

/// A `tools/call` result carrying one text block
fn tool_result(text: String, is_error: bool) -> Result<serde_json::Value> {
    Ok(serde_json::json!({
        "content": [{
            "type": "text",
            "text": text,
        }],
        "isError": is_error
    }))
}

pub(crate) fn error_response(id: serde_json::Value, code: i32, message: String) -> RpcResponse {
    RpcResponse {
        jsonrpc: "2.0".to_string(),
        result: None,
        error: Some(RpcError { code, message }),
        id,
    }
}

/// Helper to parse RPC params
fn parse_params<T: serde::de::DeserializeOwned>(params: Option<serde_json::Value>) -> Result<T> {
    params
        .and_then(|p| {
            if p.is_array() {
                p.as_array().and_then(|arr| arr.first().cloned())
            } else {
                Some(p)
            }
        })
        .ok_or_else(|| Error::Rpc("Invalid params: missing params".to_string()))
        .and_then(|p| {
            serde_json::from_value(p).map_err(|e| Error::Rpc(format!("Invalid params: {}", e)))
        })
}
