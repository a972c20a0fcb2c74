use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::context::ToolContext;
use crate::tools::{tools_call, tools_list};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;

const SUPPORTED_METHODS: [&str; 4] = ["initialize", "ping", "tools/list", "tools/call"];

// MCP Protocol Types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeRequest {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(rename = "clientInfo")]
    pub client_info: ClientInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCapabilities {
    pub tools: Option<ToolsCapability>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsCapability {
    #[serde(rename = "listChanged")]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

// MCP Protocol Handlers
pub async fn initialize(request: Option<InitializeRequest>) -> Result<InitializeResult> {
    if let Some(request) = &request {
        tracing::info!(
            client = %request.client_info.name,
            client_version = %request.client_info.version,
            protocol = %request.protocol_version,
            "Client connected"
        );
    }
    Ok(InitializeResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: ServerCapabilities {
            tools: Some(ToolsCapability {
                list_changed: Some(false),
            }),
        },
        server_info: ServerInfo {
            name: "sandkeep".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    })
}

pub async fn ping(_request: Option<Value>) -> Result<Value> {
    Ok(json!({}))
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<Option<T>> {
    match params {
        Some(p) => Ok(Some(serde_json::from_value(p)?)),
        None => Ok(None),
    }
}

pub async fn handle_rpc_request(
    method: &str,
    params: Option<Value>,
    context: &ToolContext,
) -> Result<Value> {
    match method {
        "initialize" => {
            let result = initialize(parse_params(params)?).await?;
            Ok(serde_json::to_value(result)?)
        }
        "ping" => ping(params).await,
        "tools/list" => {
            let result = tools_list(parse_params(params)?).await?;
            Ok(serde_json::to_value(result)?)
        }
        "tools/call" => {
            let result = tools_call(parse_params(params)?, context).await?;
            Ok(serde_json::to_value(result)?)
        }
        _ => Err(anyhow!("Unknown method: {}", method)),
    }
}

fn error_response(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message.into()
        }
    })
}

/// Turn one input line into its JSON-RPC response.
/// Notifications and blank lines produce no response.
pub async fn handle_line(line: &str, context: &ToolContext) -> Option<Value> {
    if line.trim().is_empty() {
        return None;
    }

    let request: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            return Some(error_response(
                Value::Null,
                PARSE_ERROR,
                format!("Parse error: {}", e),
            ))
        }
    };
    let id = request.get("id").cloned();

    let Some(method) = request.get("method").and_then(|m| m.as_str()) else {
        return Some(error_response(
            id.unwrap_or(Value::Null),
            INVALID_REQUEST,
            "Request has no method",
        ));
    };

    // Notifications don't require responses
    if method.starts_with("notifications/") {
        tracing::debug!(method, "Notification received");
        return None;
    }
    let id = id.unwrap_or(Value::Null);

    if !SUPPORTED_METHODS.contains(&method) {
        return Some(error_response(
            id,
            METHOD_NOT_FOUND,
            format!("Unknown method: {}", method),
        ));
    }

    let params = request.get("params").cloned();
    match handle_rpc_request(method, params, context).await {
        Ok(result) => Some(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result
        })),
        Err(error) => {
            tracing::warn!(method, error = %error, "Request failed");
            Some(error_response(id, INTERNAL_ERROR, error.to_string()))
        }
    }
}
