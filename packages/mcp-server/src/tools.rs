use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

use crate::context::ToolContext;
use sandkeep_sandbox::{ExecutionRequest, ExecutionTarget, SandboxError, SessionStatus};

// MCP Tool Types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsRequest {
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
    #[serde(rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: ToolInputSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInputSchema {
    #[serde(rename = "type")]
    pub type_name: String,
    pub properties: HashMap<String, ToolInputSchemaProperty>,
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInputSchemaProperty {
    #[serde(rename = "type")]
    pub type_name: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "enum")]
    pub enum_values: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolRequest {
    pub name: String,
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError")]
    pub is_error: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

// Request types for our tools
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartRequest {
    pub registry_name: String,
    pub language: Option<String>,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StopRequest {
    pub session_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecuteRequest {
    pub session_id: Option<String>,
    /// Runs in a throwaway session when no session_id is given
    pub registry_name: Option<String>,
    pub language: String,
    pub code: String,
    pub timeout_secs: Option<u64>,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartTerminalRequest {
    pub session_id: String,
    pub port: Option<u16>,
    pub command: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TerminalUrlRequest {
    pub session_id: String,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListSessionsRequest {
    #[serde(default)]
    pub include_terminated: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmptyRequest {}

/// A tool call that failed, rendered as `{"error": {"kind", "message"}}`
#[derive(Debug, Clone, PartialEq)]
pub struct ToolFailure {
    pub kind: String,
    pub message: String,
}

impl ToolFailure {
    fn invalid_arguments(message: impl Into<String>) -> Self {
        Self {
            kind: "invalid_arguments".to_string(),
            message: message.into(),
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "error": {
                "kind": self.kind,
                "message": self.message
            }
        })
    }
}

impl From<SandboxError> for ToolFailure {
    fn from(error: SandboxError) -> Self {
        Self {
            kind: error.kind().as_str().to_string(),
            message: error.to_string(),
        }
    }
}

type ToolOutcome = std::result::Result<Value, ToolFailure>;

fn property(type_name: &str, description: &str) -> ToolInputSchemaProperty {
    ToolInputSchemaProperty {
        type_name: Some(type_name.to_string()),
        description: Some(description.to_string()),
        enum_values: None,
    }
}

fn tool(
    name: &str,
    description: &str,
    properties: Vec<(&str, ToolInputSchemaProperty)>,
    required: &[&str],
) -> Tool {
    Tool {
        name: name.to_string(),
        description: Some(description.to_string()),
        input_schema: ToolInputSchema {
            type_name: "object".to_string(),
            properties: properties
                .into_iter()
                .map(|(key, prop)| (key.to_string(), prop))
                .collect(),
            required: required.iter().map(|r| r.to_string()).collect(),
        },
    }
}

/// Every tool this server exposes, in a stable order
pub fn tool_definitions() -> Vec<Tool> {
    let session_id = || property("string", "Session identifier returned by sandbox_start");
    vec![
        tool(
            "sandbox_start",
            "Start a sandbox session from an allow-listed registry entry",
            vec![
                ("registry_name", property("string", "Registry entry name or alias")),
                ("language", property("string", "Language to pin the session to")),
                (
                    "ttl_secs",
                    property("integer", "Idle time-to-live in seconds; defaults to the entry's"),
                ),
            ],
            &["registry_name"],
        ),
        tool(
            "sandbox_stop",
            "Stop a session and remove its container. Stopping twice succeeds.",
            vec![
                ("session_id", session_id()),
                ("reason", property("string", "Recorded in the server log")),
            ],
            &["session_id"],
        ),
        tool(
            "sandbox_execute",
            "Run code in a session, or in a throwaway session when only registry_name is given",
            vec![
                ("session_id", session_id()),
                (
                    "registry_name",
                    property("string", "Registry entry for a throwaway session"),
                ),
                ("language", property("string", "Language name or alias")),
                ("code", property("string", "Source code to run")),
                ("timeout_secs", property("integer", "Execution deadline in seconds")),
                ("ttl_secs", property("integer", "TTL of the throwaway session")),
            ],
            &["language", "code"],
        ),
        tool(
            "sandbox_start_terminal",
            "Launch a web terminal inside a session and return its URL",
            vec![
                ("session_id", session_id()),
                ("port", property("integer", "Container port the terminal listens on")),
                ("command", property("string", "Terminal server command")),
            ],
            &["session_id"],
        ),
        tool(
            "sandbox_terminal_url",
            "Look up the terminal URL of a session; url is null when none is running",
            vec![
                ("session_id", session_id()),
                ("port", property("integer", "Container port the terminal listens on")),
            ],
            &["session_id"],
        ),
        tool(
            "sandbox_list",
            "List tracked sessions",
            vec![(
                "include_terminated",
                property("boolean", "Include recently terminated sessions"),
            )],
            &[],
        ),
        tool(
            "sandbox_get",
            "Get one session",
            vec![("session_id", session_id())],
            &["session_id"],
        ),
        tool("registry_list", "List allow-listed registry entries", vec![], &[]),
        tool("languages_list", "List supported languages", vec![], &[]),
        tool(
            "registry_reload",
            "Re-read the registry file; the current entries stay in force if it is invalid",
            vec![],
            &[],
        ),
    ]
}

// Tool handlers
pub async fn tools_list(_request: Option<ListToolsRequest>) -> Result<ListToolsResult> {
    Ok(ListToolsResult {
        tools: tool_definitions(),
        next_cursor: None,
    })
}

pub async fn tools_call(
    request: Option<CallToolRequest>,
    context: &ToolContext,
) -> Result<CallToolResult> {
    let call_request = request.ok_or_else(|| anyhow!("Missing tool call parameters"))?;
    tracing::debug!(tool = %call_request.name, "Tool call");

    let outcome = match call_request.name.as_str() {
        "sandbox_start" => sandbox_start(context, call_request.arguments).await,
        "sandbox_stop" => sandbox_stop(context, call_request.arguments).await,
        "sandbox_execute" => sandbox_execute(context, call_request.arguments).await,
        "sandbox_start_terminal" => sandbox_start_terminal(context, call_request.arguments).await,
        "sandbox_terminal_url" => sandbox_terminal_url(context, call_request.arguments).await,
        "sandbox_list" => sandbox_list(context, call_request.arguments).await,
        "sandbox_get" => sandbox_get(context, call_request.arguments).await,
        "registry_list" => registry_list(context, call_request.arguments).await,
        "languages_list" => languages_list(context, call_request.arguments),
        "registry_reload" => registry_reload(context, call_request.arguments).await,
        _ => Err(ToolFailure {
            kind: "unknown_tool".to_string(),
            message: format!("Unknown tool: {}", call_request.name),
        }),
    };

    Ok(match outcome {
        Ok(payload) => CallToolResult {
            content: vec![text_content(&payload)],
            is_error: None,
        },
        Err(failure) => {
            tracing::debug!(tool = %call_request.name, kind = %failure.kind, "Tool call failed");
            CallToolResult {
                content: vec![text_content(&failure.to_json())],
                is_error: Some(true),
            }
        }
    })
}

fn text_content(payload: &Value) -> ToolContent {
    ToolContent {
        content_type: "text".to_string(),
        text: serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string()),
    }
}

fn parse_args<T: DeserializeOwned>(arguments: Option<Value>) -> std::result::Result<T, ToolFailure> {
    let arguments = match arguments {
        None | Some(Value::Null) => json!({}),
        Some(value) => value,
    };
    serde_json::from_value(arguments)
        .map_err(|e| ToolFailure::invalid_arguments(format!("Failed to parse arguments: {}", e)))
}

fn to_payload<T: Serialize>(value: &T) -> ToolOutcome {
    serde_json::to_value(value).map_err(|e| ToolFailure {
        kind: "internal".to_string(),
        message: format!("Serialization error: {}", e),
    })
}

async fn sandbox_start(context: &ToolContext, arguments: Option<Value>) -> ToolOutcome {
    let args: StartRequest = parse_args(arguments)?;
    let session = context
        .service()
        .lifecycle()
        .start(
            &args.registry_name,
            args.language.as_deref(),
            args.ttl_secs.map(Duration::from_secs),
        )
        .await?;
    to_payload(&session)
}

async fn sandbox_stop(context: &ToolContext, arguments: Option<Value>) -> ToolOutcome {
    let args: StopRequest = parse_args(arguments)?;
    let reason = args.reason.as_deref().unwrap_or("requested");
    let outcome = context
        .service()
        .lifecycle()
        .stop(&args.session_id, reason)
        .await?;
    Ok(json!({
        "session_id": args.session_id,
        "outcome": to_payload(&outcome)?
    }))
}

async fn sandbox_execute(context: &ToolContext, arguments: Option<Value>) -> ToolOutcome {
    let args: ExecuteRequest = parse_args(arguments)?;
    let target = match (args.session_id, args.registry_name) {
        (Some(session_id), None) => ExecutionTarget::Session { session_id },
        (None, Some(registry_name)) => ExecutionTarget::Ephemeral {
            registry_name,
            ttl_secs: args.ttl_secs,
        },
        (Some(_), Some(_)) => {
            return Err(ToolFailure::invalid_arguments(
                "Give either session_id or registry_name, not both",
            ))
        }
        (None, None) => {
            return Err(ToolFailure::invalid_arguments(
                "session_id or registry_name is required",
            ))
        }
    };

    let result = context
        .service()
        .executor()
        .run(ExecutionRequest {
            target,
            language: args.language,
            code: args.code,
            timeout: args.timeout_secs.map(Duration::from_secs),
        })
        .await?;
    to_payload(&result)
}

async fn sandbox_start_terminal(context: &ToolContext, arguments: Option<Value>) -> ToolOutcome {
    let args: StartTerminalRequest = parse_args(arguments)?;
    let info = context
        .service()
        .terminal()
        .start_terminal(&args.session_id, args.port, args.command.as_deref())
        .await?;
    Ok(json!({
        "session_id": args.session_id,
        "ok": info.ok,
        "host_port": info.host_port,
        "url": info.url
    }))
}

async fn sandbox_terminal_url(context: &ToolContext, arguments: Option<Value>) -> ToolOutcome {
    let args: TerminalUrlRequest = parse_args(arguments)?;
    let lookup = context
        .service()
        .terminal()
        .get_terminal_url(&args.session_id, args.port)
        .await;
    Ok(json!({
        "session_id": args.session_id,
        "url": lookup.url(),
        "terminal": to_payload(&lookup)?
    }))
}

async fn sandbox_list(context: &ToolContext, arguments: Option<Value>) -> ToolOutcome {
    let args: ListSessionsRequest = parse_args(arguments)?;
    let mut sessions = context.service().lifecycle().list_sessions().await;
    if !args.include_terminated {
        sessions.retain(|s| s.status != SessionStatus::Terminated);
    }
    Ok(json!({
        "total": sessions.len(),
        "sessions": to_payload(&sessions)?
    }))
}

async fn sandbox_get(context: &ToolContext, arguments: Option<Value>) -> ToolOutcome {
    let args: SessionRequest = parse_args(arguments)?;
    let session = context
        .service()
        .lifecycle()
        .get_session(&args.session_id)
        .await?;
    to_payload(&session)
}

async fn registry_list(context: &ToolContext, arguments: Option<Value>) -> ToolOutcome {
    let _: EmptyRequest = parse_args(arguments)?;
    let entries = context.service().registry().list().await;
    let entries: Vec<_> = entries.iter().map(|entry| entry.as_ref()).collect();
    Ok(json!({
        "total": entries.len(),
        "entries": to_payload(&entries)?
    }))
}

fn languages_list(context: &ToolContext, arguments: Option<Value>) -> ToolOutcome {
    let _: EmptyRequest = parse_args(arguments)?;
    let languages = context.service().languages().specs();
    Ok(json!({
        "total": languages.len(),
        "languages": to_payload(&languages)?
    }))
}

async fn registry_reload(context: &ToolContext, arguments: Option<Value>) -> ToolOutcome {
    let _: EmptyRequest = parse_args(arguments)?;
    let count = context.service().registry().reload().await?;
    Ok(json!({ "reloaded": true, "entries": count }))
}
