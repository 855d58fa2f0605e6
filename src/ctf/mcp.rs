//! MCP tool provider.
//!
//! When the target exposes a Model-Context-Protocol server, the provider
//! enumerates its tools on connect and offers a callable registry to the
//! planner: each tool by name, description, and parameter schema. Proposed
//! invocations are validated against the schema before they hit the wire;
//! results (including hint-bearing errors) flow back to the scorer and
//! parser.
//!
//! JSON-RPC 2.0 is mandatory; a 1.0-shaped response surfaces as a protocol
//! error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info};

use super::scorers::ToolOutcome;
use crate::error::{Error, Result};

const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.into(),
            params,
            id,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
    #[serde(default)]
    pub id: Option<u64>,
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    /// Enforce the protocol version. A missing or non-2.0 version is a
    /// protocol incompatibility, not a tool failure.
    pub fn check_version(&self) -> Result<()> {
        match self.jsonrpc.as_deref() {
            Some(JSONRPC_VERSION) => Ok(()),
            Some(other) => Err(Error::Protocol(format!(
                "server speaks JSON-RPC {other}, 2.0 required"
            ))),
            None => Err(Error::Protocol(
                "response missing jsonrpc version field (1.0 server?)".to_string(),
            )),
        }
    }
}

/// Session details returned by `connect`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub server_version: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Transport to an MCP server. Concrete transports (stdio, network) live
/// outside this crate.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Open the session.
    async fn connect(&self) -> Result<SessionInfo>;

    /// Send a request and await its response.
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse>;

    /// Fire-and-forget notification.
    async fn send_notification(&self, request: JsonRpcRequest) -> Result<()>;

    /// Close the session. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// A tool advertised by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON-schema-shaped parameter description
    #[serde(default, alias = "inputSchema")]
    pub input_schema: Value,
}

impl ToolDescriptor {
    /// Required parameter names from the schema.
    pub fn required_params(&self) -> Vec<String> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// One-line presentation for the planner.
    pub fn describe(&self) -> String {
        let params: Vec<String> = self
            .input_schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default();
        format!("{}: {} (params: {})", self.name, self.description, params.join(", "))
    }
}

/// Result of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool_name: String,
    pub is_error: bool,
    pub error_message: Option<String>,
    pub content: String,
}

impl ToolResult {
    /// Convert for the tool-execution scorer.
    pub fn to_outcome(&self) -> ToolOutcome {
        ToolOutcome {
            tool_name: self.tool_name.clone(),
            is_error: self.is_error,
            error_message: self.error_message.clone(),
            content: self.content.clone(),
        }
    }
}

/// Callable tool registry over an MCP transport.
pub struct McpToolProvider<T: McpTransport> {
    transport: T,
    tools: HashMap<String, ToolDescriptor>,
    session: Option<SessionInfo>,
    next_id: std::sync::atomic::AtomicU64,
}

impl<T: McpTransport> McpToolProvider<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            tools: HashMap::new(),
            session: None,
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn request_id(&self) -> u64 {
        self.next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// Connect and enumerate the server's tools.
    pub async fn connect(&mut self) -> Result<&SessionInfo> {
        let session = self.transport.connect().await?;
        info!(server = ?session.server_name, "MCP session established");

        let response = self
            .transport
            .send_request(JsonRpcRequest::new("tools/list", None, self.request_id()))
            .await?;
        response.check_version()?;

        if response.error.is_some() {
            // The server is up but cannot list tools; surface what it does
            // advertise.
            return Err(Error::CapabilityUnavailable {
                capability: "tools/list".to_string(),
                available: session.capabilities.clone(),
            });
        } else if let Some(result) = &response.result {
            let tools: Vec<ToolDescriptor> = result
                .get("tools")
                .map(|t| serde_json::from_value(t.clone()))
                .transpose()?
                .unwrap_or_default();
            debug!(count = tools.len(), "enumerated MCP tools");
            self.tools = tools.into_iter().map(|t| (t.name.clone(), t)).collect();
        }

        self.session = Some(session);
        Ok(self.session.as_ref().expect("session just stored"))
    }

    /// Tools available to the planner, sorted by name.
    pub fn list_tools(&self) -> Vec<&ToolDescriptor> {
        let mut tools: Vec<&ToolDescriptor> = self.tools.values().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Look up one tool.
    pub fn get_tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    /// Invoke a tool after validating required parameters against its
    /// schema.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult> {
        let tool = self.tools.get(name).ok_or_else(|| {
            Error::CapabilityUnavailable {
                capability: format!("tool '{name}'"),
                available: self.tools.keys().cloned().collect(),
            }
        })?;

        let supplied = arguments.as_object().cloned().unwrap_or_default();
        for required in tool.required_params() {
            if !supplied.contains_key(&required) {
                return Err(Error::InvalidInput(format!(
                    "tool '{name}' requires parameter '{required}'"
                )));
            }
        }

        let response = self
            .transport
            .send_request(JsonRpcRequest::new(
                "tools/call",
                Some(json!({"name": name, "arguments": arguments})),
                self.request_id(),
            ))
            .await?;
        response.check_version()?;

        if let Some(error) = response.error {
            // Errors still feed the scorer: hint-bearing ones disclose
            // attack surface.
            return Ok(ToolResult {
                tool_name: name.to_string(),
                is_error: true,
                error_message: Some(error.message),
                content: String::new(),
            });
        }

        let content = response
            .result
            .as_ref()
            .and_then(|r| r.get("content"))
            .map(render_content)
            .unwrap_or_default();

        Ok(ToolResult {
            tool_name: name.to_string(),
            is_error: false,
            error_message: None,
            content,
        })
    }

    /// Close the session, releasing the transport.
    pub async fn close(&mut self) -> Result<()> {
        self.tools.clear();
        self.session = None;
        self.transport.close().await
    }
}

/// Flatten MCP content blocks into text.
fn render_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}
