//! Shared MCP transport abstractions.
//!
//! Implementations normalize protocol differences across stdio and streamable
//! HTTP so higher-level code can preserve common state invariants. Wire-level
//! failures are reported as strings here and converted to typed errors at the
//! transport boundary.

use crate::config::{ClientConfig, TransportConfig};
use crate::mcp::error::McpError;
use crate::mcp::types::{ServerInfo, ToolDefinition, ToolResult};
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::ServerMessage;
use rust_mcp_schema::{
    CallToolResult, ClientCapabilities, Implementation, InitializeRequestParams, InitializeResult,
    ListToolsResult, PaginatedRequestParams, RpcError, LATEST_PROTOCOL_VERSION,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod stdio;
pub mod streamable_http;

/// JSON-RPC code used by servers to indicate unsupported list methods.
pub const MCP_METHOD_NOT_FOUND: i64 = -32601;

/// Upper bound on tools accepted from a single server across all pages.
pub const MAX_TOOL_LIST: usize = 100;

/// Supported MCP transport backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    StreamableHttp,
}

impl TransportKind {
    pub fn of(config: &TransportConfig) -> Self {
        match config {
            TransportConfig::Process { .. } => TransportKind::Stdio,
            TransportConfig::Remote { .. } => TransportKind::StreamableHttp,
        }
    }
}

/// Asynchronous failure reported by a transport's background tasks, outside
/// any in-flight request. The fleet manager drains these so a dying server
/// process never takes the host process down with it.
#[derive(Debug, Clone)]
pub struct TransportFault {
    pub server_id: String,
    pub message: String,
}

/// Transport contract required by the connection state machine.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Runs the initialize handshake, including the initialized notification.
    async fn initialize(&self) -> Result<ServerInfo, McpError>;

    /// Fetches the server's full tool listing, following pagination cursors.
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, McpError>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<ToolResult, McpError>;

    /// Whether the underlying channel is still usable.
    fn is_alive(&self) -> bool;

    /// Tears the channel down. Safe to call more than once.
    async fn close(&self);
}

/// Opens transports for the fleet. Swapped out in tests.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        server_id: &str,
        config: &ClientConfig,
        faults: mpsc::UnboundedSender<TransportFault>,
    ) -> Result<Arc<dyn Transport>, McpError>;
}

/// Production factory: spawns a child process for [`TransportConfig::Process`]
/// entries and builds an HTTP client for [`TransportConfig::Remote`] ones.
pub struct DefaultTransportFactory;

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn open(
        &self,
        server_id: &str,
        config: &ClientConfig,
        faults: mpsc::UnboundedSender<TransportFault>,
    ) -> Result<Arc<dyn Transport>, McpError> {
        match TransportKind::of(&config.transport) {
            TransportKind::Stdio => {
                let transport = stdio::StdioTransport::spawn(server_id, config, faults).await?;
                Ok(transport as Arc<dyn Transport>)
            }
            TransportKind::StreamableHttp => {
                let transport = streamable_http::HttpTransport::new(server_id, config)?;
                Ok(transport as Arc<dyn Transport>)
            }
        }
    }
}

pub(crate) fn client_details() -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "toolfleet".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Toolfleet MCP Client".to_string()),
            description: Some("Toolfleet MCP client runtime".to_string()),
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    }
}

pub(crate) fn paginated_params(cursor: Option<String>) -> Option<PaginatedRequestParams> {
    cursor.map(|cursor| PaginatedRequestParams {
        cursor: Some(cursor),
        meta: None,
    })
}

/// Returns true when a server reports the JSON-RPC method-not-found code.
pub(crate) fn is_method_not_found(message: &ServerMessage) -> bool {
    matches!(
        message,
        ServerMessage::Error(error) if error.error.code == MCP_METHOD_NOT_FOUND
    )
}

pub(crate) fn parse_initialize_result(message: ServerMessage) -> Result<InitializeResult, String> {
    let value = parse_response_value(message)?;
    let result =
        serde_json::from_value::<InitializeResult>(value).map_err(|err| err.to_string())?;
    if result.protocol_version.trim().is_empty() {
        return Err("Unexpected initialize response.".to_string());
    }
    Ok(result)
}

pub(crate) fn parse_list_tools(message: ServerMessage) -> Result<ListToolsResult, String> {
    parse_response(message)
}

pub(crate) fn parse_call_tool(message: ServerMessage) -> Result<CallToolResult, String> {
    parse_response(message)
}

fn parse_response<T: serde::de::DeserializeOwned>(message: ServerMessage) -> Result<T, String> {
    let value = parse_response_value(message)?;
    serde_json::from_value::<T>(value).map_err(|err| err.to_string())
}

pub(crate) fn parse_response_value(message: ServerMessage) -> Result<Value, String> {
    match message {
        ServerMessage::Response(response) => {
            serde_json::to_value(&response.result).map_err(|err| err.to_string())
        }
        ServerMessage::Error(error) => Err(format_rpc_error(&error.error)),
        other => Err(format_unexpected_server_message(&other)),
    }
}

pub(crate) fn format_unexpected_server_message(message: &ServerMessage) -> String {
    format!("Unexpected MCP server message: {message:?}")
}

pub(crate) fn format_rpc_error(error: &RpcError) -> String {
    let mut output = format!("MCP error {}: {}", error.code, error.message);
    if let Some(data) = &error.data {
        let details = data
            .get("details")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .or_else(|| data.as_str().map(|value| value.to_string()))
            .or_else(|| serde_json::to_string_pretty(data).ok());

        if let Some(details) = details {
            if !details.is_empty() {
                output.push('\n');
                output.push_str(&details);
            }
        }
    }
    output
}

pub(crate) fn server_info_from(result: &InitializeResult) -> ServerInfo {
    ServerInfo {
        name: result.server_info.name.clone(),
        version: result.server_info.version.clone(),
        protocol_version: result.protocol_version.clone(),
    }
}

pub(crate) fn tool_definitions_from(result: ListToolsResult) -> Vec<ToolDefinition> {
    result
        .tools
        .into_iter()
        .map(|tool| {
            let input_schema = serde_json::to_value(&tool.input_schema)
                .unwrap_or_else(|_| Value::Object(Map::new()));
            ToolDefinition {
                name: tool.name,
                description: tool.description,
                input_schema,
            }
        })
        .collect()
}

pub(crate) fn tool_result_from(result: CallToolResult) -> ToolResult {
    ToolResult {
        content: result.content,
        is_error: result.is_error,
    }
}
