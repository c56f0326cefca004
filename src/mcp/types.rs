//! Shared data model for the MCP fleet runtime.
//!
//! These types are the crate's public vocabulary: connection snapshots,
//! discovered tools, tool invocations, and their results. Wire-level
//! representations live in [`crate::mcp::transport`]; everything here is
//! transport-agnostic.

use chrono::{DateTime, Utc};
use rust_mcp_schema::ContentBlock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Lifecycle phase of a single server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity reported by a server during the initialize handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub protocol_version: String,
}

/// One callable tool as advertised by a server.
///
/// `input_schema` is kept as raw JSON; this layer does not validate
/// arguments against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

/// A tool invocation routed to one server.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: Map::new(),
        }
    }

    pub fn with_arguments(mut self, arguments: Map<String, Value>) -> Self {
        self.arguments = arguments;
        self
    }
}

/// Content returned by a completed tool call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub content: Vec<ContentBlock>,
    pub is_error: Option<bool>,
}

impl ToolResult {
    /// True when the server flagged the result as an error payload.
    pub fn failed(&self) -> bool {
        self.is_error.unwrap_or(false)
    }
}

/// Point-in-time snapshot of one connection.
///
/// `available_tools` is non-empty only while `status` is
/// [`ConnectionStatus::Connected`]; `retry_count` resets to zero on every
/// successful connect.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub server_info: Option<ServerInfo>,
    pub available_tools: Vec<ToolDefinition>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: u32,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            server_info: None,
            available_tools: Vec::new(),
            last_connected_at: None,
            last_error: None,
            retry_count: 0,
        }
    }
}

/// A tool in the merged fleet registry, tagged with the server that owns it
/// so callers can route the invocation back through the right connection.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredTool {
    pub server_id: String,
    pub definition: ToolDefinition,
}
