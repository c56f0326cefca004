//! Typed fleet events broadcast to subscribers.
//!
//! Connection status transitions, tool list refreshes, and tool execution
//! lifecycle changes are published on a broadcast channel so callers observe
//! the fleet without polling it.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::McpError;
use super::types::{ConnectionStatus, ServerInfo, ToolDefinition, ToolResult};

/// Subscribers that fall this far behind start dropping the oldest events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolExecutionPhase {
    Started,
    Completed,
    Failed,
}

/// Event published on the fleet broadcast channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpEvent {
    ConnectionStatusChanged {
        server_id: String,
        timestamp: DateTime<Utc>,
        status: ConnectionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        server_info: Option<ServerInfo>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ToolsUpdated {
        server_id: String,
        timestamp: DateTime<Utc>,
        tools: Vec<ToolDefinition>,
    },
    ToolExecution {
        server_id: String,
        timestamp: DateTime<Utc>,
        tool_name: String,
        execution_id: String,
        phase: ToolExecutionPhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<ToolResult>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        elapsed_ms: Option<u64>,
    },
}

impl McpEvent {
    pub fn status_changed(
        server_id: &str,
        status: ConnectionStatus,
        server_info: Option<ServerInfo>,
        error: Option<String>,
    ) -> Self {
        McpEvent::ConnectionStatusChanged {
            server_id: server_id.to_string(),
            timestamp: Utc::now(),
            status,
            server_info,
            error,
        }
    }

    pub fn tools_updated(server_id: &str, tools: Vec<ToolDefinition>) -> Self {
        McpEvent::ToolsUpdated {
            server_id: server_id.to_string(),
            timestamp: Utc::now(),
            tools,
        }
    }

    pub fn tool_started(server_id: &str, tool_name: &str, execution_id: &str) -> Self {
        McpEvent::ToolExecution {
            server_id: server_id.to_string(),
            timestamp: Utc::now(),
            tool_name: tool_name.to_string(),
            execution_id: execution_id.to_string(),
            phase: ToolExecutionPhase::Started,
            result: None,
            error: None,
            elapsed_ms: None,
        }
    }

    pub fn tool_completed(
        server_id: &str,
        tool_name: &str,
        execution_id: &str,
        result: ToolResult,
        elapsed_ms: u64,
    ) -> Self {
        McpEvent::ToolExecution {
            server_id: server_id.to_string(),
            timestamp: Utc::now(),
            tool_name: tool_name.to_string(),
            execution_id: execution_id.to_string(),
            phase: ToolExecutionPhase::Completed,
            result: Some(result),
            error: None,
            elapsed_ms: Some(elapsed_ms),
        }
    }

    pub fn tool_failed(
        server_id: &str,
        tool_name: &str,
        execution_id: &str,
        error: &McpError,
        elapsed_ms: u64,
    ) -> Self {
        McpEvent::ToolExecution {
            server_id: server_id.to_string(),
            timestamp: Utc::now(),
            tool_name: tool_name.to_string(),
            execution_id: execution_id.to_string(),
            phase: ToolExecutionPhase::Failed,
            result: None,
            error: Some(error.to_string()),
            elapsed_ms: Some(elapsed_ms),
        }
    }

    pub fn server_id(&self) -> &str {
        match self {
            McpEvent::ConnectionStatusChanged { server_id, .. }
            | McpEvent::ToolsUpdated { server_id, .. }
            | McpEvent::ToolExecution { server_id, .. } => server_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            McpEvent::ConnectionStatusChanged { timestamp, .. }
            | McpEvent::ToolsUpdated { timestamp, .. }
            | McpEvent::ToolExecution { timestamp, .. } => *timestamp,
        }
    }
}
