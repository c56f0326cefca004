//! Typed error taxonomy and failure classifier.
//!
//! Raw transport failures arrive as free text; [`ErrorCode::classify`] maps
//! them into a fixed set of categories, each carrying a retry policy, a
//! user-facing message template, and a backoff schedule. Connection and
//! manager code never match on message strings directly.

use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

/// Delay before an automatic reconnect is attempted once retries are
/// exhausted on a transient failure.
pub const AUTO_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Escalating backoff schedule indexed by retry count, capped at the last
/// entry.
const BACKOFF_TABLE: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

/// Failure category derived from raw error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ConnectionTimeout,
    ConnectionRefused,
    AuthenticationFailed,
    PermissionDenied,
    RateLimited,
    ToolNotFound,
    InvalidArguments,
    NetworkError,
    ServerError,
    Unknown,
}

impl ErrorCode {
    /// Categorizes raw error text. Patterns are matched case-insensitively;
    /// the first match wins, falling back to [`ErrorCode::Unknown`].
    pub fn classify(raw: &str) -> Self {
        let text = raw.to_ascii_lowercase();
        if text.contains("timed out") || text.contains("timeout") {
            ErrorCode::ConnectionTimeout
        } else if text.contains("connection refused") || text.contains("econnrefused") {
            ErrorCode::ConnectionRefused
        } else if text.contains("unauthorized")
            || text.contains("authentication")
            || text.contains("401")
        {
            ErrorCode::AuthenticationFailed
        } else if text.contains("permission denied")
            || text.contains("forbidden")
            || text.contains("403")
        {
            ErrorCode::PermissionDenied
        } else if text.contains("rate limit") || text.contains("429") {
            ErrorCode::RateLimited
        } else if text.contains("tool not found") || text.contains("unknown tool") {
            ErrorCode::ToolNotFound
        } else if text.contains("invalid arguments") || text.contains("invalid params") {
            ErrorCode::InvalidArguments
        } else if text.contains("network")
            || text.contains("dns")
            || text.contains("socket")
            || text.contains("connection reset")
            || text.contains("broken pipe")
        {
            ErrorCode::NetworkError
        } else if text.contains("internal error")
            || text.contains("server error")
            || text.contains("500")
            || text.contains("502")
            || text.contains("503")
        {
            ErrorCode::ServerError
        } else {
            ErrorCode::Unknown
        }
    }

    /// Whether retrying the same operation can ever succeed.
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            ErrorCode::AuthenticationFailed
                | ErrorCode::PermissionDenied
                | ErrorCode::ToolNotFound
                | ErrorCode::InvalidArguments
        )
    }

    /// Whether the failure is expected to clear on its own, making the
    /// connection eligible for an automatic reconnect.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionTimeout
                | ErrorCode::ConnectionRefused
                | ErrorCode::RateLimited
                | ErrorCode::NetworkError
        )
    }

    /// Message suitable for surfacing to an end user.
    pub fn user_message(self, display_name: &str) -> String {
        match self {
            ErrorCode::ConnectionTimeout => {
                format!("{display_name} did not respond in time.")
            }
            ErrorCode::ConnectionRefused => {
                format!("{display_name} refused the connection. Is the server running?")
            }
            ErrorCode::AuthenticationFailed => {
                format!("Authentication with {display_name} failed. Check your credentials.")
            }
            ErrorCode::PermissionDenied => {
                format!("{display_name} denied the request.")
            }
            ErrorCode::RateLimited => {
                format!("{display_name} is rate limiting requests. Try again shortly.")
            }
            ErrorCode::ToolNotFound => {
                format!("{display_name} does not provide the requested tool.")
            }
            ErrorCode::InvalidArguments => {
                format!("{display_name} rejected the tool arguments.")
            }
            ErrorCode::NetworkError => {
                format!("A network error interrupted communication with {display_name}.")
            }
            ErrorCode::ServerError => {
                format!("{display_name} reported an internal error.")
            }
            ErrorCode::Unknown => {
                format!("Something went wrong while talking to {display_name}.")
            }
        }
    }

    /// Backoff delay for the given retry count, capped at the table's last
    /// entry.
    pub fn backoff_delay(self, retry_count: u32) -> Duration {
        let index = (retry_count as usize).min(BACKOFF_TABLE.len() - 1);
        BACKOFF_TABLE[index]
    }
}

/// Typed failure surfaced by connections and the fleet manager.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    #[error("connection to '{server_id}' failed: {message}")]
    Connection {
        message: String,
        code: ErrorCode,
        server_id: String,
    },

    #[error("tool '{tool_name}' on '{server_id}' failed: {message}")]
    ToolExecution {
        message: String,
        code: ErrorCode,
        server_id: String,
        tool_name: String,
    },

    #[error("'{server_id}' timed out: {message}")]
    Timeout {
        message: String,
        server_id: String,
        tool_name: Option<String>,
    },
}

impl McpError {
    /// Connection failure with the code derived from the message text.
    pub fn connection(server_id: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        let code = ErrorCode::classify(&message);
        McpError::Connection {
            message,
            code,
            server_id: server_id.into(),
        }
    }

    pub fn connection_with_code(
        server_id: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        McpError::Connection {
            message: message.into(),
            code,
            server_id: server_id.into(),
        }
    }

    /// Tool-call failure with the code derived from the message text.
    pub fn tool_execution(
        server_id: impl Into<String>,
        tool_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        let code = ErrorCode::classify(&message);
        McpError::ToolExecution {
            message,
            code,
            server_id: server_id.into(),
            tool_name: tool_name.into(),
        }
    }

    pub fn timeout(
        server_id: impl Into<String>,
        tool_name: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        McpError::Timeout {
            message: message.into(),
            server_id: server_id.into(),
            tool_name,
        }
    }

    pub fn duplicate_server(server_id: &str) -> Self {
        McpError::connection_with_code(
            server_id,
            ErrorCode::InvalidArguments,
            format!("server '{server_id}' is already registered"),
        )
    }

    pub fn server_not_found(server_id: &str) -> Self {
        McpError::connection_with_code(
            server_id,
            ErrorCode::InvalidArguments,
            format!("server '{server_id}' is not registered"),
        )
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            McpError::Connection { code, .. } | McpError::ToolExecution { code, .. } => *code,
            McpError::Timeout { .. } => ErrorCode::ConnectionTimeout,
        }
    }

    pub fn server_id(&self) -> &str {
        match self {
            McpError::Connection { server_id, .. }
            | McpError::ToolExecution { server_id, .. }
            | McpError::Timeout { server_id, .. } => server_id,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, McpError::Timeout { .. })
    }
}

/// Logs a terminal connection failure and returns the delay after which an
/// automatic reconnect should be scheduled, if the category warrants one.
pub fn handle_connection_error(display_name: &str, err: &McpError) -> Option<Duration> {
    let code = err.code();
    if code.is_transient() {
        warn!(
            server_id = %err.server_id(),
            code = ?code,
            error = %err,
            "MCP connection failed; scheduling automatic reconnect"
        );
        Some(AUTO_RECONNECT_DELAY)
    } else {
        error!(
            server_id = %err.server_id(),
            code = ?code,
            user_message = %code.user_message(display_name),
            "MCP connection failed"
        );
        None
    }
}

/// Recognizes asynchronous transport-teardown messages that background tasks
/// report after the peer goes away. These are expected during shutdown and
/// are logged rather than escalated.
pub fn is_transport_teardown(message: &str) -> bool {
    let text = message.to_ascii_lowercase();
    text.contains("socket closed")
        || text.contains("connection terminated")
        || text.contains("connection closed")
        || text.contains("connection reset")
        || text.contains("peer reset")
        || text.contains("broken pipe")
        || text.contains("process exited")
}
