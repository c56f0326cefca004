pub mod connection;
pub mod error;
pub mod events;
pub mod manager;
pub mod transport;
pub mod types;

pub use connection::Connection;
pub use error::{ErrorCode, McpError};
pub use events::{McpEvent, ToolExecutionPhase};
pub use manager::FleetManager;
pub use transport::{Transport, TransportFactory, TransportFault};
pub use types::{
    ConnectionState, ConnectionStatus, RegisteredTool, ServerInfo, ToolCall, ToolDefinition,
    ToolResult,
};
