//! Toolfleet manages a fleet of Model Context Protocol servers for chat
//! applications that want to offer tools from many providers at once.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`config`] describes how each server is reached (a spawned process or a
//!   remote HTTP endpoint) along with its timeout and retry budget, and loads
//!   the fleet definition from a TOML file.
//! - [`mcp::transport`] speaks the wire protocol over stdio pipes or
//!   streamable HTTP behind one [`mcp::Transport`] trait.
//! - [`mcp::connection`] runs the per-server lifecycle: deadline-bounded
//!   connects, retry with backoff, automatic reconnects, and tool execution.
//! - [`mcp::manager`] orchestrates the whole fleet, merging tool registries
//!   and re-broadcasting every connection's events on one channel.
//!
//! Applications typically build a [`mcp::FleetManager`] from a
//! [`config::FleetConfig`], subscribe to its event stream, and call
//! [`mcp::FleetManager::connect_all`] at startup.

pub mod config;
pub mod logging;
pub mod mcp;

pub use config::{ClientConfig, FleetConfig, TransportConfig};
pub use mcp::{Connection, FleetManager, McpError, McpEvent, ToolCall, ToolResult};
