//! Fleet-level orchestration across all configured MCP servers.
//!
//! [`FleetManager`] owns one [`Connection`] per server, fans fleet-wide
//! operations out with all-settled semantics, merges tool listings into a
//! single registry, and re-broadcasts every connection's events on one
//! shared channel. A background supervisor drains transport fault reports
//! so a crashed server process degrades that one connection instead of
//! the whole fleet.

use crate::config::{ClientConfig, FleetConfig};
use crate::mcp::connection::Connection;
use crate::mcp::error::{is_transport_teardown, ErrorCode, McpError};
use crate::mcp::events::{McpEvent, EVENT_CHANNEL_CAPACITY};
use crate::mcp::transport::{DefaultTransportFactory, TransportFactory, TransportFault};
use crate::mcp::types::{ConnectionState, ConnectionStatus, RegisteredTool, ToolCall, ToolResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub struct FleetManager {
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    forwarders: StdMutex<HashMap<String, JoinHandle<()>>>,
    events: broadcast::Sender<McpEvent>,
    factory: Arc<dyn TransportFactory>,
    faults_tx: mpsc::UnboundedSender<TransportFault>,
    fault_supervisor: JoinHandle<()>,
}

impl FleetManager {
    pub fn new() -> Self {
        Self::with_factory(Arc::new(DefaultTransportFactory))
    }

    pub fn with_factory(factory: Arc<dyn TransportFactory>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let fault_supervisor = tokio::spawn(Self::supervise_faults(faults_rx));
        Self {
            connections: Mutex::new(HashMap::new()),
            forwarders: StdMutex::new(HashMap::new()),
            events,
            factory,
            faults_tx,
            fault_supervisor,
        }
    }

    /// Builds a manager with every server from the configuration registered
    /// but not yet connected.
    pub async fn from_config(config: FleetConfig) -> Result<Self, McpError> {
        let manager = Self::new();
        for (server_id, client_config) in config.servers {
            manager.add_server(&server_id, client_config).await?;
        }
        Ok(manager)
    }

    /// Subscribes to the merged event stream for the whole fleet.
    pub fn subscribe(&self) -> broadcast::Receiver<McpEvent> {
        self.events.subscribe()
    }

    /// Registers a server under a case-insensitive identifier. The server is
    /// not connected until [`connect_server`](Self::connect_server) or
    /// [`connect_all`](Self::connect_all) is called.
    pub async fn add_server(
        &self,
        server_id: &str,
        config: ClientConfig,
    ) -> Result<Arc<Connection>, McpError> {
        let server_id = server_id.trim().to_lowercase();
        if server_id.is_empty() {
            return Err(McpError::connection_with_code(
                &server_id,
                ErrorCode::InvalidArguments,
                "server id must not be empty",
            ));
        }

        let mut connections = self.connections.lock().await;
        if connections.contains_key(&server_id) {
            return Err(McpError::duplicate_server(&server_id));
        }

        let (connection_events, connection_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let connection = Connection::new(
            server_id.clone(),
            config,
            self.factory.clone(),
            connection_events,
            self.faults_tx.clone(),
        );
        connections.insert(server_id.clone(), connection.clone());
        drop(connections);

        let forwarder = tokio::spawn(Self::forward_events(
            server_id.clone(),
            connection_rx,
            self.events.clone(),
        ));
        self.forwarders_mut().insert(server_id.clone(), forwarder);

        debug!(server_id = %server_id, "MCP server registered");
        Ok(connection)
    }

    /// Disconnects and removes a server. Unknown identifiers are an error.
    pub async fn remove_server(&self, server_id: &str) -> Result<(), McpError> {
        let server_id = server_id.trim().to_lowercase();
        let connection = {
            let mut connections = self.connections.lock().await;
            connections
                .remove(&server_id)
                .ok_or_else(|| McpError::server_not_found(&server_id))?
        };

        connection.disconnect().await;
        if let Some(forwarder) = self.forwarders_mut().remove(&server_id) {
            forwarder.abort();
        }
        debug!(server_id = %server_id, "MCP server removed");
        Ok(())
    }

    pub async fn connection(&self, server_id: &str) -> Option<Arc<Connection>> {
        let server_id = server_id.trim().to_lowercase();
        self.connections.lock().await.get(&server_id).cloned()
    }

    pub async fn connect_server(&self, server_id: &str) -> Result<(), McpError> {
        let connection = self
            .connection(server_id)
            .await
            .ok_or_else(|| McpError::server_not_found(server_id))?;
        connection.connect().await
    }

    pub async fn disconnect_server(&self, server_id: &str) -> Result<(), McpError> {
        let connection = self
            .connection(server_id)
            .await
            .ok_or_else(|| McpError::server_not_found(server_id))?;
        connection.disconnect().await;
        Ok(())
    }

    pub async fn reconnect_server(&self, server_id: &str) -> Result<(), McpError> {
        let connection = self
            .connection(server_id)
            .await
            .ok_or_else(|| McpError::server_not_found(server_id))?;
        if connection.status().await == ConnectionStatus::Connected {
            connection.disconnect().await;
        }
        connection.connect().await
    }

    /// Connects every registered server concurrently. Each server's outcome
    /// is reported independently; one refusal never aborts the others.
    pub async fn connect_all(&self) -> Vec<(String, Result<(), McpError>)> {
        let connections = self.snapshot().await;
        let attempts = connections.into_iter().map(|(server_id, connection)| async move {
            let result = connection.connect().await;
            (server_id, result)
        });
        futures_util::future::join_all(attempts).await
    }

    /// Disconnects every registered server concurrently.
    pub async fn disconnect_all(&self) {
        let connections = self.snapshot().await;
        let teardowns = connections
            .into_iter()
            .map(|(_, connection)| async move { connection.disconnect().await });
        futures_util::future::join_all(teardowns).await;
    }

    /// Merged tool registry across the fleet, fetched live from every
    /// connected server. Servers that are not connected are skipped, and a
    /// server whose listing fails is logged and excluded rather than failing
    /// the merge. When two servers expose the same tool name the server
    /// later in identifier order wins.
    pub async fn all_tools(&self) -> Vec<RegisteredTool> {
        let connections = self.snapshot().await;
        let fetches = connections.into_iter().map(|(server_id, connection)| async move {
            if connection.status().await != ConnectionStatus::Connected {
                return (server_id, None);
            }
            match connection.tools().await {
                Ok(tools) => (server_id, Some(tools)),
                Err(err) => {
                    warn!(
                        server_id = %server_id,
                        code = ?err.code(),
                        error = %err,
                        "Skipping server in tool registry merge"
                    );
                    (server_id, None)
                }
            }
        });

        let mut merged: HashMap<String, RegisteredTool> = HashMap::new();
        for (server_id, tools) in futures_util::future::join_all(fetches).await {
            let Some(tools) = tools else { continue };
            for definition in tools {
                merged.insert(
                    definition.name.clone(),
                    RegisteredTool {
                        server_id: server_id.clone(),
                        definition,
                    },
                );
            }
        }

        let mut registry: Vec<RegisteredTool> = merged.into_values().collect();
        registry.sort_by(|a, b| a.definition.name.cmp(&b.definition.name));
        registry
    }

    /// Routes one tool call to the server that registered it.
    pub async fn execute_tool(
        &self,
        server_id: &str,
        call: &ToolCall,
    ) -> Result<ToolResult, McpError> {
        let connection = self
            .connection(server_id)
            .await
            .ok_or_else(|| McpError::server_not_found(server_id))?;
        connection.execute_tool(call).await
    }

    /// Connection snapshots for every registered server, ordered by
    /// identifier.
    pub async fn all_connection_states(&self) -> Vec<(String, ConnectionState)> {
        let connections = self.snapshot().await;
        let mut states = Vec::with_capacity(connections.len());
        for (server_id, connection) in connections {
            let state = connection.state().await;
            states.push((server_id, state));
        }
        states
    }

    async fn snapshot(&self) -> Vec<(String, Arc<Connection>)> {
        let connections = self.connections.lock().await;
        let mut snapshot: Vec<_> = connections
            .iter()
            .map(|(server_id, connection)| (server_id.clone(), connection.clone()))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    fn forwarders_mut(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.forwarders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn forward_events(
        server_id: String,
        mut rx: broadcast::Receiver<McpEvent>,
        fleet_events: broadcast::Sender<McpEvent>,
    ) {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let _ = fleet_events.send(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(server_id = %server_id, skipped, "MCP event forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Drains transport fault reports. Ordinary teardown noise from a
    /// closing server is logged quietly; anything else is surfaced as an
    /// error without touching the rest of the fleet.
    async fn supervise_faults(mut faults_rx: mpsc::UnboundedReceiver<TransportFault>) {
        while let Some(fault) = faults_rx.recv().await {
            if is_transport_teardown(&fault.message) {
                warn!(
                    server_id = %fault.server_id,
                    "MCP transport closed: {}",
                    fault.message
                );
            } else {
                error!(
                    server_id = %fault.server_id,
                    code = ?ErrorCode::classify(&fault.message),
                    "MCP transport fault: {}",
                    fault.message
                );
            }
        }
    }
}

impl Default for FleetManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FleetManager {
    fn drop(&mut self) {
        self.fault_supervisor.abort();
        for forwarder in self.forwarders_mut().values() {
            forwarder.abort();
        }
    }
}
