//! Stdio transport: a locally spawned server process speaking newline-framed
//! JSON-RPC over its stdin/stdout.

use crate::config::{ClientConfig, TransportConfig};
use crate::mcp::error::McpError;
use crate::mcp::transport::{self, TransportFault, MAX_TOOL_LIST};
use crate::mcp::types::{ServerInfo, ToolDefinition, ToolResult};
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{CallToolRequestParams, RequestId};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

const STDIO_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const STDIO_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;

pub struct StdioTransport {
    server_id: String,
    stdin: Mutex<Option<ChildStdin>>,
    pending: PendingMap,
    next_request_id: AtomicI64,
    request_timeout: Duration,
    alive: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("server_id", &self.server_id)
            .finish_non_exhaustive()
    }
}

impl StdioTransport {
    /// Spawns the server process and wires up the reader, stderr drain, and
    /// reaper tasks. Fails fast when the executable cannot be started.
    pub async fn spawn(
        server_id: &str,
        config: &ClientConfig,
        faults: mpsc::UnboundedSender<TransportFault>,
    ) -> Result<Arc<Self>, McpError> {
        let TransportConfig::Process { command, args, env } = &config.transport else {
            return Err(McpError::connection(
                server_id,
                "stdio transport requires a process configuration",
            ));
        };

        debug!(server_id = %server_id, command = %command, args = ?args, "Starting MCP stdio server");
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|err| McpError::connection(server_id, err.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::connection(server_id, "Unable to retrieve stdin."))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::connection(server_id, "Unable to retrieve stdout."))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::connection(server_id, "Unable to retrieve stderr."))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let transport = Arc::new(Self {
            server_id: server_id.to_string(),
            stdin: Mutex::new(Some(stdin)),
            pending: pending.clone(),
            next_request_id: AtomicI64::new(0),
            request_timeout: Duration::from_millis(config.timeout_ms),
            alive: Arc::new(AtomicBool::new(true)),
            closing: Arc::new(AtomicBool::new(false)),
        });

        Self::spawn_stdout_reader(pending.clone(), stdout, transport.server_id.clone());
        Self::spawn_stderr_drain(stderr, transport.server_id.clone());

        // Reaper: when the process exits for any reason, wake every waiter
        // and surface the exit as a fault instead of an unhandled crash.
        let alive = transport.alive.clone();
        let closing = transport.closing.clone();
        let fault_server_id = transport.server_id.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            alive.store(false, Ordering::SeqCst);
            pending.lock().await.clear();
            if !closing.load(Ordering::SeqCst) {
                let message = match status {
                    Ok(status) => format!("server process exited: {status}"),
                    Err(err) => format!("server process exited: {err}"),
                };
                let _ = faults.send(TransportFault {
                    server_id: fault_server_id,
                    message,
                });
            }
        });

        Ok(transport)
    }

    fn spawn_stdout_reader(
        pending: PendingMap,
        stdout: tokio::process::ChildStdout,
        server_id: String,
    ) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let value = match serde_json::from_str::<Value>(&line) {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                if let Some(items) = value.as_array() {
                    for item in items {
                        if let Ok(message) = serde_json::from_value::<ServerMessage>(item.clone()) {
                            Self::dispatch_message(&pending, message, &server_id).await;
                        }
                    }
                } else if let Ok(message) = serde_json::from_value::<ServerMessage>(value) {
                    Self::dispatch_message(&pending, message, &server_id).await;
                }
            }
        });
    }

    fn spawn_stderr_drain(stderr: tokio::process::ChildStderr, server_id: String) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                debug!(server_id = %server_id, line = %line, "MCP stdio stderr");
            }
        });
    }

    async fn dispatch_message(pending: &PendingMap, message: ServerMessage, server_id: &str) {
        match &message {
            ServerMessage::Response(response) => {
                debug!(
                    server_id = %server_id,
                    response_id = ?response.id,
                    "Received MCP stdio response"
                );
                if let Some(tx) = pending.lock().await.remove(&response.id) {
                    let _ = tx.send(message);
                }
            }
            ServerMessage::Error(error) => {
                debug!(
                    server_id = %server_id,
                    error_id = ?error.id,
                    error_code = error.error.code,
                    "Received MCP stdio error"
                );
                if let Some(id) = error.id.as_ref() {
                    if let Some(tx) = pending.lock().await.remove(id) {
                        let _ = tx.send(message);
                    }
                }
            }
            ServerMessage::Request(_) | ServerMessage::Notification(_) => {
                debug!(server_id = %server_id, "Ignoring unsolicited MCP stdio message");
            }
        }
    }

    fn next_request_id(&self) -> RequestId {
        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        RequestId::Integer(id)
    }

    async fn write_payload(&self, payload: &str) -> Result<(), McpError> {
        let mut stdin = tokio::time::timeout(STDIO_LOCK_TIMEOUT, self.stdin.lock())
            .await
            .map_err(|_| {
                McpError::connection(&self.server_id, "Timed out waiting for stdio stdin lock.")
            })?;
        let Some(stdin) = stdin.as_mut() else {
            return Err(McpError::connection(
                &self.server_id,
                "MCP stdio transport is closed.",
            ));
        };
        tokio::time::timeout(STDIO_WRITE_TIMEOUT, stdin.write_all(payload.as_bytes()))
            .await
            .map_err(|_| McpError::connection(&self.server_id, "Timed out writing stdio request."))?
            .map_err(|err| McpError::connection(&self.server_id, err.to_string()))?;
        tokio::time::timeout(STDIO_WRITE_TIMEOUT, stdin.write_all(b"\n"))
            .await
            .map_err(|_| {
                McpError::connection(&self.server_id, "Timed out writing stdio request newline.")
            })?
            .map_err(|err| McpError::connection(&self.server_id, err.to_string()))?;
        tokio::time::timeout(STDIO_WRITE_TIMEOUT, stdin.flush())
            .await
            .map_err(|_| {
                McpError::connection(&self.server_id, "Timed out flushing stdio request.")
            })?
            .map_err(|err| McpError::connection(&self.server_id, err.to_string()))?;
        Ok(())
    }

    async fn send_request(&self, request: RequestFromClient) -> Result<ServerMessage, McpError> {
        let request_id = self.next_request_id();
        debug!(server_id = %self.server_id, request_id = ?request_id, "Sending MCP stdio request");
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id.clone()),
        )
        .map_err(|err| McpError::connection(&self.server_id, err.to_string()))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(request_id.clone(), tx);
        }

        let payload = serde_json::to_string(&message)
            .map_err(|err| McpError::connection(&self.server_id, err.to_string()))?;
        if let Err(err) = self.write_payload(&payload).await {
            self.pending.lock().await.remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(McpError::connection(
                &self.server_id,
                "MCP stdio response channel closed.",
            )),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(McpError::timeout(
                    &self.server_id,
                    None,
                    format!("no response after {} ms", self.request_timeout.as_millis()),
                ))
            }
        }
    }

    async fn send_notification(
        &self,
        notification: NotificationFromClient,
    ) -> Result<(), McpError> {
        let message = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(notification),
            None,
        )
        .map_err(|err| McpError::connection(&self.server_id, err.to_string()))?;
        let payload = serde_json::to_string(&message)
            .map_err(|err| McpError::connection(&self.server_id, err.to_string()))?;
        self.write_payload(&payload).await
    }
}

#[async_trait]
impl super::Transport for StdioTransport {
    async fn initialize(&self) -> Result<ServerInfo, McpError> {
        let response = self
            .send_request(RequestFromClient::InitializeRequest(
                transport::client_details(),
            ))
            .await?;
        let result = transport::parse_initialize_result(response)
            .map_err(|err| McpError::connection(&self.server_id, err))?;
        self.send_notification(NotificationFromClient::InitializedNotification(None))
            .await?;
        Ok(transport::server_info_from(&result))
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let response = self
                .send_request(RequestFromClient::ListToolsRequest(
                    transport::paginated_params(cursor.clone()),
                ))
                .await?;
            if transport::is_method_not_found(&response) {
                return Ok(Vec::new());
            }
            let list = transport::parse_list_tools(response)
                .map_err(|err| McpError::connection(&self.server_id, err))?;
            let next_cursor = list.next_cursor.clone();
            tools.extend(transport::tool_definitions_from(list));
            if tools.len() >= MAX_TOOL_LIST {
                tools.truncate(MAX_TOOL_LIST);
                return Ok(tools);
            }
            match next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<ToolResult, McpError> {
        let mut params = CallToolRequestParams::new(name);
        if !arguments.is_empty() {
            params = params.with_arguments(arguments);
        }
        let response = self
            .send_request(RequestFromClient::CallToolRequest(params))
            .await?;
        let result = transport::parse_call_tool(response)
            .map_err(|err| McpError::tool_execution(&self.server_id, name, err))?;
        Ok(transport::tool_result_from(result))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        // Dropping stdin sends EOF; the reaper task handles the rest.
        self.stdin.lock().await.take();
    }
}
