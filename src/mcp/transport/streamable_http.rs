//! Streamable HTTP transport: JSON-RPC messages POSTed to a remote endpoint,
//! with responses arriving either as plain JSON or as an SSE event stream.

use crate::config::{ClientConfig, TransportConfig};
use crate::mcp::error::McpError;
use crate::mcp::transport::{self, MAX_TOOL_LIST};
use crate::mcp::types::{ServerInfo, ToolDefinition, ToolResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{CallToolRequestParams, RequestId};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

const MCP_JSON_CONTENT_TYPE: &str = "application/json";
const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";
const HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 10;
const HTTP_POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;

pub struct HttpTransport {
    server_id: String,
    base_url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    session_id: Mutex<Option<String>>,
    negotiated_protocol_version: Mutex<Option<String>>,
    next_request_id: AtomicI64,
}

impl HttpTransport {
    pub fn new(server_id: &str, config: &ClientConfig) -> Result<Arc<Self>, McpError> {
        let TransportConfig::Remote { url, headers } = &config.transport else {
            return Err(McpError::connection(
                server_id,
                "streamable HTTP transport requires a remote configuration",
            ));
        };

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECONDS))
            .timeout(Duration::from_millis(config.timeout_ms))
            .pool_idle_timeout(Duration::from_secs(HTTP_POOL_IDLE_TIMEOUT_SECONDS))
            .pool_max_idle_per_host(HTTP_POOL_MAX_IDLE_PER_HOST)
            .build()
            .map_err(|err| {
                McpError::connection(server_id, format!("Failed to build HTTP client: {err}"))
            })?;

        Ok(Arc::new(Self {
            server_id: server_id.to_string(),
            base_url: url.clone(),
            headers: headers.clone(),
            client,
            session_id: Mutex::new(None),
            negotiated_protocol_version: Mutex::new(None),
            next_request_id: AtomicI64::new(0),
        }))
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_session_id(&self, session_id: Option<String>) {
        *self
            .session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = session_id;
    }

    fn negotiated_protocol_version(&self) -> Option<String> {
        self.negotiated_protocol_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_negotiated_protocol_version(&self, version: Option<String>) {
        *self
            .negotiated_protocol_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = version;
    }

    fn apply_post_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request = request
            .header("Content-Type", MCP_JSON_CONTENT_TYPE)
            .header("Accept", MCP_JSON_AND_SSE_ACCEPT);
        let version = self
            .negotiated_protocol_version()
            .filter(|version| !version.trim().is_empty())
            .unwrap_or_else(|| rust_mcp_schema::LATEST_PROTOCOL_VERSION.to_string());
        request = request.header(MCP_PROTOCOL_VERSION_HEADER, version);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        if let Some(session_id) = self.session_id() {
            request = request.header(MCP_SESSION_ID_HEADER, session_id);
        }
        request
    }

    fn request_error(&self, err: reqwest::Error) -> McpError {
        if err.is_timeout() {
            McpError::timeout(&self.server_id, None, err.to_string())
        } else {
            McpError::connection(&self.server_id, err.to_string())
        }
    }

    async fn post(&self, message: &ClientMessage) -> Result<reqwest::Response, McpError> {
        let payload = serde_json::to_string(message)
            .map_err(|err| McpError::connection(&self.server_id, err.to_string()))?;
        debug!(server_id = %self.server_id, url = %self.base_url, "Sending MCP HTTP request");
        let request = self
            .apply_post_headers(self.client.post(&self.base_url))
            .body(payload);

        let response = request.send().await.map_err(|err| self.request_error(err))?;
        if !response.status().is_success() {
            return Err(McpError::connection(
                &self.server_id,
                format!("HTTP error: {}", response.status()),
            ));
        }

        if let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string())
        {
            self.set_session_id(Some(session_id));
        }

        Ok(response)
    }

    async fn post_message(&self, message: &ClientMessage) -> Result<ServerMessage, McpError> {
        let response = self.post(message).await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        if is_event_stream_content_type(&content_type) {
            next_sse_server_message(response)
                .await
                .map_err(|err| McpError::connection(&self.server_id, err))
        } else {
            let body = response
                .bytes()
                .await
                .map_err(|err| self.request_error(err))?;
            serde_json::from_slice::<ServerMessage>(&body)
                .map_err(|err| McpError::connection(&self.server_id, err.to_string()))
        }
    }

    async fn send_request(&self, request: RequestFromClient) -> Result<ServerMessage, McpError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(RequestId::Integer(request_id)),
        )
        .map_err(|err| McpError::connection(&self.server_id, err.to_string()))?;
        self.post_message(&message).await
    }

    /// Sends a notification; the endpoint typically answers 202 with an
    /// empty body, so only the status is checked.
    async fn send_notification(
        &self,
        notification: NotificationFromClient,
    ) -> Result<(), McpError> {
        let message = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(notification),
            None,
        )
        .map_err(|err| McpError::connection(&self.server_id, err.to_string()))?;
        self.post(&message).await?;
        Ok(())
    }
}

#[async_trait]
impl super::Transport for HttpTransport {
    async fn initialize(&self) -> Result<ServerInfo, McpError> {
        let response = self
            .send_request(RequestFromClient::InitializeRequest(
                transport::client_details(),
            ))
            .await?;
        let result = transport::parse_initialize_result(response)
            .map_err(|err| McpError::connection(&self.server_id, err))?;
        self.set_negotiated_protocol_version(Some(result.protocol_version.clone()));

        if self.session_id().is_none() {
            return Err(McpError::connection(
                &self.server_id,
                "Missing session id on initialize response.",
            ));
        }

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
        self.session_id().is_some()
    }

    async fn close(&self) {
        self.set_session_id(None);
        self.set_negotiated_protocol_version(None);
    }
}

#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = self.buffer[search_index..].iter().position(|b| *b == b'\n')
        {
            let newline_index = search_index + relative_pos;
            let mut line_end = newline_index;
            if line_end > search_index && self.buffer[line_end - 1] == b'\r' {
                line_end -= 1;
            }

            let line_bytes = &self.buffer[search_index..line_end];
            if let Ok(text) = std::str::from_utf8(line_bytes) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }

            search_index = newline_index + 1;
        }

        if flush {
            if let Ok(text) = std::str::from_utf8(&self.buffer[search_index..]) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
            self.buffer.clear();
        } else if search_index > 0 {
            self.buffer.drain(..search_index);
        }

        lines
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// Reads an SSE body until the first response or error message and returns
/// it; intermediate requests and notifications are skipped.
pub async fn next_sse_server_message(response: reqwest::Response) -> Result<ServerMessage, String> {
    let mut stream = response.bytes_stream();
    let mut buffer = SseLineBuffer::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| err.to_string())?;
        for line in buffer.push(&chunk) {
            if let Some(message) = decode_sse_line(&line)? {
                if matches!(
                    message,
                    ServerMessage::Response(_) | ServerMessage::Error(_)
                ) {
                    return Ok(message);
                }
            }
        }
    }

    for line in buffer.finish() {
        if let Some(message) = decode_sse_line(&line)? {
            if matches!(
                message,
                ServerMessage::Response(_) | ServerMessage::Error(_)
            ) {
                return Ok(message);
            }
        }
    }

    Err("Empty event-stream response.".to_string())
}

fn decode_sse_line(line: &str) -> Result<Option<ServerMessage>, String> {
    let Some(payload) = sse_data_payload(line) else {
        return Ok(None);
    };

    if payload.is_empty() {
        return Ok(None);
    }

    serde_json::from_str::<ServerMessage>(payload)
        .map(Some)
        .map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_buffer_handles_partial_lines() {
        let mut buffer = SseLineBuffer::default();
        assert!(buffer.push(b"data: one").is_empty());
        assert_eq!(buffer.push(b"\n\n"), vec!["data: one"]);
        assert!(buffer.finish().is_empty());
    }

    #[test]
    fn sse_buffer_strips_carriage_returns() {
        let mut buffer = SseLineBuffer::default();
        assert_eq!(buffer.push(b"data: one\r\n"), vec!["data: one"]);
    }

    #[test]
    fn detects_event_stream_content_type() {
        assert!(is_event_stream_content_type(
            "text/event-stream; charset=utf-8"
        ));
        assert!(!is_event_stream_content_type("application/json"));
    }

    #[test]
    fn extracts_sse_payload() {
        assert_eq!(sse_data_payload("data: {\"id\":1}"), Some("{\"id\":1}"));
        assert_eq!(sse_data_payload("event: ping"), None);
    }

    #[test]
    fn rejects_non_remote_configuration() {
        let config = crate::config::ClientConfig::new(TransportConfig::Process {
            command: "server".to_string(),
            args: Vec::new(),
            env: std::collections::HashMap::new(),
        });
        assert!(HttpTransport::new("alpha", &config).is_err());
    }

    #[test]
    fn fresh_transport_is_not_alive() {
        let config = crate::config::ClientConfig::new(TransportConfig::Remote {
            url: "https://example.com/mcp".to_string(),
            headers: HashMap::new(),
        });
        let transport = HttpTransport::new("alpha", &config).expect("transport should build");
        assert!(!crate::mcp::transport::Transport::is_alive(&*transport));
    }

    async fn read_http_request(
        stream: &mut tokio::net::TcpStream,
    ) -> Result<(String, Vec<(String, String)>, Vec<u8>), String> {
        use tokio::io::AsyncReadExt;

        let mut buffer = Vec::new();
        let mut header_end = None;
        while header_end.is_none() {
            let mut chunk = [0_u8; 1024];
            let read = stream
                .read(&mut chunk)
                .await
                .map_err(|err| err.to_string())?;
            if read == 0 {
                return Err("Unexpected EOF while reading HTTP headers".to_string());
            }
            buffer.extend_from_slice(&chunk[..read]);
            header_end = buffer
                .windows(4)
                .position(|window| window == b"\r\n\r\n")
                .map(|index| index + 4);
        }

        let header_end = header_end.expect("header end should exist");
        let header_bytes = &buffer[..header_end];
        let header_text = std::str::from_utf8(header_bytes).map_err(|err| err.to_string())?;
        let mut lines = header_text.split("\r\n").filter(|line| !line.is_empty());
        let request_line = lines
            .next()
            .ok_or_else(|| "Missing HTTP request line".to_string())?
            .to_string();

        let mut headers = Vec::new();
        let mut content_length = 0_usize;
        for line in lines {
            let mut parts = line.splitn(2, ':');
            let Some(name) = parts.next() else {
                continue;
            };
            let value = parts.next().unwrap_or_default().trim().to_string();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse::<usize>().map_err(|err| err.to_string())?;
            }
            headers.push((name.to_string(), value));
        }

        let mut body = buffer[header_end..].to_vec();
        while body.len() < content_length {
            let mut chunk = vec![0_u8; content_length.saturating_sub(body.len())];
            let read = stream
                .read(&mut chunk)
                .await
                .map_err(|err| err.to_string())?;
            if read == 0 {
                return Err("Unexpected EOF while reading HTTP body".to_string());
            }
            body.extend_from_slice(&chunk[..read]);
        }
        body.truncate(content_length);

        Ok((request_line, headers, body))
    }

    fn clear_proxy_env() {
        std::env::remove_var("HTTP_PROXY");
        std::env::remove_var("http_proxy");
        std::env::remove_var("HTTPS_PROXY");
        std::env::remove_var("https_proxy");
        std::env::remove_var("ALL_PROXY");
        std::env::remove_var("all_proxy");
        std::env::set_var("NO_PROXY", "*");
        std::env::set_var("no_proxy", "*");
    }

    #[tokio::test]
    async fn end_to_end_initialize_and_list_tools_over_json_and_sse() {
        use tokio::io::AsyncWriteExt;
        use tokio::net::TcpListener;
        use tokio::sync::Mutex as AsyncMutex;

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("local addr should resolve");
        let captured: Arc<AsyncMutex<Vec<(String, Option<String>, String)>>> =
            Arc::new(AsyncMutex::new(Vec::new()));
        let captured_for_server = Arc::clone(&captured);

        let server_task = tokio::spawn(async move {
            for _ in 0..3 {
                let (mut stream, _) = listener.accept().await.map_err(|err| err.to_string())?;
                let (_request_line, headers, body) = read_http_request(&mut stream).await?;
                let session_id = headers
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(MCP_SESSION_ID_HEADER))
                    .map(|(_, value)| value.clone());
                let protocol_version = headers
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(MCP_PROTOCOL_VERSION_HEADER))
                    .map(|(_, value)| value.clone())
                    .unwrap_or_default();
                let body_json: Value =
                    serde_json::from_slice(&body).map_err(|err| err.to_string())?;
                let method = body_json
                    .get("method")
                    .and_then(|value| value.as_str())
                    .unwrap_or_default()
                    .to_string();

                captured_for_server
                    .lock()
                    .await
                    .push((method.clone(), session_id, protocol_version));

                let response = if method == "initialize" {
                    let body = serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": 0,
                        "result": {
                            "protocolVersion": "2025-12-31",
                            "capabilities": {},
                            "serverInfo": {
                                "name": "mock",
                                "version": "0.1.0",
                                "icons": []
                            }
                        }
                    })
                    .to_string();
                    format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\nmcp-session-id: test-session\r\ncontent-length: {}\r\n\r\n{}",
                        body.len(), body
                    )
                } else if method == "notifications/initialized" {
                    let body = "{}";
                    format!(
                        "HTTP/1.1 202 Accepted\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                        body.len(), body
                    )
                } else {
                    let result = serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": 1,
                        "result": {
                            "tools": [{
                                "name": "search",
                                "description": "Full-text search",
                                "inputSchema": {"type": "object"}
                            }]
                        }
                    });
                    let event = format!("data: {result}\n\n");
                    format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: Text/Event-Stream; Charset=UTF-8\r\ncontent-length: {}\r\n\r\n{}",
                        event.len(), event
                    )
                };

                stream
                    .write_all(response.as_bytes())
                    .await
                    .map_err(|err| err.to_string())?;
            }
            Ok::<(), String>(())
        });

        clear_proxy_env();

        let config = crate::config::ClientConfig::new(TransportConfig::Remote {
            url: format!("http://{addr}"),
            headers: HashMap::new(),
        });
        let transport = HttpTransport::new("alpha", &config).expect("transport should build");

        let info = crate::mcp::transport::Transport::initialize(&*transport)
            .await
            .expect("initialize should succeed");
        assert_eq!(info.name, "mock");
        assert_eq!(info.protocol_version, "2025-12-31");
        assert!(crate::mcp::transport::Transport::is_alive(&*transport));

        let tools = crate::mcp::transport::Transport::list_tools(&*transport)
            .await
            .expect("tool listing should succeed");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "search");

        server_task
            .await
            .expect("mock server task should join")
            .expect("mock server should succeed");

        let captured = captured.lock().await.clone();
        assert_eq!(captured.len(), 3);
        assert_eq!(captured[0].0, "initialize");
        assert_eq!(captured[1].0, "notifications/initialized");
        assert_eq!(captured[2].0, "tools/list");
        assert_eq!(
            captured[0].2,
            rust_mcp_schema::LATEST_PROTOCOL_VERSION,
        );
        assert_eq!(captured[1].2, "2025-12-31");
        assert_eq!(captured[1].1.as_deref(), Some("test-session"));
        assert_eq!(captured[2].1.as_deref(), Some("test-session"));
    }
}
