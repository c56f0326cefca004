//! Per-server connection state machine.
//!
//! A [`Connection`] owns one transport and tracks its lifecycle through
//! disconnected, connecting, connected, and error states. Connecting is
//! idempotent: concurrent callers share a single in-flight cycle through a
//! watch channel instead of dialing twice. A failed cycle retries with
//! doubling backoff up to the configured budget; transient terminal failures
//! schedule one automatic reconnect after a fixed delay.

use crate::config::ClientConfig;
use crate::mcp::error::{handle_connection_error, McpError};
use crate::mcp::events::McpEvent;
use crate::mcp::transport::{Transport, TransportFactory, TransportFault};
use crate::mcp::types::{
    ConnectionState, ConnectionStatus, ServerInfo, ToolCall, ToolDefinition, ToolResult,
};
use chrono::Utc;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type ConnectOutcome = Option<Result<(), McpError>>;

struct Inner {
    status: ConnectionStatus,
    server_info: Option<ServerInfo>,
    available_tools: Vec<ToolDefinition>,
    last_connected_at: Option<chrono::DateTime<Utc>>,
    last_error: Option<String>,
    retry_count: u32,
    transport: Option<Arc<dyn Transport>>,
    /// Present while a connect cycle is in flight; joiners wait on it.
    connect_rx: Option<watch::Receiver<ConnectOutcome>>,
    /// Pending automatic reconnect timer.
    reconnect_task: Option<JoinHandle<()>>,
}

pub struct Connection {
    server_id: String,
    config: ClientConfig,
    factory: Arc<dyn TransportFactory>,
    events: broadcast::Sender<McpEvent>,
    faults: mpsc::UnboundedSender<TransportFault>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server_id", &self.server_id)
            .finish_non_exhaustive()
    }
}

enum ConnectRole {
    Driver(watch::Sender<ConnectOutcome>),
    Joiner(watch::Receiver<ConnectOutcome>),
}

impl Connection {
    pub fn new(
        server_id: impl Into<String>,
        config: ClientConfig,
        factory: Arc<dyn TransportFactory>,
        events: broadcast::Sender<McpEvent>,
        faults: mpsc::UnboundedSender<TransportFault>,
    ) -> Arc<Self> {
        Arc::new(Self {
            server_id: server_id.into(),
            config,
            factory,
            events,
            faults,
            inner: Mutex::new(Inner {
                status: ConnectionStatus::Disconnected,
                server_info: None,
                available_tools: Vec::new(),
                last_connected_at: None,
                last_error: None,
                retry_count: 0,
                transport: None,
                connect_rx: None,
                reconnect_task: None,
            }),
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<McpEvent> {
        self.events.subscribe()
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.inner.lock().await.status
    }

    /// Point-in-time snapshot of the connection.
    pub async fn state(&self) -> ConnectionState {
        let inner = self.inner.lock().await;
        ConnectionState {
            status: inner.status,
            server_info: inner.server_info.clone(),
            available_tools: inner.available_tools.clone(),
            last_connected_at: inner.last_connected_at,
            last_error: inner.last_error.clone(),
            retry_count: inner.retry_count,
        }
    }

    fn emit(&self, event: McpEvent) {
        let _ = self.events.send(event);
    }

    fn display_name(&self) -> &str {
        self.config.display_name_or(&self.server_id)
    }

    /// Establishes the connection. Already-connected calls return
    /// immediately; callers arriving while a cycle is in flight wait for
    /// that cycle's outcome instead of starting a second one.
    pub async fn connect(self: &Arc<Self>) -> Result<(), McpError> {
        let role = {
            let mut inner = self.inner.lock().await;
            if inner.status == ConnectionStatus::Connected
                && inner
                    .transport
                    .as_ref()
                    .is_some_and(|transport| transport.is_alive())
            {
                return Ok(());
            }
            if let Some(rx) = &inner.connect_rx {
                ConnectRole::Joiner(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                inner.connect_rx = Some(rx);
                if let Some(task) = inner.reconnect_task.take() {
                    task.abort();
                }
                inner.status = ConnectionStatus::Connecting;
                inner.last_error = None;
                self.emit(McpEvent::status_changed(
                    &self.server_id,
                    ConnectionStatus::Connecting,
                    None,
                    None,
                ));
                ConnectRole::Driver(tx)
            }
        };

        match role {
            ConnectRole::Driver(tx) => {
                let result = self.run_connect_cycle().await;
                self.inner.lock().await.connect_rx = None;
                let _ = tx.send(Some(result.clone()));
                result
            }
            ConnectRole::Joiner(mut rx) => {
                let outcome = rx.wait_for(|value| value.is_some()).await.map_err(|_| {
                    McpError::connection(&self.server_id, "connection attempt was interrupted")
                })?;
                match outcome.as_ref() {
                    Some(result) => result.clone(),
                    None => Err(McpError::connection(
                        &self.server_id,
                        "connection attempt was interrupted",
                    )),
                }
            }
        }
    }

    async fn run_connect_cycle(self: &Arc<Self>) -> Result<(), McpError> {
        let max_retries = self.config.max_retries;
        let mut attempt: u32 = 0;

        loop {
            self.inner.lock().await.retry_count = attempt;

            match self.try_connect_once().await {
                Ok((transport, server_info, tools)) => {
                    {
                        let mut inner = self.inner.lock().await;
                        inner.status = ConnectionStatus::Connected;
                        inner.server_info = Some(server_info.clone());
                        inner.available_tools = tools.clone();
                        inner.last_connected_at = Some(Utc::now());
                        inner.last_error = None;
                        inner.retry_count = 0;
                        inner.transport = Some(transport);
                    }
                    info!(
                        server_id = %self.server_id,
                        server = %server_info.name,
                        tools = tools.len(),
                        "MCP server connected"
                    );
                    self.emit(McpEvent::status_changed(
                        &self.server_id,
                        ConnectionStatus::Connected,
                        Some(server_info),
                        None,
                    ));
                    self.emit(McpEvent::tools_updated(&self.server_id, tools));
                    return Ok(());
                }
                Err(err) if attempt >= max_retries => {
                    {
                        let mut inner = self.inner.lock().await;
                        inner.status = ConnectionStatus::Error;
                        inner.last_error = Some(err.to_string());
                        inner.transport = None;
                    }
                    self.emit(McpEvent::status_changed(
                        &self.server_id,
                        ConnectionStatus::Error,
                        None,
                        Some(err.to_string()),
                    ));
                    if let Some(delay) = handle_connection_error(self.display_name(), &err) {
                        self.schedule_reconnect(delay).await;
                    }
                    return Err(err);
                }
                Err(err) => {
                    let delay = Duration::from_millis(
                        self.config
                            .retry_delay_ms
                            .saturating_mul(1_u64 << attempt.min(16)),
                    );
                    warn!(
                        server_id = %self.server_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "MCP connection attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// One dial: validate config, open the transport and run the handshake
    /// under the configured deadline, then fetch the initial tool listing.
    async fn try_connect_once(
        &self,
    ) -> Result<(Arc<dyn Transport>, ServerInfo, Vec<ToolDefinition>), McpError> {
        // Re-validated on every attempt since entries can change between
        // retries.
        self.config
            .transport
            .validate()
            .map_err(|message| McpError::connection(&self.server_id, message))?;

        let deadline = Duration::from_millis(self.config.timeout_ms);
        let dial = async {
            let transport = self
                .factory
                .open(&self.server_id, &self.config, self.faults.clone())
                .await?;
            let server_info = transport.initialize().await?;
            Ok::<_, McpError>((transport, server_info))
        };

        let (transport, server_info) = match tokio::time::timeout(deadline, dial).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(McpError::timeout(
                    &self.server_id,
                    None,
                    format!("connection attempt exceeded {} ms", deadline.as_millis()),
                ));
            }
        };

        let tools = match transport.list_tools().await {
            Ok(tools) => tools,
            Err(err) => {
                transport.close().await;
                return Err(err);
            }
        };

        Ok((transport, server_info, tools))
    }

    /// Schedules one automatic reconnect. The timer clears its own registry
    /// entry before dialing so a later terminal failure can schedule a fresh
    /// one without aborting a cycle already in progress.
    async fn schedule_reconnect(self: &Arc<Self>, delay: Duration) {
        let handle = tokio::spawn(reconnect_after(Arc::downgrade(self), delay));

        let mut inner = self.inner.lock().await;
        if let Some(old) = inner.reconnect_task.replace(handle) {
            old.abort();
        }
    }

    /// Tears the connection down and resets the snapshot. Cancels a pending
    /// automatic reconnect; an in-flight tool call runs to completion against
    /// the transport it already holds.
    pub async fn disconnect(&self) {
        let (transport, was_connected) = {
            let mut inner = self.inner.lock().await;
            if let Some(task) = inner.reconnect_task.take() {
                task.abort();
            }
            let transport = inner.transport.take();
            let was_connected = inner.status != ConnectionStatus::Disconnected;
            inner.status = ConnectionStatus::Disconnected;
            inner.server_info = None;
            inner.available_tools.clear();
            inner.last_error = None;
            inner.retry_count = 0;
            (transport, was_connected)
        };

        if let Some(transport) = transport {
            transport.close().await;
        }
        if was_connected {
            debug!(server_id = %self.server_id, "MCP server disconnected");
            self.emit(McpEvent::status_changed(
                &self.server_id,
                ConnectionStatus::Disconnected,
                None,
                None,
            ));
        }
    }

    /// Runs one tool call, publishing started/completed/failed events around
    /// it. Fails fast without touching the wire when the connection is not
    /// usable.
    pub async fn execute_tool(&self, call: &ToolCall) -> Result<ToolResult, McpError> {
        let transport = self.usable_transport().await?;

        let execution_id = format!(
            "{}-{}-{}",
            self.server_id,
            call.name,
            Utc::now().timestamp_millis()
        );
        self.emit(McpEvent::tool_started(
            &self.server_id,
            &call.name,
            &execution_id,
        ));

        let start = std::time::Instant::now();
        let result = transport.call_tool(&call.name, call.arguments.clone()).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(result) => {
                debug!(
                    server_id = %self.server_id,
                    tool = %call.name,
                    elapsed_ms,
                    is_error = result.failed(),
                    "MCP tool call completed"
                );
                self.emit(McpEvent::tool_completed(
                    &self.server_id,
                    &call.name,
                    &execution_id,
                    result.clone(),
                    elapsed_ms,
                ));
                Ok(result)
            }
            Err(err) => {
                let err = match err {
                    McpError::Timeout {
                        message, server_id, ..
                    } => McpError::Timeout {
                        message,
                        server_id,
                        tool_name: Some(call.name.clone()),
                    },
                    other => other,
                };
                warn!(
                    server_id = %self.server_id,
                    tool = %call.name,
                    elapsed_ms,
                    error = %err,
                    "MCP tool call failed"
                );
                self.emit(McpEvent::tool_failed(
                    &self.server_id,
                    &call.name,
                    &execution_id,
                    &err,
                    elapsed_ms,
                ));
                Err(err)
            }
        }
    }

    /// Fetches a fresh tool listing from the server and updates the cached
    /// snapshot.
    pub async fn tools(&self) -> Result<Vec<ToolDefinition>, McpError> {
        let transport = self.usable_transport().await?;
        let tools = transport.list_tools().await?;
        self.inner.lock().await.available_tools = tools.clone();
        self.emit(McpEvent::tools_updated(&self.server_id, tools.clone()));
        Ok(tools)
    }

    /// Reconnects only when needed. A healthy connection is left alone; a
    /// connection whose recorded status disagrees with actual transport
    /// liveness is marked failed and re-enters the connect path.
    pub async fn graceful_reconnect(self: &Arc<Self>) -> Result<(), McpError> {
        let stale_transport = {
            let mut inner = self.inner.lock().await;
            match (&inner.status, &inner.transport) {
                (ConnectionStatus::Connected, Some(transport)) if transport.is_alive() => {
                    return Ok(());
                }
                (ConnectionStatus::Connected, _) => {
                    let message = format!("connection terminated for server '{}'", self.server_id);
                    inner.status = ConnectionStatus::Error;
                    inner.last_error = Some(message.clone());
                    inner.available_tools.clear();
                    let transport = inner.transport.take();
                    self.emit(McpEvent::status_changed(
                        &self.server_id,
                        ConnectionStatus::Error,
                        None,
                        Some(message),
                    ));
                    transport
                }
                _ => None,
            }
        };
        if let Some(transport) = stale_transport {
            transport.close().await;
        }
        self.connect().await
    }

    async fn usable_transport(&self) -> Result<Arc<dyn Transport>, McpError> {
        let inner = self.inner.lock().await;
        match (&inner.status, &inner.transport) {
            (ConnectionStatus::Connected, Some(transport)) if transport.is_alive() => {
                Ok(transport.clone())
            }
            (ConnectionStatus::Connected, Some(_)) => Err(McpError::connection(
                &self.server_id,
                format!("connection terminated for server '{}'", self.server_id),
            )),
            _ => Err(McpError::connection(
                &self.server_id,
                format!("server '{}' is not connected", self.server_id),
            )),
        }
    }
}

/// Timer body for an automatic reconnect. Returned as a boxed future so the
/// mutual recursion with `connect` goes through an erased type instead of an
/// infinitely nested opaque one.
fn reconnect_after(
    weak: Weak<Connection>,
    delay: Duration,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        tokio::time::sleep(delay).await;
        let Some(connection) = weak.upgrade() else {
            return;
        };
        connection.inner.lock().await.reconnect_task = None;
        debug!(server_id = %connection.server_id, "Attempting automatic MCP reconnect");
        let _ = connection.connect().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::mcp::events::{ToolExecutionPhase, EVENT_CHANNEL_CAPACITY};
    use async_trait::async_trait;
    use rust_mcp_schema::ContentBlock;
    use serde_json::{json, Map, Value};
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Clone)]
    enum DialOutcome {
        Success(Vec<ToolDefinition>),
        Fail(&'static str),
        Hang,
        ListToolsFail(&'static str),
    }

    enum CallBehavior {
        Succeed,
        Fail(&'static str),
        TimeOut,
    }

    struct MockTransport {
        tools: Vec<ToolDefinition>,
        alive: Arc<AtomicBool>,
        call_behavior: CallBehavior,
        list_tools_error: Option<&'static str>,
        server_id: String,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn initialize(&self) -> Result<ServerInfo, McpError> {
            Ok(ServerInfo {
                name: "mock".to_string(),
                version: "0.1.0".to_string(),
                protocol_version: "2025-11-25".to_string(),
            })
        }

        async fn list_tools(&self) -> Result<Vec<ToolDefinition>, McpError> {
            match self.list_tools_error {
                Some(message) => Err(McpError::connection(&self.server_id, message)),
                None => Ok(self.tools.clone()),
            }
        }

        async fn call_tool(
            &self,
            name: &str,
            _arguments: Map<String, Value>,
        ) -> Result<ToolResult, McpError> {
            match self.call_behavior {
                CallBehavior::Succeed => {
                    let block: ContentBlock =
                        serde_json::from_value(json!({"type": "text", "text": "ok"}))
                            .expect("content block should parse");
                    Ok(ToolResult {
                        content: vec![block],
                        is_error: None,
                    })
                }
                CallBehavior::Fail(message) => {
                    Err(McpError::tool_execution(&self.server_id, name, message))
                }
                CallBehavior::TimeOut => {
                    Err(McpError::timeout(&self.server_id, None, "no response"))
                }
            }
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    struct ScriptedFactory {
        outcomes: StdMutex<VecDeque<DialOutcome>>,
        opens: AtomicUsize,
        last_alive: StdMutex<Option<Arc<AtomicBool>>>,
        call_behavior_for_next: StdMutex<Option<CallBehavior>>,
    }

    impl ScriptedFactory {
        fn new(outcomes: Vec<DialOutcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: StdMutex::new(outcomes.into()),
                opens: AtomicUsize::new(0),
                last_alive: StdMutex::new(None),
                call_behavior_for_next: StdMutex::new(None),
            })
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        fn last_alive(&self) -> Arc<AtomicBool> {
            self.last_alive
                .lock()
                .unwrap()
                .clone()
                .expect("a transport should have been opened")
        }

        fn set_next_call_behavior(&self, behavior: CallBehavior) {
            *self.call_behavior_for_next.lock().unwrap() = Some(behavior);
        }
    }

    #[async_trait]
    impl TransportFactory for ScriptedFactory {
        async fn open(
            &self,
            server_id: &str,
            _config: &ClientConfig,
            _faults: mpsc::UnboundedSender<TransportFault>,
        ) -> Result<Arc<dyn Transport>, McpError> {
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(DialOutcome::Fail("no scripted outcome"));
            self.opens.fetch_add(1, Ordering::SeqCst);
            // Keeps concurrent callers overlapping instead of racing past
            // each other instantly.
            tokio::time::sleep(Duration::from_millis(10)).await;
            let (tools, list_tools_error) = match outcome {
                DialOutcome::Success(tools) => (tools, None),
                DialOutcome::ListToolsFail(message) => (Vec::new(), Some(message)),
                DialOutcome::Fail(message) => {
                    return Err(McpError::connection(server_id, message));
                }
                DialOutcome::Hang => {
                    futures_util::future::pending::<()>().await;
                    unreachable!()
                }
            };
            let alive = Arc::new(AtomicBool::new(true));
            *self.last_alive.lock().unwrap() = Some(alive.clone());
            let call_behavior = self
                .call_behavior_for_next
                .lock()
                .unwrap()
                .take()
                .unwrap_or(CallBehavior::Succeed);
            Ok(Arc::new(MockTransport {
                tools,
                alive,
                call_behavior,
                list_tools_error,
                server_id: server_id.to_string(),
            }))
        }
    }

    fn sample_tool(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
        }
    }

    fn test_config(timeout_ms: u64, max_retries: u32, retry_delay_ms: u64) -> ClientConfig {
        let mut config = ClientConfig::new(TransportConfig::Process {
            command: "mock-server".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
        });
        config.timeout_ms = timeout_ms;
        config.max_retries = max_retries;
        config.retry_delay_ms = retry_delay_ms;
        config
    }

    fn connection_with(
        factory: Arc<ScriptedFactory>,
        config: ClientConfig,
    ) -> (Arc<Connection>, broadcast::Receiver<McpEvent>) {
        let (events, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (faults, _faults_rx) = mpsc::unbounded_channel();
        let connection = Connection::new("alpha", config, factory, events, faults);
        (connection, rx)
    }

    fn drain_events(rx: &mut broadcast::Receiver<McpEvent>) -> Vec<McpEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn successful_connect_publishes_status_and_tools() {
        let factory = ScriptedFactory::new(vec![DialOutcome::Success(vec![
            sample_tool("search"),
            sample_tool("fetch"),
        ])]);
        let (connection, mut rx) = connection_with(factory.clone(), test_config(1_000, 0, 100));

        connection.connect().await.expect("connect should succeed");

        let state = connection.state().await;
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(state.available_tools.len(), 2);
        assert_eq!(state.retry_count, 0);
        assert!(state.last_connected_at.is_some());
        assert_eq!(state.server_info.as_ref().map(|info| info.name.as_str()), Some("mock"));

        let events = drain_events(&mut rx);
        assert!(matches!(
            events[0],
            McpEvent::ConnectionStatusChanged {
                status: ConnectionStatus::Connecting,
                ..
            }
        ));
        assert!(matches!(
            events[1],
            McpEvent::ConnectionStatusChanged {
                status: ConnectionStatus::Connected,
                ..
            }
        ));
        assert!(matches!(events[2], McpEvent::ToolsUpdated { ref tools, .. } if tools.len() == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failure_retries_with_doubling_backoff() {
        let factory = ScriptedFactory::new(vec![
            DialOutcome::Fail("HTTP error: 401 Unauthorized"),
            DialOutcome::Fail("HTTP error: 401 Unauthorized"),
            DialOutcome::Fail("HTTP error: 401 Unauthorized"),
        ]);
        let (connection, _rx) = connection_with(factory.clone(), test_config(1_000, 2, 100));

        let start = tokio::time::Instant::now();
        let err = connection.connect().await.expect_err("connect should fail");
        // Three dials at 10ms each plus 100ms and 200ms of backoff.
        assert_eq!(start.elapsed(), Duration::from_millis(330));
        assert!(!err.is_timeout());
        assert_eq!(factory.opens(), 3);

        let state = connection.state().await;
        assert_eq!(state.status, ConnectionStatus::Error);
        assert_eq!(state.retry_count, 2);
        assert!(state.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_dial_loses_the_timeout_race() {
        let factory = ScriptedFactory::new(vec![DialOutcome::Hang]);
        let (connection, _rx) = connection_with(factory.clone(), test_config(50, 0, 100));

        let start = tokio::time::Instant::now();
        let err = connection.connect().await.expect_err("connect should time out");
        assert_eq!(start.elapsed(), Duration::from_millis(50));
        assert!(err.is_timeout());
        assert_eq!(connection.status().await, ConnectionStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connects_share_one_cycle() {
        let factory = ScriptedFactory::new(vec![DialOutcome::Success(vec![sample_tool("search")])]);
        let (connection, _rx) = connection_with(factory.clone(), test_config(1_000, 0, 100));

        let first = connection.clone();
        let second = connection.clone();
        let (a, b) = tokio::join!(first.connect(), second.connect());
        a.expect("first connect should succeed");
        b.expect("second connect should succeed");
        assert_eq!(factory.opens(), 1);

        // Connected connections short-circuit entirely.
        connection.connect().await.expect("repeat connect is a no-op");
        assert_eq!(factory.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_schedules_automatic_reconnect() {
        let factory = ScriptedFactory::new(vec![
            DialOutcome::Fail("connection refused"),
            DialOutcome::Success(vec![sample_tool("search")]),
        ]);
        let (connection, _rx) = connection_with(factory.clone(), test_config(1_000, 0, 100));

        connection.connect().await.expect_err("first connect should fail");
        assert_eq!(connection.status().await, ConnectionStatus::Error);
        assert_eq!(factory.opens(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(connection.status().await, ConnectionStatus::Connected);
        assert_eq!(factory.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let factory = ScriptedFactory::new(vec![
            DialOutcome::Fail("connection refused"),
            DialOutcome::Success(vec![sample_tool("search")]),
        ]);
        let (connection, _rx) = connection_with(factory.clone(), test_config(1_000, 0, 100));

        connection.connect().await.expect_err("connect should fail");
        connection.disconnect().await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connection.status().await, ConnectionStatus::Disconnected);
        assert_eq!(factory.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_tool_listing_closes_the_transport() {
        let factory = ScriptedFactory::new(vec![DialOutcome::ListToolsFail("internal error")]);
        let (connection, _rx) = connection_with(factory.clone(), test_config(1_000, 0, 100));

        connection.connect().await.expect_err("connect should fail");
        assert_eq!(connection.status().await, ConnectionStatus::Error);
        assert!(!factory.last_alive().load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn tool_call_without_connection_fails_before_the_wire() {
        let factory = ScriptedFactory::new(vec![]);
        let (connection, mut rx) = connection_with(factory.clone(), test_config(1_000, 0, 100));

        let err = connection
            .execute_tool(&ToolCall::new("search"))
            .await
            .expect_err("call should fail");
        assert!(err.to_string().contains("not connected"));
        assert_eq!(factory.opens(), 0);
        assert!(drain_events(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tool_call_publishes_started_and_completed_events() {
        let factory = ScriptedFactory::new(vec![DialOutcome::Success(vec![sample_tool("search")])]);
        let (connection, mut rx) = connection_with(factory.clone(), test_config(1_000, 0, 100));

        connection.connect().await.expect("connect should succeed");
        drain_events(&mut rx);

        let result = connection
            .execute_tool(&ToolCall::new("search"))
            .await
            .expect("call should succeed");
        assert!(!result.failed());

        let events = drain_events(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            McpEvent::ToolExecution {
                phase: ToolExecutionPhase::Started,
                ..
            }
        ));
        match &events[1] {
            McpEvent::ToolExecution {
                phase,
                result,
                elapsed_ms,
                ..
            } => {
                assert_eq!(*phase, ToolExecutionPhase::Completed);
                assert!(result.is_some());
                assert!(elapsed_ms.is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tool_call_timeout_is_tagged_with_the_tool_name() {
        let factory = ScriptedFactory::new(vec![DialOutcome::Success(vec![sample_tool("search")])]);
        factory.set_next_call_behavior(CallBehavior::TimeOut);
        let (connection, _rx) = connection_with(factory.clone(), test_config(1_000, 0, 100));

        connection.connect().await.expect("connect should succeed");
        let err = connection
            .execute_tool(&ToolCall::new("search"))
            .await
            .expect_err("call should time out");
        match err {
            McpError::Timeout { tool_name, .. } => {
                assert_eq!(tool_name.as_deref(), Some("search"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tool_call_failure_publishes_failed_event() {
        let factory = ScriptedFactory::new(vec![DialOutcome::Success(vec![sample_tool("search")])]);
        factory.set_next_call_behavior(CallBehavior::Fail("unknown tool: search"));
        let (connection, mut rx) = connection_with(factory.clone(), test_config(1_000, 0, 100));

        connection.connect().await.expect("connect should succeed");
        drain_events(&mut rx);

        connection
            .execute_tool(&ToolCall::new("search"))
            .await
            .expect_err("call should fail");

        let events = drain_events(&mut rx);
        assert!(matches!(
            events.last(),
            Some(McpEvent::ToolExecution {
                phase: ToolExecutionPhase::Failed,
                error: Some(_),
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dead_transport_is_rejected_and_gracefully_replaced() {
        let factory = ScriptedFactory::new(vec![
            DialOutcome::Success(vec![sample_tool("search")]),
            DialOutcome::Success(vec![sample_tool("search")]),
        ]);
        let (connection, _rx) = connection_with(factory.clone(), test_config(1_000, 0, 100));

        connection.connect().await.expect("connect should succeed");
        factory.last_alive().store(false, Ordering::SeqCst);

        let err = connection
            .execute_tool(&ToolCall::new("search"))
            .await
            .expect_err("dead transport should be rejected");
        assert!(err.to_string().contains("terminated"));

        // Healthy connections are a no-op; dead ones get replaced.
        connection
            .graceful_reconnect()
            .await
            .expect("reconnect should succeed");
        assert_eq!(factory.opens(), 2);
        connection
            .graceful_reconnect()
            .await
            .expect("healthy reconnect is a no-op");
        assert_eq!(factory.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_resets_the_snapshot() {
        let factory = ScriptedFactory::new(vec![DialOutcome::Success(vec![sample_tool("search")])]);
        let (connection, mut rx) = connection_with(factory.clone(), test_config(1_000, 0, 100));

        connection.connect().await.expect("connect should succeed");
        drain_events(&mut rx);

        connection.disconnect().await;
        let state = connection.state().await;
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert!(state.available_tools.is_empty());
        assert!(state.server_info.is_none());
        assert!(!factory.last_alive().load(Ordering::SeqCst));

        let events = drain_events(&mut rx);
        assert!(matches!(
            events.last(),
            Some(McpEvent::ConnectionStatusChanged {
                status: ConnectionStatus::Disconnected,
                ..
            })
        ));
    }
}
