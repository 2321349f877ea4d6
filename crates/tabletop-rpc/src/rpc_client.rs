//! Request/response correlation and lifecycle over one sidecar transport.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::{
    classify_inbound_frame, initialize_params, jsonrpc_notification_frame, jsonrpc_request_frame,
    lock_or_recover, normalize_tool_call_result, parse_tools_list, tools_call_params,
    CancellationToken, ClientInfo, InboundFrame, RpcError, RpcTransport, ServerInfo,
    SidecarLaunch, ToolCallOutcome, ToolDescriptor, TransportDiagnostic, TransportHandler,
    JSONRPC_VERSION, METHOD_INITIALIZE, METHOD_INITIALIZED_NOTIFICATION, METHOD_TOOLS_CALL,
    METHOD_TOOLS_LIST,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const JSONRPC_METHOD_NOT_FOUND: i64 = -32601;

/// Connection lifecycle of one sidecar client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Initialized,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Initialized => "initialized",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Initialized)
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub cancellation: Option<CancellationToken>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

type PendingSender = oneshot::Sender<Result<Value, RpcError>>;

/// JSON-RPC client bound to one logical sidecar server.
///
/// Cloning is cheap; clones share the same process and pending table.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("server", &self.inner.launch.server)
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

struct ClientInner {
    launch: SidecarLaunch,
    default_timeout: Duration,
    session: Mutex<Session>,
    lifecycle: tokio::sync::Mutex<()>,
    handshake: tokio::sync::Mutex<()>,
    pending: Mutex<HashMap<u64, PendingSender>>,
    next_request_id: AtomicU64,
    generation: AtomicU64,
    spawn_count: AtomicU64,
    protocol_error_count: AtomicU64,
}

struct Session {
    state: ClientState,
    connection: Option<Connection>,
    server_info: Option<ServerInfo>,
}

struct Connection {
    generation: u64,
    transport: Arc<RpcTransport>,
}

impl RpcClient {
    pub fn new(launch: SidecarLaunch, default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                launch,
                default_timeout,
                session: Mutex::new(Session {
                    state: ClientState::Disconnected,
                    connection: None,
                    server_info: None,
                }),
                lifecycle: tokio::sync::Mutex::new(()),
                handshake: tokio::sync::Mutex::new(()),
                pending: Mutex::new(HashMap::new()),
                next_request_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                spawn_count: AtomicU64::new(0),
                protocol_error_count: AtomicU64::new(0),
            }),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.inner.launch.server
    }

    pub fn state(&self) -> ClientState {
        lock_or_recover(&self.inner.session).state
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        lock_or_recover(&self.inner.session).server_info.clone()
    }

    pub fn pending_count(&self) -> usize {
        lock_or_recover(&self.inner.pending).len()
    }

    /// Number of subprocess spawn attempts made by this client.
    pub fn spawn_count(&self) -> u64 {
        self.inner.spawn_count.load(Ordering::SeqCst)
    }

    /// Number of inbound lines that were not valid JSON-RPC frames.
    pub fn protocol_error_count(&self) -> u64 {
        self.inner.protocol_error_count.load(Ordering::SeqCst)
    }

    /// Spawns the sidecar unless it is already running.
    pub async fn connect(&self) -> Result<(), RpcError> {
        if self.state().is_connected() {
            return Ok(());
        }
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.state().is_connected() {
            return Ok(());
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        lock_or_recover(&self.inner.session).state = ClientState::Connecting;
        self.inner.spawn_count.fetch_add(1, Ordering::SeqCst);
        let handler = Arc::new(ClientTransportHandler {
            client: Arc::downgrade(&self.inner),
            generation,
        });

        let transport = match RpcTransport::spawn(&self.inner.launch, handler).await {
            Ok(transport) => Arc::new(transport),
            Err(error) => {
                lock_or_recover(&self.inner.session).state = ClientState::Disconnected;
                tracing::warn!(server = %self.server_name(), error = %error, "sidecar spawn failed");
                return Err(error);
            }
        };

        let mut session = lock_or_recover(&self.inner.session);
        // The exit supervisor marks the transport closed before notifying us,
        // so an early exit is observed here under the session lock.
        if transport.is_closed() {
            session.state = ClientState::Disconnected;
            return Err(RpcError::ConnectionLost {
                server: self.server_name().to_string(),
                exit_code: transport.exit_status().flatten(),
            });
        }
        session.connection = Some(Connection {
            generation,
            transport,
        });
        session.server_info = None;
        session.state = ClientState::Connected;
        Ok(())
    }

    /// Connects if needed and performs the `initialize` handshake once per connection.
    pub async fn initialize(&self, client_info: &ClientInfo) -> Result<ServerInfo, RpcError> {
        if let Some(info) = self.server_info() {
            return Ok(info);
        }
        let _handshake = self.inner.handshake.lock().await;
        if let Some(info) = self.server_info() {
            return Ok(info);
        }

        self.connect().await?;
        let (generation, transport) = self.current_connection()?;
        let result = self
            .call(
                METHOD_INITIALIZE,
                initialize_params(client_info),
                CallOptions::default(),
            )
            .await?;
        let info = ServerInfo::from_initialize_result(self.server_name(), &result)?;
        transport
            .write_frame(&jsonrpc_notification_frame(
                METHOD_INITIALIZED_NOTIFICATION,
                json!({}),
            ))
            .await?;

        let mut session = lock_or_recover(&self.inner.session);
        let still_current = session
            .connection
            .as_ref()
            .is_some_and(|connection| connection.generation == generation);
        if !still_current {
            return Err(RpcError::ConnectionLost {
                server: self.server_name().to_string(),
                exit_code: transport.exit_status().flatten(),
            });
        }
        session.server_info = Some(info.clone());
        session.state = ClientState::Initialized;
        tracing::debug!(
            server = %self.server_name(),
            protocol_version = %info.protocol_version,
            "sidecar initialized"
        );
        Ok(info)
    }

    /// Issues one request and waits for its response, timeout, cancellation, or connection loss.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<Value, RpcError> {
        let (_, transport) = self.current_connection()?;
        let server = self.server_name();
        if options
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return Err(RpcError::Cancelled {
                server: server.to_string(),
                method: method.to_string(),
            });
        }

        let id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();
        lock_or_recover(&self.inner.pending).insert(id, sender);
        let _entry = PendingEntryGuard {
            pending: &self.inner.pending,
            id,
        };
        tracing::debug!(server = %server, request_id = id, method, "sidecar request");

        transport
            .write_frame(&jsonrpc_request_frame(id, method, params))
            .await?;

        let timeout = options.timeout.unwrap_or(self.inner.default_timeout);
        let cancelled = async {
            match options.cancellation.as_ref() {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            outcome = receiver => outcome.unwrap_or_else(|_| {
                Err(RpcError::ConnectionLost {
                    server: server.to_string(),
                    exit_code: transport.exit_status().flatten(),
                })
            }),
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(server = %server, request_id = id, method, "sidecar request timed out");
                Err(RpcError::Timeout {
                    server: server.to_string(),
                    method: method.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
            _ = cancelled => Err(RpcError::Cancelled {
                server: server.to_string(),
                method: method.to_string(),
            }),
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, RpcError> {
        let result = self
            .call(METHOD_TOOLS_LIST, json!({}), CallOptions::default())
            .await?;
        parse_tools_list(self.server_name(), &result)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        options: CallOptions,
    ) -> Result<ToolCallOutcome, RpcError> {
        let result = self
            .call(METHOD_TOOLS_CALL, tools_call_params(name, arguments), options)
            .await?;
        Ok(normalize_tool_call_result(result))
    }

    /// Terminates the sidecar and fails every pending call with `Closed`.
    pub async fn close(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let connection = {
            let mut session = lock_or_recover(&self.inner.session);
            // Invalidate the exit callback of the process we are about to kill.
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            session.state = ClientState::Disconnected;
            session.server_info = None;
            session.connection.take()
        };
        let server = self.server_name().to_string();
        self.inner.fail_all_pending(|| RpcError::Closed {
            server: server.clone(),
        });
        if let Some(connection) = connection {
            connection.transport.shutdown().await;
            tracing::debug!(server = %server, "sidecar closed");
        }
    }

    fn current_connection(&self) -> Result<(u64, Arc<RpcTransport>), RpcError> {
        let session = lock_or_recover(&self.inner.session);
        session
            .connection
            .as_ref()
            .map(|connection| (connection.generation, Arc::clone(&connection.transport)))
            .ok_or_else(|| RpcError::NotConnected {
                server: self.server_name().to_string(),
            })
    }
}

impl ClientInner {
    fn fail_all_pending(&self, error: impl Fn() -> RpcError) -> usize {
        let drained = lock_or_recover(&self.pending)
            .drain()
            .collect::<Vec<_>>();
        let count = drained.len();
        for (_, sender) in drained {
            let _ = sender.send(Err(error()));
        }
        count
    }

    fn complete_pending(&self, id: u64, outcome: Result<Value, RpcError>) -> bool {
        let sender = lock_or_recover(&self.pending).remove(&id);
        match sender {
            Some(sender) => {
                let _ = sender.send(outcome);
                true
            }
            None => false,
        }
    }

    fn transport_for(&self, generation: u64) -> Option<Arc<RpcTransport>> {
        let session = lock_or_recover(&self.session);
        session
            .connection
            .as_ref()
            .filter(|connection| connection.generation == generation)
            .map(|connection| Arc::clone(&connection.transport))
    }
}

/// Removes a pending entry when the owning call finishes or is dropped.
struct PendingEntryGuard<'a> {
    pending: &'a Mutex<HashMap<u64, PendingSender>>,
    id: u64,
}

impl Drop for PendingEntryGuard<'_> {
    fn drop(&mut self) {
        lock_or_recover(self.pending).remove(&self.id);
    }
}

/// Bridges transport callbacks into the owning client without keeping it alive.
struct ClientTransportHandler {
    client: Weak<ClientInner>,
    generation: u64,
}

impl TransportHandler for ClientTransportHandler {
    fn on_line(&self, frame: Value) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let server = client.launch.server.as_str();
        match classify_inbound_frame(frame) {
            InboundFrame::Response { id, outcome } => {
                if !client.complete_pending(id, outcome.into_result(server)) {
                    tracing::warn!(server, request_id = id, "discarding unmatched sidecar response");
                }
            }
            InboundFrame::Notification { method } => {
                tracing::debug!(server, method = %method, "sidecar notification");
            }
            InboundFrame::ServerRequest { id, method } => {
                let Some(transport) = client.transport_for(self.generation) else {
                    return;
                };
                let reply = if method == "ping" {
                    json!({"jsonrpc": JSONRPC_VERSION, "id": id, "result": {}})
                } else {
                    tracing::debug!(server, method = %method, "rejecting sidecar-initiated request");
                    json!({
                        "jsonrpc": JSONRPC_VERSION,
                        "id": id,
                        "error": {
                            "code": JSONRPC_METHOD_NOT_FOUND,
                            "message": format!("method '{method}' is not supported by this client"),
                        }
                    })
                };
                tokio::spawn(async move {
                    let _ = transport.write_frame(&reply).await;
                });
            }
            InboundFrame::Unrecognized { reason } => {
                client.protocol_error_count.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(server, reason, "ignoring unrecognized sidecar frame");
            }
        }
    }

    fn on_exit(&self, exit_code: Option<i32>) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        {
            let mut session = lock_or_recover(&client.session);
            if client.generation.load(Ordering::SeqCst) != self.generation {
                return;
            }
            session.state = ClientState::Disconnected;
            session.server_info = None;
            session.connection = None;
        }
        let server = client.launch.server.clone();
        let failed = client.fail_all_pending(|| RpcError::ConnectionLost {
            server: server.clone(),
            exit_code,
        });
        tracing::warn!(server = %server, exit_code = ?exit_code, failed_requests = failed, "sidecar exited");
    }

    fn on_diagnostic(&self, diagnostic: TransportDiagnostic) {
        if let (TransportDiagnostic::InvalidJson { .. }, Some(client)) =
            (&diagnostic, self.client.upgrade())
        {
            client.protocol_error_count.fetch_add(1, Ordering::SeqCst);
        }
    }
}
