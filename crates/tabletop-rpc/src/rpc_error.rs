use serde_json::Value;
use thiserror::Error;

/// Error taxonomy for sidecar transport, correlation, and lifecycle failures.
///
/// Values are `Clone` so a single startup outcome can be handed to every
/// caller waiting on the same in-flight operation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RpcError {
    #[error("failed to spawn sidecar '{server}': {detail}")]
    Spawn { server: String, detail: String },
    #[error("failed to write to sidecar '{server}': {detail}")]
    Write { server: String, detail: String },
    #[error("sidecar '{server}' is closed")]
    Closed { server: String },
    #[error("sidecar '{server}' is not connected")]
    NotConnected { server: String },
    #[error("sidecar '{server}' request '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },
    #[error("sidecar '{server}' exited while requests were pending (exit code {})", render_exit_code(.exit_code))]
    ConnectionLost {
        server: String,
        exit_code: Option<i32>,
    },
    #[error("sidecar '{server}' request '{method}' cancelled")]
    Cancelled { server: String, method: String },
    #[error("sidecar '{server}' returned json-rpc error code={code} message={message}")]
    Remote {
        server: String,
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("sidecar '{server}' returned an invalid response: {detail}")]
    InvalidResponse { server: String, detail: String },
    #[error("unknown sidecar server '{server}'")]
    UnknownServer { server: String },
    #[error("invalid sidecar configuration: {detail}")]
    Config { detail: String },
}

impl RpcError {
    /// Stable snake_case code used in diagnostics and CLI reports.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "sidecar_spawn_failed",
            Self::Write { .. } => "sidecar_write_failed",
            Self::Closed { .. } => "sidecar_closed",
            Self::NotConnected { .. } => "sidecar_not_connected",
            Self::Timeout { .. } => "sidecar_request_timeout",
            Self::ConnectionLost { .. } => "sidecar_connection_lost",
            Self::Cancelled { .. } => "sidecar_request_cancelled",
            Self::Remote { .. } => "sidecar_jsonrpc_error",
            Self::InvalidResponse { .. } => "sidecar_invalid_response",
            Self::UnknownServer { .. } => "sidecar_unknown_server",
            Self::Config { .. } => "sidecar_invalid_config",
        }
    }

    /// Returns true when the caller may reasonably issue the same call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Cancelled { .. } | Self::ConnectionLost { .. }
        )
    }
}

fn render_exit_code(exit_code: &Option<i32>) -> String {
    exit_code
        .as_ref()
        .map(|code| code.to_string())
        .unwrap_or_else(|| "signal".to_string())
}
