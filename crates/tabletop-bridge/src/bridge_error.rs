use tabletop_rpc::RpcError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BridgeError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("tool '{tool}' on sidecar '{server}' reported an error: {message}")]
    ToolReportedError {
        server: String,
        tool: String,
        message: String,
    },
    #[error("tool '{tool}' on sidecar '{server}' returned an empty state report")]
    EmptyReport { server: String, tool: String },
}

impl BridgeError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Rpc(error) => error.reason_code(),
            Self::ToolReportedError { .. } => "bridge_tool_reported_error",
            Self::EmptyReport { .. } => "bridge_empty_report",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_rpc_errors_keep_their_reason_code() {
        let error = BridgeError::from(RpcError::UnknownServer {
            server: "narrator".to_string(),
        });
        assert_eq!(error.reason_code(), "sidecar_unknown_server");
        assert!(error.to_string().contains("narrator"));

        let error = BridgeError::EmptyReport {
            server: "game-state".to_string(),
            tool: "get_combat_state".to_string(),
        };
        assert_eq!(error.reason_code(), "bridge_empty_report");
    }
}
