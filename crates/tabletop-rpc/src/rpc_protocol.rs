//! JSON-RPC 2.0 frame construction and inbound frame classification.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::RpcError;

pub const JSONRPC_VERSION: &str = "2.0";
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED_NOTIFICATION: &str = "notifications/initialized";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";

/// Identity announced to the sidecar during the `initialize` handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "tabletop-bridge".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Handshake result reported by the sidecar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerInfo {
    pub protocol_version: String,
    pub name: Option<String>,
    pub version: Option<String>,
    pub capabilities: Value,
    pub instructions: Option<String>,
}

impl ServerInfo {
    pub(crate) fn from_initialize_result(server: &str, result: &Value) -> Result<Self, RpcError> {
        let object = result.as_object().ok_or_else(|| RpcError::InvalidResponse {
            server: server.to_string(),
            detail: "initialize result is not an object".to_string(),
        })?;
        let protocol_version = object
            .get("protocolVersion")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(MCP_PROTOCOL_VERSION)
            .to_string();
        let server_info = object.get("serverInfo");
        let text_field = |key: &str| {
            server_info
                .and_then(|info| info.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Ok(Self {
            protocol_version,
            name: text_field("name"),
            version: text_field("version"),
            capabilities: object
                .get("capabilities")
                .cloned()
                .unwrap_or_else(|| json!({})),
            instructions: object
                .get("instructions")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

pub fn jsonrpc_request_frame(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
        "params": params,
    })
}

pub fn jsonrpc_notification_frame(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "params": params,
    })
}

pub fn initialize_params(client_info: &ClientInfo) -> Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {"tools": {"listChanged": true}},
        "clientInfo": {
            "name": client_info.name,
            "version": client_info.version,
        }
    })
}

/// Outcome carried by a response frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Result(Value),
    Error {
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

impl ResponseOutcome {
    pub fn into_result(self, server: &str) -> Result<Value, RpcError> {
        match self {
            Self::Result(value) => Ok(value),
            Self::Error {
                code,
                message,
                data,
            } => Err(RpcError::Remote {
                server: server.to_string(),
                code,
                message,
                data,
            }),
        }
    }
}

/// Classification of one inbound JSON document.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Response { id: u64, outcome: ResponseOutcome },
    Notification { method: String },
    ServerRequest { id: Value, method: String },
    Unrecognized { reason: &'static str },
}

pub fn classify_inbound_frame(value: Value) -> InboundFrame {
    let Value::Object(mut object) = value else {
        return InboundFrame::Unrecognized {
            reason: "frame is not a json object",
        };
    };
    let method = object
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string);
    let raw_id = object.remove("id").filter(|id| !id.is_null());

    if let Some(method) = method {
        return match raw_id {
            Some(id) => InboundFrame::ServerRequest { id, method },
            None => InboundFrame::Notification { method },
        };
    }

    let Some(raw_id) = raw_id else {
        return InboundFrame::Unrecognized {
            reason: "response frame is missing an id",
        };
    };
    let Some(id) = request_id_from_value(&raw_id) else {
        return InboundFrame::Unrecognized {
            reason: "response id is not a client-issued id",
        };
    };

    if let Some(error) = object.remove("error") {
        let code = error
            .get("code")
            .and_then(Value::as_i64)
            .unwrap_or_default();
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown json-rpc error")
            .to_string();
        let data = error.get("data").cloned();
        return InboundFrame::Response {
            id,
            outcome: ResponseOutcome::Error {
                code,
                message,
                data,
            },
        };
    }
    match object.remove("result") {
        Some(result) => InboundFrame::Response {
            id,
            outcome: ResponseOutcome::Result(result),
        },
        None => InboundFrame::Unrecognized {
            reason: "response frame has neither result nor error",
        },
    }
}

fn request_id_from_value(raw: &Value) -> Option<u64> {
    match raw {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_request_frame_carries_numeric_id_and_version() {
        let frame = jsonrpc_request_frame(7, METHOD_TOOLS_LIST, json!({}));
        assert_eq!(frame["jsonrpc"], "2.0");
        assert_eq!(frame["id"], 7);
        assert_eq!(frame["method"], "tools/list");
    }

    #[test]
    fn unit_classify_accepts_numeric_string_ids() {
        let frame = classify_inbound_frame(json!({"jsonrpc":"2.0","id":"12","result":{"ok":true}}));
        assert_eq!(
            frame,
            InboundFrame::Response {
                id: 12,
                outcome: ResponseOutcome::Result(json!({"ok": true})),
            }
        );
    }

    #[test]
    fn unit_classify_maps_error_objects() {
        let frame = classify_inbound_frame(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "error": {"code": -32602, "message": "bad params"}
        }));
        let InboundFrame::Response { id, outcome } = frame else {
            panic!("expected response frame");
        };
        assert_eq!(id, 3);
        let error = outcome.into_result("game-state").expect_err("remote error");
        assert_eq!(error.reason_code(), "sidecar_jsonrpc_error");
    }

    #[test]
    fn unit_classify_separates_notifications_and_server_requests() {
        assert_eq!(
            classify_inbound_frame(json!({"jsonrpc":"2.0","method":"notifications/progress"})),
            InboundFrame::Notification {
                method: "notifications/progress".to_string()
            }
        );
        assert!(matches!(
            classify_inbound_frame(json!({"jsonrpc":"2.0","id":"srv-1","method":"ping"})),
            InboundFrame::ServerRequest { .. }
        ));
    }

    #[test]
    fn regression_classify_rejects_foreign_ids_and_non_objects() {
        assert!(matches!(
            classify_inbound_frame(json!({"jsonrpc":"2.0","id":"init-7","result":{}})),
            InboundFrame::Unrecognized { .. }
        ));
        assert!(matches!(
            classify_inbound_frame(json!([1, 2, 3])),
            InboundFrame::Unrecognized { .. }
        ));
        assert!(matches!(
            classify_inbound_frame(json!({"jsonrpc":"2.0","id":4})),
            InboundFrame::Unrecognized { .. }
        ));
    }

    #[test]
    fn unit_server_info_defaults_missing_fields() {
        let info = ServerInfo::from_initialize_result(
            "game-state",
            &json!({"serverInfo": {"name": "dm-engine", "version": "0.3.1"}}),
        )
        .expect("server info");
        assert_eq!(info.protocol_version, MCP_PROTOCOL_VERSION);
        assert_eq!(info.name.as_deref(), Some("dm-engine"));
        assert_eq!(info.capabilities, json!({}));
        assert!(ServerInfo::from_initialize_result("game-state", &json!("nope")).is_err());
    }
}
