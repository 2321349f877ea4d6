//! `tools/list` and `tools/call` payload normalization.

use serde::Serialize;
use serde_json::{json, Value};

use crate::RpcError;

/// Tool advertised by a sidecar in its `tools/list` response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Normalized `tools/call` result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallOutcome {
    pub is_error: bool,
    /// `structuredContent` when present, otherwise the raw `content` array.
    pub payload: Value,
    /// Concatenated `content[].text` blocks, newline separated.
    pub text: String,
}

pub fn parse_tools_list(server: &str, result: &Value) -> Result<Vec<ToolDescriptor>, RpcError> {
    let tools = result
        .get("tools")
        .and_then(Value::as_array)
        .ok_or_else(|| RpcError::InvalidResponse {
            server: server.to_string(),
            detail: "tools/list payload has no tools array".to_string(),
        })?;

    let mut descriptors = Vec::with_capacity(tools.len());
    for tool in tools {
        let Some(name) = tool
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
        else {
            tracing::warn!(server, "skipping tool descriptor without a name");
            continue;
        };
        if descriptors
            .iter()
            .any(|existing: &ToolDescriptor| existing.name == name)
        {
            tracing::warn!(server, tool = name, "skipping duplicate tool descriptor");
            continue;
        }
        descriptors.push(ToolDescriptor {
            name: name.to_string(),
            description: tool
                .get("description")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .unwrap_or("external sidecar tool")
                .to_string(),
            input_schema: tool
                .get("inputSchema")
                .cloned()
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        });
    }
    Ok(descriptors)
}

pub fn tools_call_params(name: &str, arguments: Value) -> Value {
    json!({
        "name": name,
        "arguments": arguments,
    })
}

pub fn normalize_tool_call_result(result: Value) -> ToolCallOutcome {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| {
                    block
                        .get("type")
                        .and_then(Value::as_str)
                        .map(|kind| kind == "text")
                        .unwrap_or(true)
                })
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .or_else(|| result.as_str().map(str::to_string))
        .unwrap_or_default();
    let payload = result
        .get("structuredContent")
        .cloned()
        .or_else(|| result.get("content").cloned())
        .unwrap_or(result);
    ToolCallOutcome {
        is_error,
        payload,
        text,
    }
}
