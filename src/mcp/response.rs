//! Uniform interpretation of MCP replies
//!
//! REST and JSON-RPC replies are read the same way: a tool-level failure is flagged by
//! `isError: true` at the top level or one level down under `result`; a protocol-level
//! failure is a non-null JSON-RPC `error`. Anything else is a result to stringify.

use serde_json::Value;

/// What a parsed reply means
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McpReply {
    /// The tool ran; its output as text
    Success(String),
    /// The tool ran and reported failure
    ToolError(String),
    /// The endpoint rejected the call (JSON-RPC `error`, wrong method, ...)
    ProtocolError(String),
}

fn flagged_error(value: &Value) -> bool {
    value.get("isError").and_then(Value::as_bool) == Some(true)
}

pub fn interpret(value: &Value) -> McpReply {
    if value.is_null() {
        return McpReply::ProtocolError("empty response body".to_string());
    }
    if flagged_error(value) {
        return McpReply::ToolError(error_text(value));
    }
    if let Some(result) = value.get("result") {
        if flagged_error(result) {
            return McpReply::ToolError(error_text(result));
        }
    }
    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| stringify(error));
        return McpReply::ProtocolError(message);
    }

    let payload = value
        .get("result")
        .or_else(|| value.get("content"))
        .unwrap_or(value);
    McpReply::Success(stringify(payload))
}

fn error_text(value: &Value) -> String {
    let text = value
        .get("content")
        .or_else(|| value.get("error"))
        .map(stringify)
        .unwrap_or_default();
    if text.trim().is_empty() {
        "tool reported an error".to_string()
    } else {
        text
    }
}

/// Flatten an MCP payload to text.
///
/// Strings pass through, arrays join with newlines, `{type:"text", text}` items yield
/// their text, and objects wrapping `content` / `result` / `error` are unwrapped.
/// Anything else is compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(items) => items
            .iter()
            .map(stringify)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(obj) => {
            if let Some(text) = obj.get("text").and_then(Value::as_str) {
                return text.to_string();
            }
            for key in ["content", "result", "error"] {
                if let Some(inner) = obj.get(key).filter(|v| !v.is_null()) {
                    return stringify(inner);
                }
            }
            if let Some(structured) = obj.get("structuredContent") {
                return structured.to_string();
            }
            value.to_string()
        }
    }
}
