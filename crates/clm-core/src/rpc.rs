//! JSON-RPC 2.0 message shapes.
//!
//! Three shapes travel on every wire: requests (`id` + `method`), responses
//! (`id` + `result` or `error`), and notifications (`method` without `id`).
//! [`Incoming::parse`] classifies a decoded [`Value`]; the constructors build
//! outgoing messages.

use serde_json::{Value, json};

/// JSON-RPC error code: method not found.
///
/// The only error-shaped response this server emits; tool and submission
/// failures travel as `isError` text inside a tool result instead.
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;

/// A classified inbound JSON-RPC message.
#[derive(Debug, Clone)]
pub enum Incoming {
    /// A request carrying an id the peer expects echoed in the reply.
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    /// A request without an id; no reply is expected.
    Notification { method: String, params: Value },
    /// A reply to one of our own requests.
    Response {
        id: Value,
        result: Option<Value>,
        error: Option<Value>,
    },
}

impl Incoming {
    /// Classify a decoded JSON value into one of the three wire shapes.
    ///
    /// Returns `None` for objects that are none of the three (for example a
    /// bare `{}`), which callers drop the same way they drop malformed JSON.
    pub fn parse(msg: Value) -> Option<Self> {
        let method = msg.get("method").and_then(|v| v.as_str()).map(String::from);
        let id = msg.get("id").cloned();

        match (method, id) {
            (Some(method), Some(id)) => Some(Incoming::Request {
                id,
                method,
                params: msg.get("params").cloned().unwrap_or(Value::Null),
            }),
            (Some(method), None) => Some(Incoming::Notification {
                method,
                params: msg.get("params").cloned().unwrap_or(Value::Null),
            }),
            (None, Some(id)) => {
                if msg.get("result").is_none() && msg.get("error").is_none() {
                    return None;
                }
                Some(Incoming::Response {
                    id,
                    result: msg.get("result").cloned(),
                    error: msg.get("error").cloned(),
                })
            }
            (None, None) => None,
        }
    }
}

/// Construct a JSON-RPC request.
pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Construct a JSON-RPC notification (a request without an id).
pub fn notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

/// Construct a successful JSON-RPC response.
pub fn result_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

/// Construct a JSON-RPC error response.
pub fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

/// Construct a `tools/call` result carrying one text content element.
///
/// Every tool response on the client wire has this shape; errors set the
/// `isError` flag alongside the textual message.
pub fn tool_text_result(text: &str, is_error: bool) -> Value {
    json!({
        "content": [{
            "type": "text",
            "text": text,
        }],
        "isError": is_error,
    })
}

/// Extract the text of a tool result whose `content` is a single-element
/// text array. Returns `None` for any other shape.
pub fn single_text_content(result: &Value) -> Option<String> {
    let content = result.get("content")?.as_array()?;
    if content.len() != 1 {
        return None;
    }
    let entry = &content[0];
    if entry.get("type")?.as_str()? != "text" {
        return None;
    }
    entry.get("text")?.as_str().map(String::from)
}
