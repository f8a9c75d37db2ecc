//! JSON-RPC 2.0 envelope types for the MCP host.
//!
//! Pure data module, no I/O. Everything that crosses a wire — client HTTP
//! bodies, backend stdio lines, SSE payloads — is one of the three envelope
//! shapes defined here:
//!
//! | Shape | Keys |
//! |-------|------|
//! | Request | `jsonrpc`, `id`, `method`, `params?` — expects a reply |
//! | Notification | `jsonrpc`, `method`, `params?` — `id` key absent, never replied to |
//! | Response | `jsonrpc`, `id`, exactly one of `result` / `error` |

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Error codes ──────────────────────────────────────────────────────────────

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// Server-defined codes live in -32000..-32099.
/// Backend returned a malformed error or failed in an unclassifiable way.
pub const SERVER_ERROR: i32 = -32000;
/// The backend process exited while calls were outstanding.
pub const BACKEND_TERMINATED: i32 = -32002;
/// A tool call exceeded the per-call deadline.
pub const TOOL_TIMEOUT: i32 = -32003;
/// No backend with the given id, or no backend provides the named tool.
pub const SERVER_NOT_FOUND: i32 = -32004;
/// The client went away before the call completed.
pub const CLIENT_CANCELLED: i32 = -32800;

// ─── Envelope types ───────────────────────────────────────────────────────────

/// A JSON-RPC request — carries an `id` and expects exactly one response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    /// String, number, or null. The `id` *key* is always present on a
    /// request; a missing key makes the message a [`RpcNotification`].
    pub id: Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC notification — same shape as a request but with no `id` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC response (success or error — never both).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, format!("Invalid params: {}", detail.into()))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, "Method not found")
            .with_data(serde_json::json!({ "method": method }))
    }
}

// ─── Incoming message classification ─────────────────────────────────────────

/// A client-originated message: either expects a reply or doesn't.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Request(RpcRequest),
    Notification(RpcNotification),
}

/// Any JSON-RPC message, as read off a backend's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request(RpcRequest),
    Notification(RpcNotification),
    Response(RpcResponse),
}

/// Parse and validate a raw client request body.
///
/// Returns the envelope on success, or the `RpcError` to send back:
/// `-32700` for malformed JSON (with `first_bytes` and `preview` of the
/// offending input in `data`), `-32600` for a well-formed document that is
/// not a valid Request/Notification envelope.
pub fn parse_incoming(raw: &[u8]) -> Result<Incoming, RpcError> {
    let value: Value = match serde_json::from_slice(raw) {
        Ok(v) => v,
        Err(_) => {
            return Err(RpcError::new(PARSE_ERROR, "Parse error").with_data(serde_json::json!({
                "first_bytes": lossy_prefix(raw, 16),
                "preview": lossy_prefix(raw, 120),
            })));
        }
    };

    let obj = match value.as_object() {
        Some(o) => o,
        None => return Err(RpcError::new(INVALID_REQUEST, "Invalid Request")),
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(RpcError::new(INVALID_REQUEST, "Invalid Request"));
    }

    let method = match obj.get("method").and_then(Value::as_str) {
        Some(m) if !m.is_empty() => m.to_string(),
        _ => return Err(RpcError::new(INVALID_REQUEST, "Invalid Request")),
    };

    let params = obj.get("params").cloned();
    if let Some(p) = &params {
        if !p.is_object() && !p.is_array() {
            return Err(RpcError::new(INVALID_REQUEST, "Invalid Request"));
        }
    }

    match obj.get("id") {
        None => Ok(Incoming::Notification(RpcNotification {
            jsonrpc: "2.0".into(),
            method,
            params,
        })),
        Some(id) => {
            if !id.is_string() && !id.is_number() && !id.is_null() {
                return Err(RpcError::new(INVALID_REQUEST, "Invalid Request"));
            }
            Ok(Incoming::Request(RpcRequest {
                jsonrpc: "2.0".into(),
                id: id.clone(),
                method,
                params,
            }))
        }
    }
}

/// Classify an already-parsed JSON value as one of the three envelope shapes.
///
/// Used on the backend reader path, where a stdout line may be a response to
/// one of our calls, a server-initiated request, or an unsolicited
/// notification. Returns `None` for JSON that is none of the three.
pub fn classify(value: Value) -> Option<RpcMessage> {
    let obj = value.as_object()?;
    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return None;
    }

    if obj.contains_key("result") || obj.contains_key("error") {
        return serde_json::from_value(value.clone())
            .ok()
            .map(RpcMessage::Response);
    }
    if obj.get("method").and_then(Value::as_str).is_some() {
        if obj.contains_key("id") {
            return serde_json::from_value(value).ok().map(RpcMessage::Request);
        }
        return serde_json::from_value(value)
            .ok()
            .map(RpcMessage::Notification);
    }
    None
}

fn lossy_prefix(raw: &[u8], limit: usize) -> String {
    String::from_utf8_lossy(&raw[..raw.len().min(limit)]).into_owned()
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_valid_request() {
        let raw = br#"{"jsonrpc":"2.0","method":"initialize","id":7}"#;
        match parse_incoming(raw).unwrap() {
            Incoming::Request(req) => {
                assert_eq!(req.method, "initialize");
                assert_eq!(req.id, json!(7));
                assert!(req.params.is_none());
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn missing_id_key_is_notification() {
        let raw = br#"{"jsonrpc":"2.0","method":"bump","params":{}}"#;
        assert!(matches!(
            parse_incoming(raw).unwrap(),
            Incoming::Notification(_)
        ));
    }

    #[test]
    fn null_id_is_still_a_request() {
        let raw = br#"{"jsonrpc":"2.0","method":"x","id":null}"#;
        match parse_incoming(raw).unwrap() {
            Incoming::Request(req) => assert_eq!(req.id, Value::Null),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_parse_error_with_preview() {
        let err = parse_incoming(b"{not json").unwrap_err();
        assert_eq!(err.code, PARSE_ERROR);
        let data = err.data.unwrap();
        assert_eq!(data["first_bytes"], "{not json");
        assert!(data["preview"].is_string());
    }

    #[test]
    fn wrong_version_is_invalid_request() {
        let err = parse_incoming(br#"{"jsonrpc":"1.0","method":"x","id":1}"#).unwrap_err();
        assert_eq!(err.code, INVALID_REQUEST);
    }

    #[test]
    fn empty_method_is_invalid_request() {
        let err = parse_incoming(br#"{"jsonrpc":"2.0","method":"","id":1}"#).unwrap_err();
        assert_eq!(err.code, INVALID_REQUEST);
    }

    #[test]
    fn scalar_params_is_invalid_request() {
        let err = parse_incoming(br#"{"jsonrpc":"2.0","method":"x","params":3,"id":1}"#)
            .unwrap_err();
        assert_eq!(err.code, INVALID_REQUEST);
    }

    #[test]
    fn bool_id_is_invalid_request() {
        let err = parse_incoming(br#"{"jsonrpc":"2.0","method":"x","id":true}"#).unwrap_err();
        assert_eq!(err.code, INVALID_REQUEST);
    }

    #[test]
    fn non_object_body_is_invalid_request() {
        let err = parse_incoming(b"[1,2,3]").unwrap_err();
        assert_eq!(err.code, INVALID_REQUEST);
    }

    #[test]
    fn request_roundtrip() {
        let req = RpcRequest::new(json!(42), "tools/call", Some(json!({"name": "upper"})));
        let encoded = serde_json::to_vec(&req).unwrap();
        match parse_incoming(&encoded).unwrap() {
            Incoming::Request(decoded) => assert_eq!(decoded, req),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn notification_roundtrip() {
        let n = RpcNotification::new("$/cancelRequest", Some(json!({"id": 3})));
        let encoded = serde_json::to_string(&n).unwrap();
        // The id key must be absent, not null.
        assert!(!encoded.contains("\"id\""));
        match parse_incoming(encoded.as_bytes()).unwrap() {
            Incoming::Notification(decoded) => assert_eq!(decoded, n),
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn response_roundtrip() {
        for resp in [
            RpcResponse::ok(json!(1), json!({"out": "AB"})),
            RpcResponse::err(json!("a"), RpcError::new(TOOL_TIMEOUT, "tool call timed out")),
        ] {
            let encoded = serde_json::to_vec(&resp).unwrap();
            let decoded: RpcResponse = serde_json::from_slice(&encoded).unwrap();
            assert_eq!(decoded, resp);
        }
    }

    #[test]
    fn response_has_exactly_one_of_result_or_error() {
        let ok = serde_json::to_value(RpcResponse::ok(json!(1), json!(null))).unwrap();
        assert!(ok.get("result").is_some() && ok.get("error").is_none());

        let err =
            serde_json::to_value(RpcResponse::err(json!(1), RpcError::new(SERVER_ERROR, "x")))
                .unwrap();
        assert!(err.get("error").is_some() && err.get("result").is_none());
    }

    #[test]
    fn classify_backend_messages() {
        let resp = json!({"jsonrpc": "2.0", "id": 1, "result": {}});
        assert!(matches!(classify(resp), Some(RpcMessage::Response(_))));

        let req = json!({"jsonrpc": "2.0", "id": 9, "method": "sampling/createMessage"});
        assert!(matches!(classify(req), Some(RpcMessage::Request(_))));

        let notif = json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {}});
        assert!(matches!(classify(notif), Some(RpcMessage::Notification(_))));

        assert!(classify(json!({"hello": "world"})).is_none());
        assert!(classify(json!(3)).is_none());
    }

    #[test]
    fn method_not_found_carries_method_name() {
        let err = RpcError::method_not_found("nope");
        assert_eq!(err.code, METHOD_NOT_FOUND);
        assert_eq!(err.data.unwrap()["method"], "nope");
    }
}
