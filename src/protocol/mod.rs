//! MCP Protocol types and JSON-RPC framing

mod messages;
mod types;

pub use messages::*;
pub use types::*;

use serde_json::Value;

use crate::error::rpc_codes;

/// Latest MCP protocol version
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Protocol versions this server can speak, newest first
pub const SUPPORTED_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Pick the version to answer an `initialize` with.
///
/// A supported client version is echoed back; anything else gets the latest.
#[must_use]
pub fn negotiate_version(client_version: &str) -> &'static str {
    SUPPORTED_VERSIONS
        .iter()
        .find(|v| **v == client_version)
        .copied()
        .unwrap_or(PROTOCOL_VERSION)
}

/// A parsed inbound JSON-RPC message
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// Request expecting a response
    Request {
        /// Request ID
        id: RequestId,
        /// Method name
        method: String,
        /// Parameters
        params: Option<Value>,
    },
    /// Notification (no response)
    Notification {
        /// Method name
        method: String,
        /// Parameters
        params: Option<Value>,
    },
    /// Client reply to a server-initiated request
    Response {
        /// Request ID being answered
        id: Option<RequestId>,
    },
}

impl IncomingMessage {
    /// Method name, if the message has one
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }
}

/// Returns true when `value` is a JSON-RPC `initialize` request with
/// well-formed params, i.e. a payload that may open a new session.
#[must_use]
pub fn is_initialize_request(value: &Value) -> bool {
    let Ok(IncomingMessage::Request { method, params, .. }) = parse_message(value) else {
        return false;
    };
    method == "initialize"
        && params.is_some_and(|p| serde_json::from_value::<InitializeParams>(p).is_ok())
}

/// Extract a `RequestId` from a JSON value.
///
/// Supports string and integer ID values per JSON-RPC 2.0 spec.
/// Returns `None` if the value is not a recognised ID type.
fn extract_request_id(value: &Value) -> Option<RequestId> {
    if let Some(s) = value.as_str() {
        Some(RequestId::String(s.to_string()))
    } else if let Some(n) = value.as_i64() {
        Some(RequestId::Number(n))
    } else {
        None
    }
}

/// Check whether a method name represents a notification (no response expected).
fn is_notification_method(method: &str) -> bool {
    method.starts_with("notifications/")
}

/// Parse a JSON-RPC request, notification or client response
#[allow(clippy::result_large_err)] // JsonRpcResponse used directly as error body
pub fn parse_message(value: &Value) -> Result<IncomingMessage, JsonRpcResponse> {
    if value.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Invalid JSON-RPC version",
        ));
    }

    let id = value.get("id").and_then(extract_request_id);

    let Some(method_value) = value.get("method") else {
        if value.get("result").is_some() || value.get("error").is_some() {
            return Ok(IncomingMessage::Response { id });
        }
        return Err(JsonRpcResponse::error(
            id,
            rpc_codes::INVALID_REQUEST,
            "Missing method",
        ));
    };

    let Some(method) = method_value.as_str() else {
        return Err(JsonRpcResponse::error(
            id,
            rpc_codes::INVALID_REQUEST,
            "Missing method",
        ));
    };

    let params = value.get("params").cloned();

    match id {
        Some(id) if !is_notification_method(method) => Ok(IncomingMessage::Request {
            id,
            method: method.to_string(),
            params,
        }),
        _ if is_notification_method(method) => Ok(IncomingMessage::Notification {
            method: method.to_string(),
            params,
        }),
        _ => Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Missing id",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn init_request() -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": "init-1",
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": {"name": "test", "version": "1.0"}
            }
        })
    }

    #[test]
    fn version_negotiation() {
        assert_eq!(negotiate_version("2025-03-26"), "2025-03-26");
        assert_eq!(negotiate_version("2024-11-05"), "2024-11-05");
        assert_eq!(negotiate_version("2023-01-01"), PROTOCOL_VERSION);
        assert_eq!(negotiate_version(""), PROTOCOL_VERSION);
    }

    #[test]
    fn extract_request_id_variants() {
        assert_eq!(
            extract_request_id(&json!("abc-123")),
            Some(RequestId::String("abc-123".to_string()))
        );
        assert_eq!(extract_request_id(&json!(42)), Some(RequestId::Number(42)));
        assert_eq!(extract_request_id(&json!(-1)), Some(RequestId::Number(-1)));
        assert!(extract_request_id(&json!(null)).is_none());
        assert!(extract_request_id(&json!(true)).is_none());
        assert!(extract_request_id(&json!(3.14)).is_none());
        assert!(extract_request_id(&json!([1, 2])).is_none());
    }

    #[test]
    fn notification_method_recognized() {
        assert!(is_notification_method("notifications/initialized"));
        assert!(!is_notification_method("initialize"));
        assert!(!is_notification_method(""));
    }

    #[test]
    fn parse_request_with_params() {
        let msg = parse_message(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": "my_tool"}
        }))
        .unwrap();
        match msg {
            IncomingMessage::Request { id, method, params } => {
                assert_eq!(id, RequestId::Number(1));
                assert_eq!(method, "tools/call");
                assert_eq!(params.unwrap()["name"], "my_tool");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_notification_without_id() {
        let msg = parse_message(&json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        }))
        .unwrap();
        assert_eq!(msg.method(), Some("notifications/initialized"));
        assert!(matches!(msg, IncomingMessage::Notification { .. }));
    }

    #[test]
    fn parse_client_response() {
        let msg = parse_message(&json!({"jsonrpc": "2.0", "id": 5, "result": {}})).unwrap();
        assert_eq!(
            msg,
            IncomingMessage::Response {
                id: Some(RequestId::Number(5))
            }
        );
    }

    #[test]
    fn parse_errors() {
        let err = parse_message(&json!({"id": 1, "method": "ping"})).unwrap_err();
        assert_eq!(err.error.unwrap().code, rpc_codes::INVALID_REQUEST);

        let err = parse_message(&json!({"jsonrpc": "2.0", "id": 1})).unwrap_err();
        assert!(err.error.unwrap().message.contains("method"));

        let err = parse_message(&json!({"jsonrpc": "2.0", "method": "tools/list"})).unwrap_err();
        assert!(err.error.unwrap().message.contains("id"));

        let err = parse_message(&json!({"jsonrpc": "2.0", "id": 1, "method": 7})).unwrap_err();
        assert_eq!(err.error.unwrap().code, rpc_codes::INVALID_REQUEST);
    }

    #[test]
    fn initialize_request_detection() {
        assert!(is_initialize_request(&init_request()));

        let mut no_params = init_request();
        no_params.as_object_mut().unwrap().remove("params");
        assert!(!is_initialize_request(&no_params));

        let mut no_id = init_request();
        no_id.as_object_mut().unwrap().remove("id");
        assert!(!is_initialize_request(&no_id));

        let tools_call = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {}});
        assert!(!is_initialize_request(&tools_call));

        let bad_params = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {"x": 1}});
        assert!(!is_initialize_request(&bad_params));

        assert!(!is_initialize_request(&json!([init_request()])));
    }
}
