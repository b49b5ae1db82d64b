//! Error types for MCP Hub

use std::io;

use thiserror::Error;

/// Result type alias for MCP Hub
pub type Result<T> = std::result::Result<T, Error>;

/// MCP Hub errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON-RPC error
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// Error code
        code: i32,
        /// Error message
        message: String,
        /// Optional data
        data: Option<serde_json::Value>,
    },

    /// Key source could not be read
    #[error("Key source error: {0}")]
    KeySource(String),

    /// Catalog collaborator failure
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// The session's engine has already been closed
    #[error("Session closed")]
    SessionClosed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a JSON-RPC error
    pub fn json_rpc(code: i32, message: impl Into<String>) -> Self {
        Self::JsonRpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::JsonRpc { code, .. } => *code,
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::Protocol(_) => rpc_codes::INVALID_REQUEST,
            Self::SessionClosed => rpc_codes::SESSION_NOT_FOUND,
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }
}

/// JSON-RPC error codes
///
/// The `-32000..=-32003` block is reserved for gateway conditions that occur
/// before a request reaches a session's engine.
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// No valid session id and not an initialization payload
    pub const BAD_REQUEST: i32 = -32000;
    /// Session id header is not a v4 UUID
    pub const INVALID_SESSION_ID: i32 = -32001;
    /// Session id is well-formed but no such session is open
    pub const SESSION_NOT_FOUND: i32 = -32002;
    /// Admission control rejected a new session
    pub const SERVER_AT_CAPACITY: i32 = -32003;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_code_mapping() {
        assert_eq!(Error::json_rpc(-32099, "x").to_rpc_code(), -32099);
        assert_eq!(
            Error::Protocol("bad".into()).to_rpc_code(),
            rpc_codes::INVALID_REQUEST
        );
        assert_eq!(Error::SessionClosed.to_rpc_code(), rpc_codes::SESSION_NOT_FOUND);
        assert_eq!(
            Error::Internal("boom".into()).to_rpc_code(),
            rpc_codes::INTERNAL_ERROR
        );
    }

    #[test]
    fn json_error_maps_to_parse_error() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.to_rpc_code(), rpc_codes::PARSE_ERROR);
    }
}
