//! Per-session protocol engine and the factory that builds it
//!
//! Every session gets its own [`Engine`] with its own tool handler instances,
//! call counter and notification channel. The only thing sessions share is
//! the read-only [`Services`] bundle.

pub mod tools;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::error::rpc_codes;
use crate::protocol::{
    IncomingMessage, Info, InitializeParams, InitializeResult, JsonRpcNotification,
    JsonRpcResponse, RequestId, ServerCapabilities, ToolsCallParams, ToolsCallResult,
    ToolsCapability, ToolsListResult, negotiate_version, parse_message,
};
use crate::{Error, Result};

use tools::{ToolContext, ToolHandler, session_tools};

/// Server name reported in `initialize`
pub const SERVER_NAME: &str = "mcp-hub";

/// Shared collaborators handed to every engine by reference
#[derive(Clone)]
pub struct Services {
    /// Catalog collaborator
    pub catalog: Arc<dyn Catalog>,
}

impl Services {
    /// Bundle collaborators
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }
}

/// Builds a fresh, isolated [`Engine`] for each session
#[derive(Clone)]
pub struct SessionFactory {
    services: Services,
    notification_buffer: usize,
}

impl SessionFactory {
    /// Create a factory over shared services
    pub fn new(services: Services, notification_buffer: usize) -> Self {
        Self {
            services,
            notification_buffer: notification_buffer.max(1),
        }
    }

    /// Build a new engine. `session_id` is `None` for the stdio transport.
    #[must_use]
    pub fn create(&self, session_id: Option<String>) -> Engine {
        let (notifications, _) = broadcast::channel(self.notification_buffer);
        Engine {
            session_id,
            tools: session_tools(&self.services.catalog),
            call_count: AtomicU64::new(0),
            notifications,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Protocol engine bound to exactly one session
pub struct Engine {
    session_id: Option<String>,
    tools: Vec<Box<dyn ToolHandler>>,
    call_count: AtomicU64,
    notifications: broadcast::Sender<JsonRpcNotification>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("session_id", &self.session_id)
            .field("tools", &self.tools.len())
            .field("call_count", &self.call_count)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Session this engine belongs to
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Tool calls handled so far
    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Handle one inbound JSON-RPC message.
    ///
    /// Returns `Ok(None)` for notifications and client responses, which get
    /// no reply. Malformed messages are answered with a JSON-RPC error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] once the engine has been closed.
    pub async fn handle(&self, message: &Value) -> Result<Option<JsonRpcResponse>> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }

        let message = match parse_message(message) {
            Ok(m) => m,
            Err(response) => return Ok(Some(response)),
        };

        match message {
            IncomingMessage::Request { id, method, params } => {
                Ok(Some(self.handle_request(id, &method, params).await))
            }
            IncomingMessage::Notification { method, .. } => {
                debug!(session_id = ?self.session_id, method = %method, "Notification received");
                Ok(None)
            }
            IncomingMessage::Response { id } => {
                debug!(session_id = ?self.session_id, id = ?id, "Client response ignored");
                Ok(None)
            }
        }
    }

    async fn handle_request(
        &self,
        id: RequestId,
        method: &str,
        params: Option<Value>,
    ) -> JsonRpcResponse {
        match method {
            "initialize" => Self::handle_initialize(id, params),
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => self.handle_tools_list(id),
            "tools/call" => self.handle_tools_call(id, params).await,
            _ => JsonRpcResponse::error(
                Some(id),
                rpc_codes::METHOD_NOT_FOUND,
                format!("Method not found: {method}"),
            ),
        }
    }

    fn handle_initialize(id: RequestId, params: Option<Value>) -> JsonRpcResponse {
        let params: InitializeParams =
            match params.map(serde_json::from_value).transpose() {
                Ok(Some(p)) => p,
                Ok(None) => {
                    return JsonRpcResponse::error(
                        Some(id),
                        rpc_codes::INVALID_PARAMS,
                        "Missing initialize params",
                    );
                }
                Err(e) => {
                    return JsonRpcResponse::error(
                        Some(id),
                        rpc_codes::INVALID_PARAMS,
                        format!("Invalid initialize params: {e}"),
                    );
                }
            };

        let negotiated = negotiate_version(&params.protocol_version);
        debug!(
            client = %params.client_info.name,
            requested = %params.protocol_version,
            negotiated,
            "Protocol version negotiation"
        );

        let result = InitializeResult {
            protocol_version: negotiated.to_string(),
            capabilities: ServerCapabilities {
                logging: Some(HashMap::new()),
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
            },
            server_info: Info {
                name: SERVER_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: Some("MCP Hub".to_string()),
            },
            instructions: Some(
                "Use catalog_search to find skills, commands, subagents and MCP servers, \
                 then catalog_get for details."
                    .to_string(),
            ),
        };
        to_response(id, &result)
    }

    fn handle_tools_list(&self, id: RequestId) -> JsonRpcResponse {
        let result = ToolsListResult {
            tools: self.tools.iter().map(|t| t.definition()).collect(),
            next_cursor: None,
        };
        to_response(id, &result)
    }

    /// Decode `tools/call` params and find the named tool
    fn resolve_call(&self, params: Option<Value>) -> Result<(&dyn ToolHandler, ToolsCallParams)> {
        let params: ToolsCallParams = serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(|e| {
                Error::json_rpc(rpc_codes::INVALID_PARAMS, format!("Invalid tools/call params: {e}"))
            })?;
        let tool = self
            .tools
            .iter()
            .find(|t| t.definition().name == params.name)
            .ok_or_else(|| {
                Error::json_rpc(rpc_codes::INVALID_PARAMS, format!("Unknown tool: {}", params.name))
            })?;
        Ok((tool.as_ref(), params))
    }

    async fn handle_tools_call(&self, id: RequestId, params: Option<Value>) -> JsonRpcResponse {
        let (tool, params) = match self.resolve_call(params) {
            Ok(resolved) => resolved,
            Err(e) => return error_response(id, e),
        };

        let call_count = self.call_count.fetch_add(1, Ordering::Relaxed) + 1;
        let ctx = ToolContext {
            session_id: self.session_id.as_deref(),
            call_count,
        };

        let result = match tool.call(ctx, params.arguments).await {
            Ok(text) => ToolsCallResult::text(text),
            Err(e) => {
                warn!(
                    session_id = ?self.session_id,
                    tool = %params.name,
                    error = %e,
                    "Tool call failed"
                );
                ToolsCallResult::failure(format!("Error in {}: {e}", params.name))
            }
        };

        self.notify(
            "notifications/message",
            Some(json!({
                "level": if result.is_error { "warning" } else { "info" },
                "logger": SERVER_NAME,
                "data": {"tool": params.name, "isError": result.is_error}
            })),
        );

        to_response(id, &result)
    }

    /// Subscribe to server-to-client notifications
    pub fn subscribe(&self) -> broadcast::Receiver<JsonRpcNotification> {
        self.notifications.subscribe()
    }

    /// Push a notification to every subscriber. Dropped when nobody listens.
    pub fn notify(&self, method: &str, params: Option<Value>) {
        if self.is_closed() {
            return;
        }
        // Err only means no subscriber is attached
        let _ = self
            .notifications
            .send(JsonRpcNotification::new(method, params));
    }

    /// Close the engine. Only the first call does anything; it returns
    /// whether this call performed the close.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shutdown.cancel();
        debug!(session_id = ?self.session_id, "Engine closed");
        true
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the engine is closed
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    /// Owned close signal, for streams that outlive a borrow of the engine
    pub fn close_signal(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}

fn error_response(id: RequestId, error: Error) -> JsonRpcResponse {
    match error {
        Error::JsonRpc { code, message, .. } => JsonRpcResponse::error(Some(id), code, message),
        other => JsonRpcResponse::error(Some(id), other.to_rpc_code(), other.to_string()),
    }
}

fn to_response<T: serde::Serialize>(id: RequestId, result: &T) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::error(Some(id), rpc_codes::INTERNAL_ERROR, e.to_string()),
    }
}
