//! HTTP router and handlers
//!
//! `/mcp` decision table (all after authentication):
//!
//! | Session header            | Body                 | Result                      |
//! |---------------------------|----------------------|-----------------------------|
//! | open session              | anything             | routed to that engine       |
//! | not a v4 UUID             | anything             | 400 `INVALID_SESSION_ID`    |
//! | v4 UUID, no such session  | anything             | 400 `SESSION_NOT_FOUND`     |
//! | absent                    | `initialize` request | admission-controlled create |
//! | absent                    | anything else        | 400 `BAD_REQUEST`           |

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{
        HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
        header::{ACCEPT, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS},
    },
    middleware,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::Stream;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};
use uuid::{Uuid, Variant};

use super::auth::{API_KEY_HEADER, AuthGate, AuthenticatedClient, auth_middleware};
use super::session::{AdmissionError, CloseReason, SessionStore};
use crate::Error;
use crate::config::ServerConfig;
use crate::engine::Engine;
use crate::error::rpc_codes;
use crate::protocol::{JsonRpcNotification, JsonRpcResponse, is_initialize_request};

/// Session id header, echoed on successful initialization
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Shared application state
pub struct AppState {
    /// Open sessions
    pub sessions: Arc<SessionStore>,
    /// Authentication gate for `/mcp`
    pub auth: Arc<AuthGate>,
    /// Keep-alive interval for the streaming channel
    pub keep_alive_interval: Duration,
}

/// Create the router
pub fn create_router(state: Arc<AppState>, server: &ServerConfig) -> Router {
    let mcp = Router::new()
        .route(
            "/mcp",
            post(mcp_post_handler)
                .get(mcp_sse_handler)
                .delete(mcp_delete_handler),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.auth),
            auth_middleware,
        ));

    let router = Router::new()
        .route("/health", get(health_handler))
        .merge(mcp)
        .layer(DefaultBodyLimit::max(server.max_body_size))
        .layer(SetResponseHeaderLayer::overriding(
            X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ));

    let router = match cors_layer(&server.cors_origins) {
        Some(cors) => router.layer(cors),
        None => router,
    };

    router
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS for the configured origins. `None` keeps the gateway same-origin only.
fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    if allowed.is_empty() {
        return None;
    }

    let session = HeaderName::from_static(SESSION_HEADER);
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers([
                CONTENT_TYPE,
                ACCEPT,
                HeaderName::from_static(API_KEY_HEADER),
                session.clone(),
                HeaderName::from_static("mcp-protocol-version"),
                HeaderName::from_static("last-event-id"),
            ])
            .expose_headers([session]),
    )
}

/// JSON-RPC error envelope with a null id
fn rpc_error(status: StatusCode, code: i32, message: &str) -> Response {
    (status, Json(JsonRpcResponse::error(None, code, message))).into_response()
}

fn bad_request() -> Response {
    rpc_error(
        StatusCode::BAD_REQUEST,
        rpc_codes::BAD_REQUEST,
        "Bad Request: No valid session ID provided",
    )
}

fn invalid_session_id() -> Response {
    rpc_error(
        StatusCode::BAD_REQUEST,
        rpc_codes::INVALID_SESSION_ID,
        "Invalid session ID format",
    )
}

fn session_not_found() -> Response {
    rpc_error(
        StatusCode::BAD_REQUEST,
        rpc_codes::SESSION_NOT_FOUND,
        "Session not found",
    )
}

/// Strict session id syntax: hyphenated, version 4, RFC 4122 variant,
/// either case.
pub fn parse_session_id(raw: &str) -> Option<Uuid> {
    if raw.len() != 36 {
        return None;
    }
    let id = Uuid::try_parse(raw).ok()?;
    (id.get_version_num() == 4 && id.get_variant() == Variant::RFC4122).then_some(id)
}

/// Session header state of a request
enum SessionHeader {
    Absent,
    Valid(Uuid),
    Malformed,
}

impl SessionHeader {
    fn from_headers(headers: &HeaderMap) -> Self {
        match headers.get(SESSION_HEADER) {
            None => Self::Absent,
            Some(value) => value
                .to_str()
                .ok()
                .and_then(parse_session_id)
                .map_or(Self::Malformed, Self::Valid),
        }
    }
}

/// Look up the session named by the request headers, or the rejection.
/// Bumps the session's activity timestamp.
fn resolve_session(state: &AppState, headers: &HeaderMap) -> Result<(Uuid, Arc<Engine>), Response> {
    match SessionHeader::from_headers(headers) {
        SessionHeader::Absent => Err(bad_request()),
        SessionHeader::Malformed => Err(invalid_session_id()),
        SessionHeader::Valid(id) => state
            .sessions
            .get(&id)
            .map(|engine| (id, engine))
            .ok_or_else(session_not_found),
    }
}

fn with_session_header(mut response: Response, id: Uuid) -> Response {
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(SESSION_HEADER), value);
    }
    response
}

/// Translate an engine reply into HTTP
fn engine_reply(reply: crate::Result<Option<JsonRpcResponse>>) -> Response {
    match reply {
        Ok(Some(response)) => Json(response).into_response(),
        Ok(None) => StatusCode::ACCEPTED.into_response(),
        Err(Error::SessionClosed) => session_not_found(),
        Err(e) => {
            error!(error = %e, "Engine failed to handle request");
            rpc_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_rpc_code(),
                "Internal server error",
            )
        }
    }
}

/// POST /mcp handler: session initialization or continuation
async fn mcp_post_handler(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<AuthenticatedClient>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Session errors win over body errors
    let session = match SessionHeader::from_headers(&headers) {
        SessionHeader::Malformed => return invalid_session_id(),
        SessionHeader::Valid(id) => {
            let Some(engine) = state.sessions.get(&id) else {
                debug!(session_id = %id, "Unknown session");
                return session_not_found();
            };
            Some((id, engine))
        }
        SessionHeader::Absent => None,
    };

    let message: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                rpc_codes::PARSE_ERROR,
                &format!("Parse error: {e}"),
            );
        }
    };

    match session {
        Some((id, engine)) => {
            let reply = engine.handle(&message).await;
            with_session_header(engine_reply(reply), id)
        }
        None if is_initialize_request(&message) => {
            initialize_session(&state, &client, &message).await
        }
        None => bad_request(),
    }
}

/// Admission-controlled session creation
async fn initialize_session(
    state: &AppState,
    client: &AuthenticatedClient,
    message: &Value,
) -> Response {
    let (id, engine) = match state.sessions.admit() {
        Ok(admitted) => admitted,
        Err(AdmissionError::AtCapacity { active }) => {
            warn!(
                active_sessions = active,
                max_sessions = state.sessions.max_sessions(),
                client = %client.name,
                "Max sessions reached"
            );
            return rpc_error(
                StatusCode::SERVICE_UNAVAILABLE,
                rpc_codes::SERVER_AT_CAPACITY,
                "Server at capacity. Try again later.",
            );
        }
        Err(AdmissionError::ShuttingDown) => {
            return rpc_error(
                StatusCode::SERVICE_UNAVAILABLE,
                rpc_codes::SERVER_AT_CAPACITY,
                "Server shutting down",
            );
        }
    };

    match engine.handle(message).await {
        Ok(Some(response)) if !response.is_error() => {
            info!(
                session_id = %id,
                client = %client.name,
                active_sessions = state.sessions.len(),
                "Session created"
            );
            with_session_header(Json(response).into_response(), id)
        }
        reply => {
            state.sessions.remove(id, CloseReason::InitFailed);
            engine_reply(reply)
        }
    }
}

/// GET /mcp handler: SSE stream of the session's notifications
async fn mcp_sse_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let (id, engine) = match resolve_session(&state, &headers) {
        Ok(found) => found,
        Err(rejection) => return rejection,
    };

    let accept = headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !accept.contains("text/event-stream") {
        return (
            StatusCode::NOT_ACCEPTABLE,
            Json(json!({
                "error": "Must accept text/event-stream for SSE notifications"
            })),
        )
            .into_response();
    }

    info!(session_id = %id, "Client connected to SSE stream");
    let sse = Sse::new(notification_stream(
        engine.subscribe(),
        engine.close_signal(),
    ))
    .keep_alive(
        KeepAlive::new()
            .interval(state.keep_alive_interval)
            .text("ping"),
    );
    with_session_header(sse.into_response(), id)
}

/// Notifications as SSE `message` events, ending when the engine closes.
///
/// Takes owned data to satisfy Rust 2024 lifetime capture rules for `impl Stream`.
fn notification_stream(
    mut rx: broadcast::Receiver<JsonRpcNotification>,
    closed: CancellationToken,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    stream! {
        loop {
            let next = tokio::select! {
                () = closed.cancelled() => None,
                msg = rx.recv() => Some(msg),
            };
            match next {
                None | Some(Err(broadcast::error::RecvError::Closed)) => break,
                Some(Ok(notification)) => {
                    let data = serde_json::to_string(&notification).unwrap_or_default();
                    yield Ok(Event::default().event("message").data(data));
                }
                Some(Err(broadcast::error::RecvError::Lagged(n))) => {
                    // Client fell behind, notify them
                    yield Ok(Event::default()
                        .event("lagged")
                        .data(json!({ "missed": n }).to_string()));
                }
            }
        }
    }
}

/// DELETE /mcp handler: explicit session termination
async fn mcp_delete_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let id = match SessionHeader::from_headers(&headers) {
        SessionHeader::Absent => return bad_request(),
        SessionHeader::Malformed => return invalid_session_id(),
        SessionHeader::Valid(id) => id,
    };

    if state.sessions.remove(id, CloseReason::Client) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        debug!(session_id = %id, "Session not found for DELETE");
        session_not_found()
    }
}

/// Health check handler. Never authenticated.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "activeSessions": state.sessions.len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    use crate::catalog::MemoryCatalog;
    use crate::config::AuthConfig;
    use crate::engine::{Services, SessionFactory};
    use crate::keys::KeyRegistry;

    fn app(server: &ServerConfig) -> Router {
        let factory = SessionFactory::new(Services::new(Arc::new(MemoryCatalog::new())), 4);
        let state = Arc::new(AppState {
            sessions: SessionStore::new(factory, 2),
            auth: Arc::new(AuthGate::new(
                &AuthConfig::default(),
                false,
                KeyRegistry::from_raw("test-key"),
            )),
            keep_alive_interval: Duration::from_secs(15),
        });
        create_router(state, server)
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let response = app(&ServerConfig::default())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(json_body(response).await["activeSessions"], 0);
    }

    #[tokio::test]
    async fn mcp_requires_key() {
        let response = app(&ServerConfig::default())
            .oneshot(Request::post("/mcp").body(Body::from("{}")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "Missing x-api-key header");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let server = ServerConfig {
            max_body_size: 64,
            ..ServerConfig::default()
        };
        let response = app(&server)
            .oneshot(
                Request::post("/mcp")
                    .header(API_KEY_HEADER, "test-key")
                    .body(Body::from(vec![b' '; 1024]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn cors_only_for_configured_origins() {
        let preflight = || {
            Request::options("/mcp")
                .header("origin", "https://app.example")
                .header("access-control-request-method", "POST")
                .body(Body::empty())
                .unwrap()
        };

        let response = app(&ServerConfig::default()).oneshot(preflight()).await.unwrap();
        assert!(!response.headers().contains_key("access-control-allow-origin"));

        let server = ServerConfig {
            cors_origins: vec!["https://app.example".to_string()],
            ..ServerConfig::default()
        };
        let response = app(&server).oneshot(preflight()).await.unwrap();
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "https://app.example"
        );
    }

    #[test]
    fn session_id_syntax() {
        assert!(parse_session_id("3f2b8c1e-9d4a-4c6b-8e2f-1a2b3c4d5e6f").is_some());
        assert!(parse_session_id("3F2B8C1E-9D4A-4C6B-8E2F-1A2B3C4D5E6F").is_some());
        // version 1
        assert!(parse_session_id("3f2b8c1e-9d4a-1c6b-8e2f-1a2b3c4d5e6f").is_none());
        // variant nibble outside 8..b
        assert!(parse_session_id("3f2b8c1e-9d4a-4c6b-ce2f-1a2b3c4d5e6f").is_none());
        // simple, braced and short forms
        assert!(parse_session_id("3f2b8c1e9d4a4c6b8e2f1a2b3c4d5e6f").is_none());
        assert!(parse_session_id("{3f2b8c1e-9d4a-4c6b-8e2f-1a2b3c4d5e6f}").is_none());
        assert!(parse_session_id("3f2b8c1e-9d4a-4c6b-8e2f-1a2b3c4d5e6").is_none());
        // non-hex
        assert!(parse_session_id("zf2b8c1e-9d4a-4c6b-8e2f-1a2b3c4d5e6f").is_none());
        assert!(parse_session_id("").is_none());
    }

    #[test]
    fn generated_ids_pass_syntax_check() {
        for _ in 0..16 {
            let id = Uuid::new_v4();
            assert_eq!(parse_session_id(&id.to_string()), Some(id));
        }
    }

    #[test]
    fn session_header_classification() {
        let mut headers = HeaderMap::new();
        assert!(matches!(SessionHeader::from_headers(&headers), SessionHeader::Absent));

        headers.insert(SESSION_HEADER, HeaderValue::from_static("not-a-uuid"));
        assert!(matches!(SessionHeader::from_headers(&headers), SessionHeader::Malformed));

        let id = Uuid::new_v4();
        headers.insert(SESSION_HEADER, HeaderValue::from_str(&id.to_string()).unwrap());
        assert!(matches!(SessionHeader::from_headers(&headers), SessionHeader::Valid(v) if v == id));
    }

    #[test]
    fn cors_disabled_without_origins() {
        assert!(cors_layer(&[]).is_none());
        assert!(cors_layer(&["https://app.example".to_string()]).is_some());
    }
}
