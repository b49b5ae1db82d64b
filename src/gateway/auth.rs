//! Authentication middleware for MCP Hub
//!
//! Every `/mcp` request passes through [`auth_middleware`]:
//! - per-address failure limiting (checked first, before any key lookup)
//! - `x-api-key` presence and length checks
//! - constant-time comparison against every registered key
//!
//! Rejections carry a plain `{"error": "..."}` body. The status code is the
//! only hint about which check failed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode, header::RETRY_AFTER},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use serde_json::json;
use subtle::ConstantTimeEq;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::AuthConfig;
use crate::keys::{ApiKey, KeyRegistry, key_source_from_spec};

/// Header carrying the credential
pub const API_KEY_HEADER: &str = "x-api-key";

/// Information about an authenticated client, inserted as a request extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedClient {
    /// Name of the matched key (audit only)
    pub name: String,
}

/// Why a request was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Too many recent failures from this address
    RateLimited {
        /// Time until the failure window ends
        retry_after: Duration,
    },
    /// No credential presented
    Missing,
    /// Credential longer than the configured cap
    TooLong,
    /// Credential matches no registered key
    Invalid,
}

impl Rejection {
    /// HTTP status for this rejection
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Missing => StatusCode::UNAUTHORIZED,
            Self::TooLong => StatusCode::BAD_REQUEST,
            Self::Invalid => StatusCode::FORBIDDEN,
        }
    }

    fn message(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "Too many failed attempts. Try again later.",
            Self::Missing => "Missing x-api-key header",
            Self::TooLong => "API key too long",
            Self::Invalid => "Invalid API key",
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let mut response =
            (self.status(), Json(json!({ "error": self.message() }))).into_response();
        if let Self::RateLimited { retry_after } = self {
            let secs = retry_after.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

struct FailureEntry {
    failures: u32,
    window_started: Instant,
}

/// Fixed-window failure counter per client address.
///
/// The window opens at the first failure. Entries older than the window are
/// treated as absent and dropped the next time the address is seen; nothing
/// sweeps them in the background.
pub struct FailureLimiter {
    window: Duration,
    max_failures: u32,
    entries: DashMap<String, FailureEntry>,
}

impl FailureLimiter {
    /// Allow `max_failures` failures per `window`
    pub fn new(window: Duration, max_failures: u32) -> Self {
        Self {
            window,
            max_failures,
            entries: DashMap::new(),
        }
    }

    /// Time left in the window if `addr` is throttled, `None` otherwise
    pub fn check(&self, addr: &str) -> Option<Duration> {
        let expired = {
            let entry = self.entries.get(addr)?;
            let elapsed = entry.window_started.elapsed();
            if elapsed < self.window {
                return (entry.failures >= self.max_failures).then(|| self.window - elapsed);
            }
            true
        };
        if expired {
            self.entries
                .remove_if(addr, |_, e| e.window_started.elapsed() >= self.window);
        }
        None
    }

    /// Count one failure for `addr`
    pub fn record_failure(&self, addr: &str) {
        let now = Instant::now();
        self.entries
            .entry(addr.to_string())
            .and_modify(|e| {
                if e.window_started.elapsed() >= self.window {
                    e.failures = 1;
                    e.window_started = now;
                } else {
                    e.failures = e.failures.saturating_add(1);
                }
            })
            .or_insert(FailureEntry {
                failures: 1,
                window_started: now,
            });
    }

    /// Addresses currently tracked, expired or not
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}

/// Compare a presented credential against one key without leaking where
/// they differ. A length mismatch still performs a full-length comparison.
fn credential_matches(presented: &[u8], expected: &[u8]) -> bool {
    if presented.len() != expected.len() {
        let _ = presented.ct_eq(presented);
        return false;
    }
    presented.ct_eq(expected).into()
}

/// Name of the key matching `presented`. Every key is compared, with no
/// early exit on a match.
fn match_key<'a>(keys: &'a [ApiKey], presented: &[u8]) -> Option<&'a str> {
    let mut matched = None;
    for key in keys {
        let hit = credential_matches(presented, key.key.as_bytes());
        if hit && matched.is_none() {
            matched = Some(key.name.as_str());
        }
    }
    matched
}

/// Auth Gate: key registry plus failure limiter
pub struct AuthGate {
    enabled: bool,
    registry: KeyRegistry,
    limiter: FailureLimiter,
    max_key_length: usize,
    trust_proxy: bool,
}

impl AuthGate {
    /// Build the gate over an existing registry
    pub fn new(config: &AuthConfig, trust_proxy: bool, registry: KeyRegistry) -> Self {
        Self {
            enabled: config.enabled,
            registry,
            limiter: FailureLimiter::new(config.rate_limit_window, config.rate_limit_max_failures),
            max_key_length: config.max_key_length,
            trust_proxy,
        }
    }

    /// Build the gate, reading keys from the configured source
    pub fn from_config(config: &AuthConfig, trust_proxy: bool) -> Self {
        let source = key_source_from_spec(&config.api_keys);
        let registry = KeyRegistry::new(Arc::from(source), config.key_cache_ttl);
        Self::new(config, trust_proxy, registry)
    }

    /// Whether authentication is enforced
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Decide whether `credential`, presented from `addr`, is accepted.
    ///
    /// Order: throttle check, presence, length, key comparison. A throttled
    /// address never reaches the key registry. An unreadable key source
    /// counts as an empty key set, so every credential is refused with 403.
    pub async fn authenticate<C>(
        &self,
        addr: &str,
        credential: Option<&C>,
    ) -> Result<AuthenticatedClient, Rejection>
    where
        C: AsRef<[u8]> + ?Sized,
    {
        if let Some(retry_after) = self.limiter.check(addr) {
            return Err(Rejection::RateLimited { retry_after });
        }

        let credential = match credential.map(<C as AsRef<[u8]>>::as_ref) {
            Some(c) if !c.is_empty() => c,
            _ => {
                self.limiter.record_failure(addr);
                return Err(Rejection::Missing);
            }
        };

        if credential.len() > self.max_key_length {
            self.limiter.record_failure(addr);
            return Err(Rejection::TooLong);
        }

        let keys = match self.registry.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                error!(error = %e, "Cannot load API keys");
                Arc::from(Vec::new())
            }
        };

        if let Some(name) = match_key(&keys, credential) {
            return Ok(AuthenticatedClient {
                name: name.to_string(),
            });
        }

        self.limiter.record_failure(addr);
        Err(Rejection::Invalid)
    }

    /// Address used for failure accounting
    pub fn client_address(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        if self.trust_proxy {
            let forwarded = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(addr) = forwarded {
                return addr.to_string();
            }
        }
        peer.map_or_else(|| "unknown".to_string(), |p| p.ip().to_string())
    }
}

/// Authentication middleware
pub async fn auth_middleware(
    State(gate): State<Arc<AuthGate>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if !gate.is_enabled() {
        request.extensions_mut().insert(AuthenticatedClient {
            name: "anonymous".to_string(),
        });
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let addr = gate.client_address(request.headers(), peer);
    let credential = request
        .headers()
        .get(API_KEY_HEADER)
        .map(|v| v.as_bytes().to_vec());

    match gate.authenticate(&addr, credential.as_deref()).await {
        Ok(client) => {
            debug!(client = %client.name, path = %request.uri().path(), "Authenticated request");
            request.extensions_mut().insert(client);
            next.run(request).await
        }
        Err(rejection) => {
            warn!(
                address = %addr,
                status = rejection.status().as_u16(),
                path = %request.uri().path(),
                "Authentication rejected"
            );
            rejection.into_response()
        }
    }
}
