//! MCP Hub Library
//!
//! Session-multiplexed Model Context Protocol (MCP) gateway.
//!
//! # Features
//!
//! - **Sessions**: one isolated protocol engine per client session, addressed
//!   by the `mcp-session-id` header (MCP Streamable HTTP)
//! - **Admission control**: hard cap on concurrently open sessions
//! - **Authentication**: named API keys with per-address failure throttling
//! - **Idle reaping and shutdown drain**
//! - **Stdio**: the same engine over stdin/stdout for local clients
//!
//! # Protocol Version
//!
//! Negotiates MCP protocol versions 2024-11-05, 2025-03-26 and 2025-06-18.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod catalog;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod keys;
pub mod protocol;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging. `RUST_LOG` overrides `level`.
///
/// Logs go to stderr so the stdio transport keeps stdout for protocol traffic.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
