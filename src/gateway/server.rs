//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::auth::AuthGate;
use super::router::{AppState, create_router};
use super::session::{SessionStore, spawn_reaper};
use crate::config::Config;
use crate::engine::{Services, SessionFactory};
use crate::{Error, Result};

/// MCP Hub gateway server
pub struct Gateway {
    config: Config,
    services: Services,
}

impl Gateway {
    /// Create a new gateway over shared services
    pub fn new(config: Config, services: Services) -> Self {
        Self { config, services }
    }

    /// Bind the listener and start serving in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is invalid or the port cannot be bound.
    pub async fn start(self) -> Result<GatewayHandle> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let factory = SessionFactory::new(self.services, self.config.session.notification_buffer);
        let sessions = SessionStore::new(factory, self.config.session.max_sessions);
        let auth = Arc::new(AuthGate::from_config(
            &self.config.auth,
            self.config.server.trust_proxy,
        ));

        let state = Arc::new(AppState {
            sessions: Arc::clone(&sessions),
            auth: Arc::clone(&auth),
            keep_alive_interval: self.config.session.keep_alive_interval,
        });
        let app = create_router(state, &self.config.server);

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        info!("============================================================");
        info!("MCP HUB v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(address = %local_addr, "Listening");
        info!(
            max_sessions = self.config.session.max_sessions,
            idle_timeout = ?self.config.session.idle_timeout,
            reaper_interval = ?self.config.session.reaper_interval,
            "Session limits"
        );
        if auth.is_enabled() {
            info!(
                max_failures = self.config.auth.rate_limit_max_failures,
                window = ?self.config.auth.rate_limit_window,
                "AUTHENTICATION enabled (x-api-key)"
            );
        } else {
            warn!("AUTHENTICATION disabled - gateway is open to all requests");
        }
        info!("  POST   http://{local_addr}/mcp  (requests)");
        info!("  GET    http://{local_addr}/mcp  (SSE stream)");
        info!("  DELETE http://{local_addr}/mcp  (end session)");
        info!("  GET    http://{local_addr}/health");
        info!("============================================================");

        let (shutdown_tx, _) = broadcast::channel(1);
        let reaper = spawn_reaper(
            Arc::clone(&sessions),
            self.config.session.reaper_interval,
            self.config.session.idle_timeout,
            shutdown_tx.subscribe(),
        );

        let stop_listener = CancellationToken::new();
        let stop = stop_listener.clone();
        let server = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await
        });

        Ok(GatewayHandle {
            local_addr,
            sessions,
            shutdown_tx,
            reaper,
            stop_listener,
            server,
            shutdown_timeout: self.config.server.shutdown_timeout,
        })
    }

    /// Serve until a termination signal arrives, then drain.
    ///
    /// # Errors
    ///
    /// Returns an error if startup fails or the listener stops abnormally.
    pub async fn run(self) -> Result<()> {
        let handle = self.start().await?;
        shutdown_signal().await;
        handle.shutdown().await
    }
}

/// A running gateway
pub struct GatewayHandle {
    local_addr: SocketAddr,
    sessions: Arc<SessionStore>,
    shutdown_tx: broadcast::Sender<()>,
    reaper: JoinHandle<()>,
    stop_listener: CancellationToken,
    server: JoinHandle<std::io::Result<()>>,
    shutdown_timeout: Duration,
}

impl GatewayHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Open sessions
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Drain and stop.
    ///
    /// Order: stop the idle reaper, close every open session, then stop
    /// accepting connections. Requests still in flight for a drained
    /// session get a "session not found" reply instead of a reset.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener task failed.
    pub async fn shutdown(self) -> Result<()> {
        info!(active_sessions = self.sessions.len(), "Shutting down");

        // Err only means the reaper already exited
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.reaper.await {
            warn!(error = %e, "Idle reaper ended abnormally");
        }

        let drained = self.sessions.drain();
        debug!(drained, "Sessions closed before listener stop");

        self.stop_listener.cancel();
        let mut server = self.server;
        match tokio::time::timeout(self.shutdown_timeout, &mut server).await {
            Ok(Ok(Ok(()))) => {
                info!("Shutdown complete");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(Error::Io(e)),
            Ok(Err(e)) => Err(Error::Internal(format!("Server task failed: {e}"))),
            Err(_) => {
                warn!(timeout = ?self.shutdown_timeout, "Connections still open after shutdown timeout, aborting");
                server.abort();
                Ok(())
            }
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
