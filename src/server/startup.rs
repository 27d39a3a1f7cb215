//! Testable server startup logic.
//!
//! Provides [`ServerConfig`] and [`ServerHandle`] so integration tests can
//! spin up a real gateway on an ephemeral port, exercise its HTTP and
//! WebSocket endpoints, and shut it down cleanly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::server::http::create_router;
use crate::server::ws::WsServerState;

/// Grace period the binary allows for in-flight work on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Everything needed to start a gateway.
pub struct ServerConfig {
    pub ws_state: Arc<WsServerState>,
    pub bind_address: SocketAddr,
}

impl ServerConfig {
    pub fn new(ws_state: Arc<WsServerState>, bind_address: SocketAddr) -> Self {
        Self {
            ws_state,
            bind_address,
        }
    }

    /// Binds to `127.0.0.1:0` (OS-assigned port).
    pub fn for_testing(ws_state: Arc<WsServerState>) -> Self {
        Self::new(ws_state, SocketAddr::from(([127, 0, 0, 1], 0)))
    }
}

/// Handle to a running server. Returned by [`run_server_with_config`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    ws_state: Arc<WsServerState>,
    server_task: JoinHandle<Result<(), std::io::Error>>,
}

impl ServerHandle {
    /// The port the server actually bound to (useful when binding to port 0).
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://ip:port` base URL for the running server.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// `ws://ip:port/ws` URL for the gateway socket.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    pub fn ws_state(&self) -> &Arc<WsServerState> {
        &self.ws_state
    }

    /// Graceful shutdown with a short grace period (tests).
    pub async fn shutdown(self) {
        self.shutdown_with_grace("server-shutdown", Duration::from_secs(5))
            .await
    }

    /// Close every connection with `ServerShutdown`, stop accepting, then
    /// wait up to `grace` for the HTTP server to finish.
    pub async fn shutdown_with_grace(self, reason: &str, grace: Duration) {
        self.ws_state.shutdown(reason);
        let _ = self.shutdown_tx.send(true);

        match tokio::time::timeout(grace, self.server_task).await {
            Ok(Ok(Ok(()))) => info!(target: "gateway", "server stopped"),
            Ok(Ok(Err(e))) => error!(target: "gateway", error = %e, "server task returned error"),
            Ok(Err(e)) => error!(target: "gateway", error = %e, "server task panicked"),
            Err(_) => warn!(
                target: "gateway",
                grace_ms = grace.as_millis() as u64,
                "server task did not finish within grace period"
            ),
        }
    }
}

/// Start the gateway from a [`ServerConfig`].
pub async fn run_server_with_config(config: ServerConfig) -> Result<ServerHandle, std::io::Error> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = create_router(config.ws_state.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    let local_addr = listener.local_addr()?;
    info!(target: "gateway", addr = %local_addr, "gateway listening");

    let mut shutdown_watch = shutdown_rx;
    let server_task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown_watch.borrow() {
                    break;
                }
                if shutdown_watch.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
    });

    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        ws_state: config.ws_state,
        server_task,
    })
}

/// Wait for Ctrl+C or SIGTERM and return a label for logging.
#[cfg(unix)]
pub async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!(
                target: "gateway",
                error = %e,
                "failed to install SIGTERM handler; falling back to Ctrl+C only"
            );
            ctrl_c_or_pending().await
        }
    }
}

#[cfg(not(unix))]
pub async fn await_shutdown_trigger() -> &'static str {
    ctrl_c_or_pending().await
}

async fn ctrl_c_or_pending() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(e) => {
            error!(target: "gateway", error = %e, "failed to install Ctrl+C handler");
            std::future::pending().await
        }
    }
}
