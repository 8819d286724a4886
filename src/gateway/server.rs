//! Proxy server

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::router::{AppState, create_router};
use crate::config::Settings;
use crate::forwarder::Forwarder;
use crate::{Error, Result};

/// HTTP front end of the bridge
pub struct ProxyServer {
    /// Configuration
    settings: Settings,
    /// Shared forwarder (owns registry, token store, gate)
    forwarder: Arc<Forwarder>,
}

impl ProxyServer {
    /// Create a server around an assembled forwarder
    #[must_use]
    pub fn new(settings: Settings, forwarder: Arc<Forwarder>) -> Self {
        Self {
            settings,
            forwarder,
        }
    }

    /// Serve until Ctrl+C / SIGTERM
    pub async fn run(self) -> Result<()> {
        let host = self.settings.proxy.host.clone();
        let port = self.settings.proxy.port;

        let listener = TcpListener::bind((host.as_str(), port))
            .await
            .map_err(|e| Error::Config(format!("Cannot listen on {host}:{port}: {e}")))?;

        let (shutdown_tx, _) = broadcast::channel(1);

        let state = Arc::new(AppState::new(Arc::clone(&self.forwarder)));
        let app = create_router(Arc::clone(&state));

        info!("============================================================");
        info!("MCP OAUTH BRIDGE v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(url = %self.settings.proxy.url(), "Listening");
        info!(servers = state.registry.list_servers().len(), "Servers registered");
        for name in state.registry.list_servers() {
            info!("  {}/mcp/{name}", self.settings.proxy.url());
        }
        info!("Approvals: {}/approvals", self.settings.proxy.url());
        info!("============================================================");

        // Expire overdue approvals even when nobody is polling them
        let gate = Arc::clone(&state.gate);
        let sweep_interval = self.settings.approvals.sweep_interval();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let expired = gate.sweep_expired();
                        if expired > 0 {
                            debug!(expired, "Approval sweep");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Proxy stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
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
    let _ = shutdown_tx.send(());
}
