//! Daemon mode for the vtunnel service
//!
//! Runs as a background service exposing a token-protected REST API on
//! localhost. The host application uses it to connect, disconnect, and
//! observe the tunnel.

pub mod api;
pub mod auth;
pub mod routes;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::VtunnelError;
use crate::supervisor::SessionSupervisor;
use crate::transport::NetworkConnector;
use crate::tunnel::TunRsPlatform;

use auth::AuthState;
use routes::AppState;

/// Default port for the REST API
pub const DEFAULT_HTTP_PORT: u16 = 51820;

/// Daemon service that owns the session supervisor
pub struct DaemonService {
    supervisor: Arc<SessionSupervisor>,
    token_path: Mutex<Option<PathBuf>>,
}

impl Default for DaemonService {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonService {
    /// Create a daemon that provisions real TUN devices and sockets
    pub fn new() -> Self {
        let supervisor = SessionSupervisor::new(
            Arc::new(TunRsPlatform::new()),
            Arc::new(NetworkConnector),
        );
        Self::with_supervisor(Arc::new(supervisor))
    }

    pub fn with_supervisor(supervisor: Arc<SessionSupervisor>) -> Self {
        Self {
            supervisor,
            token_path: Mutex::new(None),
        }
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        &self.supervisor
    }

    /// Serve the REST API on 127.0.0.1:`port` until the listener fails
    pub async fn run_http(&self, port: u16, token_path: Option<PathBuf>) -> Result<(), VtunnelError> {
        let token = auth::generate_token();
        let written = auth::write_token_file(&token, token_path)?;
        *self.token_path.lock().unwrap_or_else(|p| p.into_inner()) = Some(written);

        let router = routes::build_router(
            AppState {
                supervisor: self.supervisor.clone(),
            },
            AuthState::new(token),
        );

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Daemon REST API listening on http://{}", addr);

        axum::serve(listener, router).await?;
        Ok(())
    }

    /// Stop any active session and remove the token file
    pub async fn cleanup(&self) -> Result<(), VtunnelError> {
        self.supervisor.disconnect().await;

        let token_path = self
            .token_path
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(path) = token_path {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!("Failed to remove token file {:?}: {}", path, e);
            }
        }

        Ok(())
    }
}
