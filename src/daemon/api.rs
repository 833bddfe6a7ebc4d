//! REST API message types and error codes

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, CryptoError, InterfaceError, TransportError, VtunnelError};
use crate::session::{SessionState, StatsSnapshot};
use crate::supervisor::SupervisorStatus;

// Application-specific error codes
pub const NOT_CONNECTED: i32 = -1;
pub const CONNECTION_FAILED: i32 = -3;
pub const INVALID_CONFIG: i32 = -4;
pub const INTERFACE_FAILED: i32 = -7;
pub const PERMISSION_DENIED: i32 = -8;
pub const INTERNAL_ERROR: i32 = -32603;

/// Body of `POST /api/v1/connect`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Session configuration content (not a file path)
    pub config: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub connected: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DisconnectResponse {
    /// False when there was no session to stop
    pub disconnected: bool,
}

/// Connection state as reported to API clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl ConnectionState {
    fn from_session(state: SessionState, failed: bool) -> Self {
        match state {
            SessionState::Starting => Self::Connecting,
            SessionState::Running => Self::Connected,
            SessionState::Stopping => Self::Disconnecting,
            SessionState::Idle | SessionState::Stopped if failed => Self::Error,
            SessionState::Idle | SessionState::Stopped => Self::Disconnected,
        }
    }
}

/// Body of `GET /api/v1/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpn_ip: Option<String>,
    #[serde(default)]
    pub excluded_applications: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<u64>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StatusResponse {
    pub fn new(status: SupervisorStatus, stats: Option<StatsSnapshot>) -> Self {
        let stats = stats.unwrap_or_default();
        Self {
            state: ConnectionState::from_session(status.state, status.last_error.is_some()),
            server_endpoint: status.server,
            transport: status.transport,
            interface: status.interface,
            vpn_ip: status.local_address,
            excluded_applications: status.excluded_applications,
            connected_at: status.connected_at,
            bytes_sent: stats.tx_bytes,
            bytes_received: stats.rx_bytes,
            error_message: status.last_error,
        }
    }
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub code: i32,
    pub message: String,
}

impl ApiError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self.code {
            NOT_CONNECTED => StatusCode::CONFLICT,
            INVALID_CONFIG => StatusCode::BAD_REQUEST,
            PERMISSION_DENIED => StatusCode::FORBIDDEN,
            CONNECTION_FAILED => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl From<ConfigError> for ApiError {
    fn from(e: ConfigError) -> Self {
        Self::new(INVALID_CONFIG, format!("Invalid config: {}", e))
    }
}

impl From<VtunnelError> for ApiError {
    fn from(e: VtunnelError) -> Self {
        let code = match &e {
            VtunnelError::Config(_) | VtunnelError::Crypto(CryptoError::InvalidKey) => {
                INVALID_CONFIG
            }
            VtunnelError::Interface(InterfaceError::InsufficientPrivileges { .. }) => {
                PERMISSION_DENIED
            }
            VtunnelError::Interface(_) => INTERFACE_FAILED,
            VtunnelError::Transport(TransportError::Closed) => INTERNAL_ERROR,
            VtunnelError::Transport(_) => CONNECTION_FAILED,
            VtunnelError::Crypto(_) | VtunnelError::System(_) => INTERNAL_ERROR,
        };
        Self::new(code, e.to_string())
    }
}
