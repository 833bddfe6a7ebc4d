//! Authentication for the REST API
//!
//! Handles token generation, storage, and validation for the daemon HTTP server.

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64, Engine};
use rand::RngCore;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default token file path
pub const DEFAULT_TOKEN_PATH: &str = "/var/run/vtunnel/auth-token";

/// Authentication state shared across handlers
#[derive(Clone)]
pub struct AuthState {
    /// The valid authentication token
    token: Arc<String>,
}

impl AuthState {
    pub fn new(token: String) -> Self {
        Self {
            token: Arc::new(token),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Generate a random 32-byte token, URL-safe base64 so it can travel in a query string
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

/// Write the token to `path` (or the default location), readable by owner and group
pub fn write_token_file(token: &str, path: Option<PathBuf>) -> Result<PathBuf, std::io::Error> {
    let token_path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_TOKEN_PATH));

    if let Some(parent) = token_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(&token_path, token)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&token_path, std::fs::Permissions::from_mode(0o640))?;
    }

    tracing::info!("Auth token written to {:?}", token_path);
    Ok(token_path)
}

/// Read a token written by [`write_token_file`]
pub fn read_token_file(path: &Path) -> Result<String, std::io::Error> {
    let token = std::fs::read_to_string(path)?;
    Ok(token.trim().to_string())
}

/// Axum middleware for token authentication
///
/// Accepts `Authorization: Bearer <token>`, or a `token` query parameter for
/// event-stream clients that cannot set headers.
pub async fn auth_middleware(
    State(auth_state): State<AuthState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let header_token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let authorized = match header_token {
        Some(header) => match header.strip_prefix("Bearer ") {
            Some(token) => token == auth_state.token(),
            None => {
                tracing::warn!("Malformed Authorization header");
                false
            }
        },
        None => query_token(request.uri().query()) == Some(auth_state.token()),
    };

    if authorized {
        Ok(next.run(request).await)
    } else {
        tracing::warn!("Rejected unauthenticated request to {}", request.uri().path());
        Err(StatusCode::UNAUTHORIZED)
    }
}

fn query_token(query: Option<&str>) -> Option<&str> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
}
