//! REST API route handlers for the daemon HTTP server

use axum::{
    extract::State,
    middleware,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::trace::TraceLayer;

use super::api::*;
use super::auth::{auth_middleware, AuthState};
use crate::config::SessionConfig;
use crate::supervisor::SessionSupervisor;

/// Shared application state for route handlers
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<SessionSupervisor>,
}

/// Build the API router with all routes behind token authentication
pub fn build_router(state: AppState, auth: AuthState) -> Router {
    Router::new()
        .route("/api/v1/connect", post(handle_connect))
        .route("/api/v1/disconnect", post(handle_disconnect))
        .route("/api/v1/status", get(handle_status))
        .route("/api/v1/stats", get(handle_stats))
        .route("/api/v1/events", get(handle_events_sse))
        .with_state(state)
        .layer(middleware::from_fn_with_state(auth, auth_middleware))
        .layer(TraceLayer::new_for_http())
}

/// POST /api/v1/connect - Start a session, replacing any active one
pub async fn handle_connect(
    State(state): State<AppState>,
    Json(request): Json<ConnectRequest>,
) -> Result<Json<ConnectResponse>, ApiError> {
    let config = SessionConfig::parse(&request.config)?;
    state.supervisor.connect(config).await?;
    Ok(Json(ConnectResponse { connected: true }))
}

/// POST /api/v1/disconnect - Stop the active session
pub async fn handle_disconnect(State(state): State<AppState>) -> Json<DisconnectResponse> {
    let disconnected = state.supervisor.disconnect().await;
    Json(DisconnectResponse { disconnected })
}

/// GET /api/v1/status - Current connection status
pub async fn handle_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let supervisor = &state.supervisor;
    Json(StatusResponse::new(supervisor.status(), supervisor.stats()))
}

/// GET /api/v1/stats - Traffic counters of the current session
pub async fn handle_stats(
    State(state): State<AppState>,
) -> Result<Json<crate::session::StatsSnapshot>, ApiError> {
    state
        .supervisor
        .stats()
        .map(Json)
        .ok_or_else(|| ApiError::new(NOT_CONNECTED, "Not connected"))
}

/// GET /api/v1/events - SSE stream of session lifecycle events
pub async fn handle_events_sse(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.supervisor.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| {
        result
            .ok()
            .and_then(|event| Event::default().json_data(event).ok())
            .map(Ok)
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;

    use crate::testing::{FakeConnector, FakePlatform};

    const TOKEN: &str = "test-token";

    const CONFIG: &str = "\
[Interface]
Address = 10.8.0.2/24
DNS = 8.8.8.8

[Server]
Address = 10.0.0.1
Port = 51820
Transport = datagram
Key = k
";

    fn router() -> (Router, Arc<FakePlatform>) {
        let platform = Arc::new(FakePlatform::new());
        let supervisor = Arc::new(SessionSupervisor::new(
            platform.clone(),
            Arc::new(FakeConnector::new()),
        ));
        let router = build_router(AppState { supervisor }, AuthState::new(TOKEN.to_string()));
        (router, platform)
    }

    fn get(path: &str) -> Request<Body> {
        Request::get(path)
            .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
            .body(Body::empty())
            .unwrap()
    }

    fn post_json(path: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(path)
            .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_requires_token() {
        let (router, _) = router();

        let response = router
            .clone()
            .oneshot(Request::get("/api/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .oneshot(
                Request::get("/api/v1/status")
                    .header(header::AUTHORIZATION, "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_query_token_accepted() {
        let (router, _) = router();
        let response = router
            .oneshot(
                Request::get(format!("/api/v1/status?token={}", TOKEN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_connect_status_disconnect() {
        let (router, platform) = router();

        let status = json(router.clone().oneshot(get("/api/v1/status")).await.unwrap()).await;
        assert_eq!(status["state"], "disconnected");

        let response = router
            .clone()
            .oneshot(post_json(
                "/api/v1/connect",
                serde_json::json!({ "config": CONFIG }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["connected"], true);

        let status = json(router.clone().oneshot(get("/api/v1/status")).await.unwrap()).await;
        assert_eq!(status["state"], "connected");
        assert_eq!(status["server_endpoint"], "10.0.0.1:51820");
        assert_eq!(status["vpn_ip"], "10.8.0.2/24");

        let response = router.clone().oneshot(get("/api/v1/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["tx_packets"], 0);

        let response = router
            .clone()
            .oneshot(post_json("/api/v1/disconnect", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(json(response).await["disconnected"], true);
        assert_eq!(platform.counters().devices_closed(), 1);

        // Second disconnect is a no-op
        let response = router
            .oneshot(post_json("/api/v1/disconnect", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["disconnected"], false);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_config() {
        let (router, platform) = router();

        let response = router
            .oneshot(post_json(
                "/api/v1/connect",
                serde_json::json!({ "config": "[Server]\nAddress = 10.0.0.1\n" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["code"], INVALID_CONFIG);
        assert!(platform.last_request().is_none());
    }

    #[tokio::test]
    async fn test_stats_without_session() {
        let (router, _) = router();
        let response = router.oneshot(get("/api/v1/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json(response).await["code"], NOT_CONNECTED);
    }
}
