//! Local status surface
//!
//! - `GET /status`: session, channel and device status
//! - `POST /reconnect`: manual connect with retry
//! - `POST /disconnect`: stop the channel and forget the session
//!
//! # SECURITY
//! Binds to loopback only: the status body reveals whether a token is loaded.

use anyhow::{bail, Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use stationlink_core::transport::Transport;
use stationlink_core::{
    ChannelStatus, ConnectOutcome, ConnectionSupervisor, CoreError, DeviceStatus, PrinterCapability,
    ScannerCapability, SessionProvider, SessionStore,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// State shared across handlers
pub struct AppState<T: Transport> {
    supervisor: ConnectionSupervisor<T>,
    sessions: Arc<SessionStore>,
    printer: Arc<dyn PrinterCapability>,
    scanner: Option<Arc<dyn ScannerCapability>>,
}

impl<T: Transport> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            supervisor: self.supervisor.clone(),
            sessions: self.sessions.clone(),
            printer: self.printer.clone(),
            scanner: self.scanner.clone(),
        }
    }
}

impl<T: Transport> AppState<T> {
    pub fn new(
        supervisor: ConnectionSupervisor<T>,
        sessions: Arc<SessionStore>,
        printer: Arc<dyn PrinterCapability>,
        scanner: Option<Arc<dyn ScannerCapability>>,
    ) -> Self {
        Self {
            supervisor,
            sessions,
            printer,
            scanner,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub authenticated: bool,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub server_url: Option<String>,
    /// `present` or `missing`; the token itself is never returned
    pub auth_token: &'static str,
    pub connected: bool,
    pub joined: bool,
    pub auto_retry_active: bool,
    pub channel: ChannelStatus,
    pub printer: DeviceStatus,
    pub scanner: DeviceStatus,
}

#[derive(Debug, Serialize)]
struct ActionResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    websocket_connected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ActionResponse {
    fn failure(status: StatusCode, error: impl Into<String>) -> Response {
        let body = Self {
            success: false,
            message: None,
            websocket_connected: None,
            warning: None,
            error: Some(error.into()),
        };
        (status, Json(body)).into_response()
    }
}

async fn status<T: Transport>(State(state): State<AppState<T>>) -> Json<StatusResponse> {
    let session = state.sessions.current();
    let channel = state.supervisor.status().await;

    Json(StatusResponse {
        authenticated: state.sessions.has_credentials(),
        device_id: session.as_ref().map(|s| s.device_id.clone()),
        device_name: session.as_ref().and_then(|s| s.device_name.clone()),
        server_url: session.as_ref().map(|s| s.server_url.clone()),
        auth_token: match &session {
            Some(s) if !s.auth_token.is_empty() => "present",
            _ => "missing",
        },
        connected: channel.connected,
        joined: channel.joined,
        auto_retry_active: channel.auto_retry_active,
        channel,
        printer: state.printer.status(),
        scanner: state
            .scanner
            .as_ref()
            .map(|s| s.status())
            .unwrap_or_else(DeviceStatus::not_initialized),
    })
}

async fn reconnect<T: Transport>(State(state): State<AppState<T>>) -> Response {
    if !state.sessions.has_credentials() {
        return ActionResponse::failure(StatusCode::BAD_REQUEST, "Not authenticated");
    }

    info!("Manual reconnect requested");
    match state.supervisor.connect_with_retry().await {
        Ok(outcome) => {
            let connected = outcome == ConnectOutcome::Connected;
            let body = ActionResponse {
                success: connected,
                message: Some(match outcome {
                    ConnectOutcome::Connected => "WebSocket reconnected successfully".to_string(),
                    ConnectOutcome::RetryingInBackground => {
                        "WebSocket reconnection failed - automatic retry active".to_string()
                    }
                    ConnectOutcome::Cancelled => "Reconnect cancelled".to_string(),
                }),
                websocket_connected: Some(connected),
                warning: (outcome == ConnectOutcome::RetryingInBackground)
                    .then(|| "WebSocket connection failed - will retry automatically".to_string()),
                error: None,
            };
            Json(body).into_response()
        }
        Err(CoreError::MissingCredentials) => ActionResponse::failure(StatusCode::BAD_REQUEST, "Not authenticated"),
        Err(e) => {
            warn!("Manual reconnect failed: {}", e);
            ActionResponse::failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn disconnect<T: Transport>(State(state): State<AppState<T>>) -> Json<ActionResponse> {
    state.supervisor.disconnect().await;
    state.sessions.clear();
    info!("Disconnected and cleared session");

    Json(ActionResponse {
        success: true,
        message: Some("Disconnected successfully".to_string()),
        websocket_connected: Some(false),
        warning: None,
        error: None,
    })
}

/// Build the router
pub fn router<T: Transport>(state: AppState<T>) -> Router {
    Router::new()
        .route("/status", get(status::<T>))
        .route("/reconnect", post(reconnect::<T>))
        .route("/disconnect", post(disconnect::<T>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the status surface and serve it in the background
///
/// # Returns
/// * `(SocketAddr, JoinHandle)` - bound address and the server task
pub async fn start<T: Transport>(bind: SocketAddr, state: AppState<T>) -> Result<(SocketAddr, JoinHandle<()>)> {
    if !bind.ip().is_loopback() {
        bail!("Status surface must bind to loopback, got {}", bind);
    }

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind status surface on {}", bind))?;
    let addr = listener.local_addr().context("Failed to read bound address")?;
    let app = router(state);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Status server error: {}", e);
        }
    });

    info!("Status surface listening on http://{}", addr);
    Ok((addr, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use stationlink_core::transport::{MockBehavior, MockTransport};
    use stationlink_core::{ChannelConfig, MockPrinter, RetryConfig, Session};
    use tower::ServiceExt;

    fn state(transport: &MockTransport, sessions: Arc<SessionStore>) -> AppState<MockTransport> {
        let (supervisor, _inbound) = ConnectionSupervisor::new(
            transport.clone(),
            sessions.clone(),
            RetryConfig::default(),
            ChannelConfig::default(),
        );
        AppState::new(supervisor, sessions, Arc::new(MockPrinter::new()), None)
    }

    fn session() -> Session {
        Session::new("tok", "3", Some("Bar".into()), "http://localhost:4001")
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_status_without_session() {
        let transport = MockTransport::new(MockBehavior::Accept);
        let app = router(state(&transport, Arc::new(SessionStore::new())));

        let (code, body) = call(app, "GET", "/status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["authenticated"], false);
        assert_eq!(body["auth_token"], "missing");
        assert_eq!(body["connected"], false);
        assert_eq!(body["channel"]["state"], "idle");
        assert_eq!(body["printer"]["status"], "mock_mode");
        assert_eq!(body["scanner"]["status"], "not_initialized");
    }

    #[tokio::test]
    async fn test_reconnect_requires_session() {
        let transport = MockTransport::new(MockBehavior::Accept);
        let app = router(state(&transport, Arc::new(SessionStore::new())));

        let (code, body) = call(app, "POST", "/reconnect").await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Not authenticated");
        assert_eq!(transport.opens(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_then_status() {
        let transport = MockTransport::new(MockBehavior::Accept);
        let app = router(state(&transport, Arc::new(SessionStore::with_session(session()))));

        let (code, body) = call(app.clone(), "POST", "/reconnect").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["websocket_connected"], true);

        let (_, body) = call(app, "GET", "/status").await;
        assert_eq!(body["joined"], true);
        assert_eq!(body["device_id"], "3");
        assert_eq!(body["auth_token"], "present");
        assert_eq!(body["channel"]["connection"], "joined");
    }

    #[tokio::test]
    async fn test_reconnect_join_rejected() {
        let transport = MockTransport::new(MockBehavior::RejectJoin);
        let app = router(state(&transport, Arc::new(SessionStore::with_session(session()))));

        let (code, body) = call(app, "POST", "/reconnect").await;
        assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().starts_with("Channel join failed"));
    }

    #[tokio::test]
    async fn test_disconnect_clears_session() {
        let transport = MockTransport::new(MockBehavior::Accept);
        let sessions = Arc::new(SessionStore::with_session(session()));
        let app = router(state(&transport, sessions.clone()));

        call(app.clone(), "POST", "/reconnect").await;
        let (code, body) = call(app.clone(), "POST", "/disconnect").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert!(sessions.current().is_none());

        let (_, body) = call(app, "GET", "/status").await;
        assert_eq!(body["authenticated"], false);
        assert_eq!(body["joined"], false);
    }

    #[tokio::test]
    async fn test_start_rejects_public_bind() {
        let transport = MockTransport::new(MockBehavior::Accept);
        let bind: SocketAddr = "0.0.0.0:0".parse().unwrap();
        assert!(start(bind, state(&transport, Arc::new(SessionStore::new()))).await.is_err());
    }
}
