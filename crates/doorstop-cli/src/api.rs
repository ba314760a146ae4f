//! HTTP control endpoint.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use doorstop_core::TraversalService;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    /// Traversal service being controlled
    pub service: Arc<TraversalService>,
    /// Signals a shutdown request
    pub quit: mpsc::Sender<()>,
}

/// Current endpoint as reported to clients
#[derive(Debug, Serialize)]
pub struct EndpointInfo {
    status: &'static str,
    protocol: String,
    host: String,
    port: u16,
}

impl EndpointInfo {
    fn current(service: &TraversalService) -> Self {
        let endpoint = service.endpoint();
        Self {
            status: "ok",
            protocol: endpoint
                .as_ref()
                .map(|e| e.protocol.clone())
                .unwrap_or_default(),
            host: endpoint.as_ref().map(|e| e.host.clone()).unwrap_or_default(),
            port: endpoint.map(|e| e.port).unwrap_or_default(),
        }
    }
}

/// Failed control request
pub struct ApiError(doorstop_core::Error);

impl From<doorstop_core::Error> for ApiError {
    fn from(err: doorstop_core::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        tracing::error!("{}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "status": "error", "error": self.0.to_string() })),
        )
            .into_response()
    }
}

/// Build the control router
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/exposed", get(exposed).put(reexpose))
        .route("/quit", get(quit).post(quit))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn exposed(State(state): State<ApiState>) -> Json<EndpointInfo> {
    Json(EndpointInfo::current(&state.service))
}

async fn reexpose(State(state): State<ApiState>) -> Result<Json<EndpointInfo>, ApiError> {
    tracing::info!("Re-exposing on request");
    state.service.start().await?;
    Ok(Json(EndpointInfo::current(&state.service)))
}

async fn quit(State(state): State<ApiState>) -> &'static str {
    tracing::debug!("QUIT");
    // A pending request already triggers shutdown
    let _ = state.quit.try_send(());
    "QUIT"
}
