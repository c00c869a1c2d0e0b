//! Control-plane HTTP server.
//!
//! Provides:
//! - POST /join - add a voter (leader only)
//! - GET /last - current cluster size
//! - GET /status - leadership, members, worker state, watermarks
//! - GET /health - liveness
//! - GET /metrics - Prometheus metrics

use crate::coordinator::{ClusterCoordinator, ClusterStatus};
use crate::error::ClusterError;
use crate::ingest::IngestionWorkerState;
use crate::metrics::PrometheusMeter;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use skein_raft::{NodeId, ServerAddress};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Body of `POST /join`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub addr: String,
    #[serde(rename = "nodeId")]
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastResponse {
    pub last: String,
}

#[derive(Debug, Clone, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    cluster: ClusterStatus,
    worker: Option<&'static str>,
}

/// HTTP server state.
#[derive(Clone)]
pub struct ControlPlaneState {
    coordinator: Arc<ClusterCoordinator>,
    meter: Arc<PrometheusMeter>,
    worker_state: Option<watch::Receiver<IngestionWorkerState>>,
}

impl ControlPlaneState {
    pub fn new(
        coordinator: Arc<ClusterCoordinator>,
        meter: Arc<PrometheusMeter>,
        worker_state: Option<watch::Receiver<IngestionWorkerState>>,
    ) -> Self {
        Self {
            coordinator,
            meter,
            worker_state,
        }
    }
}

pub fn router(state: ControlPlaneState) -> Router {
    Router::new()
        .route("/join", post(join_handler))
        .route("/last", get(last_handler))
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

pub struct ControlPlaneServer {
    addr: SocketAddr,
    state: ControlPlaneState,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    server_handle: Option<JoinHandle<Result<(), std::io::Error>>>,
}

impl ControlPlaneServer {
    pub fn new(addr: SocketAddr, state: ControlPlaneState) -> Self {
        Self {
            addr,
            state,
            local_addr: None,
            shutdown_tx: None,
            server_handle: None,
        }
    }

    /// Bind and start serving. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr, HttpServerError> {
        tracing::info!("Starting control plane on {}", self.addr);

        let app = router(self.state.clone());

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| HttpServerError::Startup(format!("Failed to bind {}: {}", self.addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| HttpServerError::Startup(format!("No local address: {}", e)))?;
        self.local_addr = Some(local_addr);

        let server_handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
        });
        self.server_handle = Some(server_handle);

        tracing::info!(addr = %local_addr, "Control plane started");
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Shutdown the server gracefully.
    pub async fn shutdown(mut self) -> Result<(), HttpServerError> {
        tracing::info!("Shutting down control plane");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e| HttpServerError::Shutdown(format!("Join error: {}", e)))?
                .map_err(|e| HttpServerError::Shutdown(format!("Server error: {}", e)))?;
        }

        tracing::info!("Control plane shutdown complete");
        Ok(())
    }
}

/// POST /join
///
/// The body is parsed as JSON whatever the declared content type.
async fn join_handler(State(state): State<ControlPlaneState>, body: Bytes) -> Response {
    let request: JoinRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(error = %e, "Malformed join request");
            return (StatusCode::BAD_REQUEST, format!("malformed join request: {}", e))
                .into_response();
        }
    };
    if request.addr.trim().is_empty() || request.node_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "addr and nodeId must be non-empty").into_response();
    }

    tracing::info!(node = %request.node_id, addr = %request.addr, "Join request");
    match state
        .coordinator
        .join(ServerAddress::new(request.addr), NodeId::new(request.node_id))
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => ClusterErrorResponse(e).into_response(),
    }
}

/// GET /last
///
/// Reports the number of members in the committed configuration.
async fn last_handler(
    State(state): State<ControlPlaneState>,
) -> Result<Json<LastResponse>, ClusterErrorResponse> {
    let size = state.coordinator.current_size().await?;
    Ok(Json(LastResponse {
        last: size.to_string(),
    }))
}

async fn status_handler(State(state): State<ControlPlaneState>) -> Json<StatusResponse> {
    let cluster = state.coordinator.status().await;
    let worker = state.worker_state.as_ref().map(|rx| rx.borrow().as_str());
    Json(StatusResponse { cluster, worker })
}

async fn health_handler() -> Response {
    (StatusCode::OK, "OK").into_response()
}

/// GET /metrics
async fn metrics_handler(State(state): State<ControlPlaneState>) -> Result<Response, AppError> {
    let metrics = state.meter.export()?;

    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics,
    )
        .into_response())
}

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    #[error("Startup error: {0}")]
    Startup(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

/// Membership failure rendered as `500 {"error", "message", "leader"?}`.
struct ClusterErrorResponse(ClusterError);

impl From<ClusterError> for ClusterErrorResponse {
    fn from(err: ClusterError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ClusterErrorResponse {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        });
        if let Some(leader) = self.0.leader() {
            body["leader"] = serde_json::Value::String(leader.to_string());
        }
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

/// Application error wrapper for handlers.
struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!("Handler error: {:?}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal error: {}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_request_wire_names() {
        let request: JoinRequest =
            serde_json::from_str(r#"{"addr":"host2:9125","nodeId":"2"}"#).unwrap();
        assert_eq!(request.addr, "host2:9125");
        assert_eq!(request.node_id, "2");

        assert!(serde_json::from_str::<JoinRequest>(r#"{"addr":"host2:9125"}"#).is_err());
    }

    #[test]
    fn test_error_body() {
        let response = ClusterErrorResponse(ClusterError::NotLeader {
            leader: Some(NodeId::new("1")),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_last_body_shape() {
        let body = serde_json::to_string(&LastResponse {
            last: 1.to_string(),
        })
        .unwrap();
        assert_eq!(body, r#"{"last":"1"}"#);
    }
}
