//! Raft RPC server (server-side of the HTTP transport).
//!
//! Decodes bincode requests and forwards them to the local engine through
//! its RPC channel. Network I/O stays decoupled from Raft logic.

use crate::{APPEND_PATH, CONTENT_TYPE_BINCODE, SNAPSHOT_PATH, VOTE_PATH};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use skein_raft::transport::{dispatch, RpcMessage, RpcSender};
use std::net::SocketAddr;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Snapshots travel in one request body.
const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

/// Routes for the three Raft RPCs, forwarding into `rpc_tx`.
pub fn router(rpc_tx: RpcSender) -> Router {
    Router::new()
        .route(VOTE_PATH, post(vote_handler))
        .route(APPEND_PATH, post(append_handler))
        .route(SNAPSHOT_PATH, post(snapshot_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(rpc_tx)
}

/// HTTP server hosting the Raft RPC routes.
pub struct RaftRpcServer {
    addr: SocketAddr,
    rpc_tx: RpcSender,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server_handle: Option<JoinHandle<Result<(), std::io::Error>>>,
}

impl RaftRpcServer {
    pub fn new(addr: SocketAddr, rpc_tx: RpcSender) -> Self {
        Self {
            addr,
            rpc_tx,
            local_addr: None,
            shutdown_tx: None,
            server_handle: None,
        }
    }

    /// Bind and start serving in a background task.
    ///
    /// Failing to bind is fatal for the node, so it is reported here rather
    /// than from the background task.
    pub async fn start(&mut self) -> Result<SocketAddr, RaftServerError> {
        tracing::info!("Starting Raft RPC server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| RaftServerError::Bind {
                addr: self.addr,
                source: e,
            })?;
        let local_addr = listener.local_addr().map_err(|e| RaftServerError::Bind {
            addr: self.addr,
            source: e,
        })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        let app = router(self.rpc_tx.clone());
        self.server_handle = Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
        }));
        self.local_addr = Some(local_addr);

        tracing::info!(addr = %local_addr, "Raft RPC server started");
        Ok(local_addr)
    }

    /// Address actually bound (differs from the configured one for port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Shutdown the server gracefully.
    pub async fn shutdown(mut self) -> Result<(), RaftServerError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e| RaftServerError::Shutdown(format!("Join error: {}", e)))?
                .map_err(|e| RaftServerError::Shutdown(format!("Server error: {}", e)))?;
        }

        tracing::info!("Raft RPC server shutdown complete");
        Ok(())
    }
}

async fn vote_handler(State(rpc_tx): State<RpcSender>, body: Bytes) -> Response {
    forward(&rpc_tx, &body, |request, response_tx| RpcMessage::RequestVote {
        request,
        response_tx,
    })
    .await
}

async fn append_handler(State(rpc_tx): State<RpcSender>, body: Bytes) -> Response {
    forward(&rpc_tx, &body, |request, response_tx| RpcMessage::AppendEntries {
        request,
        response_tx,
    })
    .await
}

async fn snapshot_handler(State(rpc_tx): State<RpcSender>, body: Bytes) -> Response {
    forward(&rpc_tx, &body, |request, response_tx| RpcMessage::InstallSnapshot {
        request,
        response_tx,
    })
    .await
}

/// Decode, hand to the engine, encode the reply.
async fn forward<Req, Resp>(
    rpc_tx: &RpcSender,
    body: &[u8],
    build: impl FnOnce(Req, oneshot::Sender<Resp>) -> RpcMessage,
) -> Response
where
    Req: DeserializeOwned,
    Resp: Serialize,
{
    let request: Req = match bincode::deserialize(body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed Raft RPC body");
            return (StatusCode::BAD_REQUEST, format!("malformed body: {}", e)).into_response();
        }
    };

    let response = match dispatch(rpc_tx, |response_tx| build(request, response_tx)).await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(error = %e, "Raft core did not answer RPC");
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };

    match bincode::serialize(&response) {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, CONTENT_TYPE_BINCODE)],
            bytes,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode Raft RPC response");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Raft RPC server errors.
#[derive(Debug, thiserror::Error)]
pub enum RaftServerError {
    #[error("Failed to bind Raft transport on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Shutdown error: {0}")]
    Shutdown(String),
}
