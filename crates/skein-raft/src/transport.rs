//! Transport abstraction for Raft RPC communication.
//!
//! `RaftTransport` is implemented by:
//! - `InMemoryTransport` (this module): tokio channels between in-process nodes
//! - `HttpTransport` (skein-transport-http): bincode over HTTP between processes
//!
//! Incoming RPCs from any transport are funnelled into one `RpcReceiver`
//! consumed by the engine's RPC handler loop.

use crate::error::{RaftError, Result};
use crate::types::*;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Transport abstraction for Raft RPC communication.
///
/// NodeId is an opaque identifier; the transport resolves it to something it
/// can reach. Implementations do not retry: the heartbeat loop re-sends on
/// its next tick.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    /// Send RequestVote RPC to a peer.
    async fn request_vote(
        &self,
        target: &NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    /// Send AppendEntries RPC (heartbeat when `entries` is empty).
    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    /// Send InstallSnapshot RPC to a peer whose next entry was compacted.
    async fn install_snapshot(
        &self,
        target: &NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;

    /// Called whenever the local configuration changes so the transport can
    /// learn the addresses of new members.
    fn update_peers(&self, _configuration: &ClusterConfiguration) {}
}

/// RPC message envelope (tagged union of all RPC types).
#[derive(Debug)]
pub enum RpcMessage {
    RequestVote {
        request: RequestVoteRequest,
        response_tx: oneshot::Sender<RequestVoteResponse>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        response_tx: oneshot::Sender<AppendEntriesResponse>,
    },
    InstallSnapshot {
        request: InstallSnapshotRequest,
        response_tx: oneshot::Sender<InstallSnapshotResponse>,
    },
}

pub type RpcSender = mpsc::Sender<RpcMessage>;
pub type RpcReceiver = mpsc::Receiver<RpcMessage>;

/// Deliver a message to a node's RPC channel and wait for its reply.
///
/// A dropped reply channel means the handler failed or the node shut down.
pub async fn dispatch<T>(
    sender: &RpcSender,
    build: impl FnOnce(oneshot::Sender<T>) -> RpcMessage,
) -> Result<T> {
    let (response_tx, response_rx) = oneshot::channel();
    sender
        .send(build(response_tx))
        .await
        .map_err(|_| RaftError::Transport {
            reason: "peer RPC channel closed".to_string(),
        })?;

    response_rx.await.map_err(|_| RaftError::Transport {
        reason: "peer dropped RPC without responding".to_string(),
    })
}

/// In-memory transport for testing (local channels, no network).
///
/// Removing a peer simulates a network partition in that direction.
///
/// # Example
///
/// ```ignore
/// let (tx2, rx2) = mpsc::channel(100);
/// let transport = InMemoryTransport::new(NodeId::new("n1"), HashMap::new());
/// transport.add_peer(NodeId::new("n2"), tx2);
/// ```
pub struct InMemoryTransport {
    local_id: NodeId,

    /// Channels to other nodes (NodeId → sender)
    peers: Arc<RwLock<HashMap<NodeId, RpcSender>>>,
}

impl InMemoryTransport {
    pub fn new(local_id: NodeId, peers: HashMap<NodeId, RpcSender>) -> Self {
        Self {
            local_id,
            peers: Arc::new(RwLock::new(peers)),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn add_peer(&self, peer_id: NodeId, sender: RpcSender) {
        self.peers.write().insert(peer_id, sender);
    }

    pub fn remove_peer(&self, peer_id: &NodeId) {
        self.peers.write().remove(peer_id);
    }

    fn get_peer(&self, peer_id: &NodeId) -> Result<RpcSender> {
        self.peers
            .read()
            .get(peer_id)
            .cloned()
            .ok_or_else(|| RaftError::Transport {
                reason: format!("peer not reachable: {}", peer_id),
            })
    }
}

#[async_trait]
impl RaftTransport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: &NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let peer = self.get_peer(target)?;
        dispatch(&peer, |response_tx| RpcMessage::RequestVote {
            request,
            response_tx,
        })
        .await
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let peer = self.get_peer(target)?;
        dispatch(&peer, |response_tx| RpcMessage::AppendEntries {
            request,
            response_tx,
        })
        .await
    }

    async fn install_snapshot(
        &self,
        target: &NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let peer = self.get_peer(target)?;
        dispatch(&peer, |response_tx| RpcMessage::InstallSnapshot {
            request,
            response_tx,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let (tx, mut rx) = mpsc::channel(8);
        let transport = InMemoryTransport::new(NodeId::new("n1"), HashMap::new());
        transport.add_peer(NodeId::new("n2"), tx);

        tokio::spawn(async move {
            if let Some(RpcMessage::RequestVote { request, response_tx }) = rx.recv().await {
                let _ = response_tx.send(RequestVoteResponse {
                    term: request.term,
                    vote_granted: true,
                });
            }
        });

        let response = transport
            .request_vote(
                &NodeId::new("n2"),
                RequestVoteRequest {
                    term: Term(3),
                    candidate_id: NodeId::new("n1"),
                    last_log_index: LogIndex::ZERO,
                    last_log_term: Term::ZERO,
                },
            )
            .await
            .unwrap();
        assert!(response.vote_granted);
        assert_eq!(response.term, Term(3));
    }

    #[tokio::test]
    async fn test_removed_peer_is_unreachable() {
        let (tx, _rx) = mpsc::channel(8);
        let transport = InMemoryTransport::new(NodeId::new("n1"), HashMap::new());
        transport.add_peer(NodeId::new("n2"), tx);
        transport.remove_peer(&NodeId::new("n2"));

        let result = transport
            .append_entries(
                &NodeId::new("n2"),
                AppendEntriesRequest {
                    term: Term(1),
                    leader_id: NodeId::new("n1"),
                    prev_log_index: LogIndex::ZERO,
                    prev_log_term: Term::ZERO,
                    entries: vec![],
                    leader_commit: LogIndex::ZERO,
                },
            )
            .await;
        assert!(matches!(result, Err(RaftError::Transport { .. })));
    }
}
