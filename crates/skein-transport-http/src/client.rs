//! Raft transport client over HTTP.

use crate::{APPEND_PATH, CONTENT_TYPE_BINCODE, SNAPSHOT_PATH, VOTE_PATH};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use skein_raft::error::{RaftError, Result};
use skein_raft::transport::RaftTransport;
use skein_raft::types::*;
use std::collections::HashMap;
use std::time::Duration;

/// HTTP-based Raft transport.
///
/// Resolves NodeIds through an address book that the engine refreshes on
/// every configuration change, so peers added by a join become reachable
/// without restarting.
pub struct HttpTransport {
    client: reqwest::Client,

    /// Peer addresses: NodeId -> "host:port"
    peers: RwLock<HashMap<NodeId, ServerAddress>>,
}

impl HttpTransport {
    /// Create a transport whose requests give up after `request_timeout`.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| RaftError::Transport {
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            peers: RwLock::new(HashMap::new()),
        })
    }

    /// Register or replace one peer address.
    pub fn set_peer(&self, id: NodeId, addr: ServerAddress) {
        self.peers.write().insert(id, addr);
    }

    pub fn peer_address(&self, id: &NodeId) -> Option<ServerAddress> {
        self.peers.read().get(id).cloned()
    }

    async fn post<Req, Resp>(&self, target: &NodeId, path: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let addr = self.peer_address(target).ok_or_else(|| RaftError::Transport {
            reason: format!("unknown peer: {}", target),
        })?;
        let url = format!("http://{}{}", addr, path);
        let body = bincode::serialize(request)?;

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE_BINCODE)
            .body(body)
            .send()
            .await
            .map_err(|e| RaftError::Transport {
                reason: format!("{} to {} failed: {}", path, target, e),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RaftError::Transport {
                reason: format!("{} to {} returned {}", path, target, status),
            });
        }

        let bytes = response.bytes().await.map_err(|e| RaftError::Transport {
            reason: format!("reading {} response from {}: {}", path, target, e),
        })?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

#[async_trait::async_trait]
impl RaftTransport for HttpTransport {
    async fn request_vote(
        &self,
        target: &NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.post(target, VOTE_PATH, &request).await
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.post(target, APPEND_PATH, &request).await
    }

    async fn install_snapshot(
        &self,
        target: &NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        tracing::debug!(
            target = %target,
            index = %request.metadata.last_included_index,
            bytes = request.data.len(),
            "Sending InstallSnapshot over HTTP"
        );
        self.post(target, SNAPSHOT_PATH, &request).await
    }

    fn update_peers(&self, configuration: &ClusterConfiguration) {
        let mut peers = self.peers.write();
        for member in configuration.members() {
            peers.insert(member.id.clone(), member.addr.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_peers_learns_addresses() {
        let transport = HttpTransport::new(Duration::from_millis(100)).unwrap();
        assert!(transport.peer_address(&NodeId::new("n2")).is_none());

        let configuration = ClusterConfiguration::single(NodeId::new("n1"), ServerAddress::new("h1:9125"))
            .with_member(Member::new(NodeId::new("n2"), ServerAddress::new("h2:9125")))
            .unwrap();
        transport.update_peers(&configuration);

        assert_eq!(
            transport.peer_address(&NodeId::new("n2")),
            Some(ServerAddress::new("h2:9125"))
        );
    }

    #[tokio::test]
    async fn test_unknown_peer_is_transport_error() {
        let transport = HttpTransport::new(Duration::from_millis(100)).unwrap();
        let request = RequestVoteRequest {
            term: Term(1),
            candidate_id: NodeId::new("n1"),
            last_log_index: LogIndex::ZERO,
            last_log_term: Term::ZERO,
        };
        assert!(matches!(
            transport.request_vote(&NodeId::new("nobody"), request).await,
            Err(RaftError::Transport { .. })
        ));
    }
}
