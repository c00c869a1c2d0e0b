//! Error types surfaced by the cluster coordinator, the ingestion worker and
//! the record store.

use skein_raft::{NodeId, RaftError, ServerAddress};
use thiserror::Error;

/// Membership and leadership failures returned by [`crate::coordinator::ClusterCoordinator`].
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Joining node's id or address is already in the configuration.
    #[error("Duplicate member: {id} at {addr}")]
    DuplicateMember { id: NodeId, addr: ServerAddress },

    /// Operation must run on the leader.
    #[error("Not leader (current leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    /// Commit did not complete within the configured bound.
    #[error("Timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// No quorum contact; the answer could be stale.
    #[error("Unavailable: {reason}")]
    Unavailable { reason: String },

    /// Coordinator already closed.
    #[error("Coordinator closed")]
    Closed,

    #[error("Consensus engine error: {0}")]
    Engine(RaftError),
}

impl ClusterError {
    /// Short machine-readable name used in control-plane error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterError::DuplicateMember { .. } => "duplicate_member",
            ClusterError::NotLeader { .. } => "not_leader",
            ClusterError::Timeout { .. } => "timeout",
            ClusterError::Unavailable { .. } => "unavailable",
            ClusterError::Closed | ClusterError::Engine(_) => "internal",
        }
    }

    pub fn leader(&self) -> Option<&NodeId> {
        match self {
            ClusterError::NotLeader { leader } => leader.as_ref(),
            _ => None,
        }
    }
}

impl From<RaftError> for ClusterError {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::AlreadyMember { id, addr } => ClusterError::DuplicateMember { id, addr },
            RaftError::NotLeader { leader } => ClusterError::NotLeader { leader },
            RaftError::Timeout { elapsed_ms } => ClusterError::Timeout { elapsed_ms },
            RaftError::Unavailable { reason } => ClusterError::Unavailable { reason },
            RaftError::Shutdown => ClusterError::Closed,
            other => ClusterError::Engine(other),
        }
    }
}

/// Record store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Ingestion failures.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Failed to connect to stream {url}: {reason}")]
    StreamConnect { url: String, reason: String },

    #[error("Stream read failed: {0}")]
    StreamRead(String),

    /// Record exhausted its persistence retries.
    #[error("Persist failure for {source_id}#{sequence} after {attempts} attempts: {reason}")]
    PersistFailure {
        source_id: String,
        sequence: u64,
        attempts: u32,
        reason: String,
    },

    /// Submission rejected because this node stopped leading.
    #[error("Leadership lost (current leader: {leader:?})")]
    LeadershipLost { leader: Option<NodeId> },

    #[error("Command encoding failed: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Proposal failed: {0}")]
    Propose(RaftError),
}

impl From<RaftError> for IngestError {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::NotLeader { leader } => IngestError::LeadershipLost { leader },
            RaftError::Shutdown => IngestError::LeadershipLost { leader: None },
            other => IngestError::Propose(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_error_mapping() {
        let err: ClusterError = RaftError::AlreadyMember {
            id: NodeId::new("2"),
            addr: ServerAddress::new("h2:9125"),
        }
        .into();
        assert_eq!(err.kind(), "duplicate_member");

        let err: ClusterError = RaftError::NotLeader {
            leader: Some(NodeId::new("1")),
        }
        .into();
        assert_eq!(err.kind(), "not_leader");
        assert_eq!(err.leader(), Some(&NodeId::new("1")));

        let err: ClusterError = RaftError::Internal {
            reason: "bug".to_string(),
        }
        .into();
        assert_eq!(err.kind(), "internal");

        let err: ClusterError = RaftError::Shutdown.into();
        assert!(matches!(err, ClusterError::Closed));
        assert_eq!(err.kind(), "internal");
    }

    #[test]
    fn test_ingest_error_mapping() {
        let err: IngestError = RaftError::NotLeader { leader: None }.into();
        assert!(matches!(err, IngestError::LeadershipLost { leader: None }));

        let err: IngestError = RaftError::Timeout { elapsed_ms: 5 }.into();
        assert!(matches!(err, IngestError::Propose(_)));
    }
}
