//! skein-raft: Raft consensus for cluster coordination.
//!
//! - Leader election with randomized timeouts
//! - Log replication with conflict-hint backtracking
//! - Leader leases and check-quorum step-down
//! - Single-server membership changes (add one voter at a time)
//! - Snapshots, log compaction and InstallSnapshot
//! - Leadership changes published on a `watch` channel
//!
//! Based on the Raft paper (Ongaro & Ousterhout, 2014) and the
//! single-server change protocol from Ongaro's thesis.

pub mod config;
pub mod election;
pub mod error;
pub mod hard_state;
pub mod lease;
pub mod log;
pub mod raft;
pub mod replication;
pub mod rpc_handler;
pub mod snapshot;
pub mod state;
pub mod timer;
pub mod transport;
pub mod types;

pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use raft::Raft;
pub use snapshot::StateMachine;
pub use transport::{InMemoryTransport, RaftTransport, RpcMessage, RpcReceiver, RpcSender};
pub use types::*;

/// Consensus engine contract the cluster layer is written against.
///
/// Implemented by [`Raft`]. Errors surface as [`RaftError`]: `NotLeader`,
/// `AlreadyMember`, `Timeout`, `Unavailable`.
#[async_trait::async_trait]
pub trait ConsensusEngine: Send + Sync {
    fn node_id(&self) -> NodeId;

    /// Initialize a brand-new single-member cluster containing only this node.
    ///
    /// Fails with `AlreadyBootstrapped` if any Raft state already exists.
    async fn bootstrap(&self, self_id: NodeId, self_addr: ServerAddress) -> Result<()>;

    /// True if the data directory holds Raft state from an earlier run.
    async fn has_existing_state(&self) -> bool;

    fn is_leader(&self) -> bool;

    /// Receiver that observes every leadership transition, including
    /// transitions that happened before the receiver was created.
    fn leadership(&self) -> tokio::sync::watch::Receiver<Leadership>;

    /// Receiver for the local commit index.
    fn commit_index(&self) -> tokio::sync::watch::Receiver<LogIndex>;

    /// Add a voting member. Leader only; returns once the new configuration
    /// is committed.
    async fn add_voter(&self, id: NodeId, addr: ServerAddress) -> Result<()>;

    /// Committed cluster configuration.
    ///
    /// Fails with `Unavailable` when the local view may be stale.
    async fn current_configuration(&self) -> Result<ClusterConfiguration>;

    /// Replicate an opaque command; resolves once committed and applied.
    async fn propose(&self, command: bytes::Bytes) -> Result<LogIndex>;

    async fn shutdown(&self) -> Result<()>;
}
