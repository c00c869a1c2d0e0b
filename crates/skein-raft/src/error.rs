//! Raft error types.

use thiserror::Error;

use crate::types::{LogIndex, NodeId, ServerAddress};

/// Raft errors.
#[derive(Error, Debug)]
pub enum RaftError {
    /// Not the leader (cannot propose or change membership).
    #[error("Not leader (current leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    /// Membership change names an id or address already in the configuration.
    #[error("Already a member: {id} at {addr}")]
    AlreadyMember { id: NodeId, addr: ServerAddress },

    /// Entry was not committed (or applied) within the configured bound.
    #[error("Timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// Freshness of local state cannot be confirmed (no quorum contact).
    #[error("Unavailable: {reason}")]
    Unavailable { reason: String },

    /// `bootstrap` called on a data directory that already holds state.
    #[error("Already bootstrapped (last log index {last_index})")]
    AlreadyBootstrapped { last_index: LogIndex },

    /// Durable log failed its integrity check.
    #[error("Log corrupted at byte offset {offset}: {reason}")]
    Corrupted { offset: u64, reason: String },

    /// Snapshot creation or install failed.
    #[error("Snapshot failed: {reason}")]
    SnapshotFailed { reason: String },

    /// Configuration error (invalid Raft config).
    #[error("Configuration error: {reason}")]
    ConfigError { reason: String },

    /// Transport failure talking to a peer.
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// Engine is shutting down or already shut down.
    #[error("Engine shut down")]
    Shutdown,

    /// I/O error (log, hard state, snapshot files).
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Serialization error.
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: bincode::Error,
    },

    /// Internal error (bug).
    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

/// Raft result type.
pub type Result<T> = std::result::Result<T, RaftError>;
