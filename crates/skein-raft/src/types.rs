//! Core Raft types: terms, indexes, members, log entries, RPC messages.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Raft term number (monotonically increasing).
///
/// Terms establish logical clocks in Raft. Each term has at most one leader.
/// When a server starts an election, it increments its term.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Log index (1-indexed, 0 is sentinel for "no entry").
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    pub fn prev(self) -> Option<LogIndex> {
        if self.0 > 0 {
            Some(LogIndex(self.0 - 1))
        } else {
            None
        }
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// Node identifier, assigned by the operator and stable for the node's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of a node's consensus transport (`host:port`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerAddress(pub String);

impl ServerAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        ServerAddress(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A voting member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub addr: ServerAddress,
}

impl Member {
    pub fn new(id: NodeId, addr: ServerAddress) -> Self {
        Self { id, addr }
    }
}

/// Ordered set of voting members.
///
/// No two members share a NodeId or a ServerAddress. Replicated through the
/// log as an [`EntryPayload::Membership`] entry; a node uses the latest one
/// in its log as soon as it is appended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    members: Vec<Member>,
}

impl ClusterConfiguration {
    /// Empty configuration (a node that has neither bootstrapped nor joined).
    pub fn empty() -> Self {
        Self::default()
    }

    /// One-member configuration used at bootstrap.
    pub fn single(id: NodeId, addr: ServerAddress) -> Self {
        Self {
            members: vec![Member::new(id, addr)],
        }
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains_id(&self, id: &NodeId) -> bool {
        self.members.iter().any(|m| &m.id == id)
    }

    pub fn contains_addr(&self, addr: &ServerAddress) -> bool {
        self.members.iter().any(|m| &m.addr == addr)
    }

    pub fn address_of(&self, id: &NodeId) -> Option<&ServerAddress> {
        self.members.iter().find(|m| &m.id == id).map(|m| &m.addr)
    }

    pub fn voter_ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }

    /// Returns a copy with `member` appended, or `None` if its id or address
    /// is already present.
    pub fn with_member(&self, member: Member) -> Option<Self> {
        if self.contains_id(&member.id) || self.contains_addr(&member.addr) {
            return None;
        }
        let mut members = self.members.clone();
        members.push(member);
        Some(Self { members })
    }

    /// Number of votes needed for a majority.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Check whether `votes` form a majority of this configuration.
    pub fn has_quorum(&self, votes: &HashSet<NodeId>) -> bool {
        let count = self.members.iter().filter(|m| votes.contains(&m.id)).count();
        !self.members.is_empty() && count >= self.quorum()
    }
}

/// What a log entry carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended by a new leader so earlier-term entries can commit.
    Blank,
    /// Opaque state machine command.
    Command(Bytes),
    /// New cluster configuration.
    Membership(ClusterConfiguration),
}

/// Log entry (payload + metadata).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, payload: EntryPayload) -> Self {
        Self {
            term,
            index,
            payload,
        }
    }

    pub fn configuration(&self) -> Option<&ClusterConfiguration> {
        match &self.payload {
            EntryPayload::Membership(config) => Some(config),
            _ => None,
        }
    }
}

/// RequestVote RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term
    pub term: Term,

    /// Candidate requesting vote
    pub candidate_id: NodeId,

    /// Index of candidate's last log entry
    pub last_log_index: LogIndex,

    /// Term of candidate's last log entry
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Current term, for candidate to update itself
    pub term: Term,

    /// True if candidate received vote
    pub vote_granted: bool,
}

/// AppendEntries RPC request. Empty entries list = heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,

    /// Leader's ID (so follower can redirect clients)
    pub leader_id: NodeId,

    /// Index of log entry immediately preceding new ones
    pub prev_log_index: LogIndex,

    /// Term of prev_log_index entry
    pub prev_log_term: Term,

    /// Log entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,

    /// Leader's commit index
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for leader to update itself
    pub term: Term,

    /// True if follower contained entry matching prev_log_index/term
    pub success: bool,

    /// Hint for leader to backtrack faster on conflict
    pub conflict_index: Option<LogIndex>,

    /// Follower's last log index
    pub last_log_index: LogIndex,
}

/// InstallSnapshot RPC request.
///
/// Sent by leader when a follower needs entries that were compacted away.
/// The whole snapshot travels in one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// Leader's term
    pub term: Term,

    /// Leader's ID
    pub leader_id: NodeId,

    /// Snapshot metadata (last included index/term and configuration)
    pub metadata: SnapshotMetadata,

    /// Serialized state machine
    pub data: Bytes,
}

/// InstallSnapshot RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// Current term, for leader to update itself
    pub term: Term,

    /// Bytes of state machine data installed
    pub bytes_stored: u64,
}

/// Local node's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeadershipState {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for LeadershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeadershipState::Follower => write!(f, "Follower"),
            LeadershipState::Candidate => write!(f, "Candidate"),
            LeadershipState::Leader => write!(f, "Leader"),
        }
    }
}

/// Snapshot of the local role published on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leadership {
    pub state: LeadershipState,
    pub term: Term,
    pub leader: Option<NodeId>,
}

impl Leadership {
    pub fn follower(term: Term) -> Self {
        Self {
            state: LeadershipState::Follower,
            term,
            leader: None,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state == LeadershipState::Leader
    }
}

/// Snapshot metadata (describes snapshot contents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Last log index included in snapshot
    pub last_included_index: LogIndex,

    /// Term of last_included_index
    pub last_included_term: Term,

    /// Committed configuration at snapshot time
    pub configuration: ClusterConfiguration,

    /// Snapshot data size (bytes)
    pub size_bytes: u64,

    /// Creation timestamp (Unix milliseconds)
    pub created_at_ms: u64,
}
