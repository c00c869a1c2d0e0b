//! HTTP transport for skein-raft.
//!
//! Raft RPCs travel as bincode bodies over plain HTTP:
//! - `POST /raft/vote` → RequestVote
//! - `POST /raft/append` → AppendEntries
//! - `POST /raft/snapshot` → InstallSnapshot
//!
//! [`HttpTransport`] is the client side (one per node, shared by all peers);
//! [`RaftRpcServer`] receives requests and forwards them into the engine's
//! RPC channel.

pub mod client;
pub mod server;

pub use client::HttpTransport;
pub use server::{router, RaftRpcServer, RaftServerError};

pub const VOTE_PATH: &str = "/raft/vote";
pub const APPEND_PATH: &str = "/raft/append";
pub const SNAPSHOT_PATH: &str = "/raft/snapshot";

pub(crate) const CONTENT_TYPE_BINCODE: &str = "application/octet-stream";
