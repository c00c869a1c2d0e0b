//! skein node library.
//!
//! Exposes the node components for the binary and for tests.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod ingest;
pub mod join;
pub mod metrics;
pub mod node;
pub mod record;
pub mod source;
pub mod state_machine;
pub mod store;
