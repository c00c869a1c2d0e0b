//! Join client used by a fresh node to enter an existing cluster.

use crate::http::JoinRequest;
use skein_raft::{ConsensusEngine, NodeId};
use std::time::Duration;
use thiserror::Error;

const UNAVAILABLE_RECHECK: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("Join request to {target} failed: {reason}")]
    Request { target: String, reason: String },

    #[error("Join rejected by {target} (status {status}): {body}")]
    Rejected {
        target: String,
        status: u16,
        body: String,
    },

    #[error("Not admitted to the cluster within {0:?}")]
    NotAdmitted(Duration),
}

pub struct JoinClient {
    client: reqwest::Client,
}

impl JoinClient {
    pub fn new(request_timeout: Duration) -> Result<Self, JoinError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| JoinError::Request {
                target: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }

    /// POST `{"addr", "nodeId"}` to `target`'s control plane.
    pub async fn request_join(
        &self,
        target: &str,
        node_id: &str,
        raft_addr: &str,
    ) -> Result<(), JoinError> {
        let url = if target.starts_with("http://") || target.starts_with("https://") {
            format!("{}/join", target.trim_end_matches('/'))
        } else {
            format!("http://{}/join", target)
        };

        tracing::info!(url = %url, node = %node_id, addr = %raft_addr, "Requesting to join cluster");

        let response = self
            .client
            .post(&url)
            .json(&JoinRequest {
                addr: raft_addr.to_string(),
                node_id: node_id.to_string(),
            })
            .send()
            .await
            .map_err(|e| JoinError::Request {
                target: target.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(JoinError::Rejected {
            target: target.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

/// Wait until the local engine's configuration lists `node_id`.
///
/// Re-checks whenever the commit index or leadership moves. While the local
/// view is unavailable (no leader contact yet) it also re-checks on a short
/// tick, since contact alone does not move either watch.
pub async fn wait_for_membership(
    engine: &dyn ConsensusEngine,
    node_id: &NodeId,
    timeout: Duration,
) -> Result<(), JoinError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut commits = engine.commit_index();
    let mut leadership = engine.leadership();

    loop {
        let stale = match engine.current_configuration().await {
            Ok(config) if config.contains_id(node_id) => {
                tracing::info!(node = %node_id, members = config.len(), "Admitted to cluster");
                return Ok(());
            }
            Ok(_) => false,
            Err(e) => {
                tracing::trace!(error = %e, "Configuration not yet available");
                true
            }
        };

        let woke = tokio::time::timeout_at(deadline, async {
            tokio::select! {
                changed = commits.changed() => changed.is_ok(),
                changed = leadership.changed() => changed.is_ok(),
                _ = tokio::time::sleep(UNAVAILABLE_RECHECK), if stale => true,
            }
        })
        .await;

        match woke {
            Ok(true) => {}
            // Engine dropped its watches: it is shutting down.
            Ok(false) | Err(_) => return Err(JoinError::NotAdmitted(timeout)),
        }
    }
}
