//! Cluster coordinator.
//!
//! Binds the consensus engine to the rest of the node: membership joins,
//! cluster size, leadership notifications, and record submission for the
//! ingestion worker.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use skein_observe::{obs_count, MembershipEvt, MembershipKind, Meter, ObsEvent};
use skein_raft::{ConsensusEngine, Leadership, LogIndex, NodeId, ServerAddress};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{ClusterError, IngestError};
use crate::ingest::RecordSink;
use crate::record::{IngestCommand, IngestedRecord};
use crate::state_machine::{IngestStateMachine, PersistFailureRecord};

#[derive(Debug, Clone, Serialize)]
pub struct MemberStatus {
    pub id: String,
    pub addr: String,
}

/// Point-in-time view of this node, served by `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub node_id: String,
    pub state: String,
    pub term: u64,
    pub leader: Option<String>,
    /// `None` when the configuration cannot be confirmed fresh.
    pub members: Option<Vec<MemberStatus>>,
    pub watermarks: BTreeMap<String, u64>,
    pub persist_failures: Vec<PersistFailureRecord>,
}

pub struct ClusterCoordinator {
    engine: Arc<dyn ConsensusEngine>,
    state_machine: Arc<IngestStateMachine>,
    meter: Arc<dyn Meter>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ClusterCoordinator {
    pub fn new(
        engine: Arc<dyn ConsensusEngine>,
        state_machine: Arc<IngestStateMachine>,
        meter: Arc<dyn Meter>,
    ) -> Self {
        Self {
            engine,
            state_machine,
            meter,
            listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.engine.node_id()
    }

    pub fn engine(&self) -> &Arc<dyn ConsensusEngine> {
        &self.engine
    }

    pub fn is_leader(&self) -> bool {
        self.engine.is_leader()
    }

    pub fn subscribe_leadership(&self) -> watch::Receiver<Leadership> {
        self.engine.leadership()
    }

    /// Add `node_id` at `addr` as a voter.
    ///
    /// Must run on the leader. Duplicate ids or addresses are rejected
    /// without touching the configuration; concurrent joins for the same
    /// member are serialized by the engine so only one succeeds.
    pub async fn join(&self, addr: ServerAddress, node_id: NodeId) -> Result<(), ClusterError> {
        self.ensure_open()?;
        obs_count!(self.meter, "skein_join_requests_total", &[], 1);

        if !self.engine.is_leader() {
            let leader = self.engine.leadership().borrow().leader.clone();
            tracing::info!(node = %node_id, ?leader, "Join received on non-leader");
            return Err(self.reject(&node_id, ClusterError::NotLeader { leader }));
        }

        match self.engine.current_configuration().await {
            Ok(config) if config.contains_id(&node_id) || config.contains_addr(&addr) => {
                return Err(self.reject(
                    &node_id,
                    ClusterError::DuplicateMember {
                        id: node_id.clone(),
                        addr,
                    },
                ));
            }
            Ok(_) => {}
            // The engine re-checks against its latest configuration.
            Err(e) => tracing::debug!(error = %e, "Committed configuration unavailable for join pre-check"),
        }

        tracing::info!(node = %node_id, addr = %addr, "Adding voter");
        match self.engine.add_voter(node_id.clone(), addr).await {
            Ok(()) => {
                obs_count!(self.meter, "skein_join_accepted_total", &[], 1);
                Ok(())
            }
            Err(e) => Err(self.reject(&node_id, e.into())),
        }
    }

    /// Number of voters in the committed configuration.
    pub async fn current_size(&self) -> Result<usize, ClusterError> {
        let config = self.engine.current_configuration().await?;
        Ok(config.len())
    }

    /// Invoke `callback` with the current leadership and on every change.
    ///
    /// Delivery is at-least-once: the engine may re-announce a state the
    /// callback has already seen.
    pub fn on_leadership_change<F>(&self, callback: F)
    where
        F: Fn(Leadership) + Send + Sync + 'static,
    {
        let mut rx = self.engine.leadership();
        let handle = tokio::spawn(async move {
            loop {
                let current = rx.borrow_and_update().clone();
                callback(current);
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
        self.listeners.lock().push(handle);
    }

    /// Shut the engine down. Listeners are released even if the engine
    /// fails to stop within its bound. Idempotent.
    pub async fn close(&self) -> Result<(), ClusterError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for handle in self.listeners.lock().drain(..) {
            handle.abort();
        }

        tracing::info!(node = %self.engine.node_id(), "Closing cluster coordinator");
        self.engine.shutdown().await.map_err(|e| {
            tracing::error!(error = %e, "Consensus engine did not shut down cleanly");
            ClusterError::from(e)
        })
    }

    pub async fn status(&self) -> ClusterStatus {
        let leadership = self.engine.leadership().borrow().clone();
        let members = match self.engine.current_configuration().await {
            Ok(config) => Some(
                config
                    .members()
                    .iter()
                    .map(|m| MemberStatus {
                        id: m.id.to_string(),
                        addr: m.addr.to_string(),
                    })
                    .collect(),
            ),
            Err(_) => None,
        };

        ClusterStatus {
            node_id: self.engine.node_id().to_string(),
            state: leadership.state.to_string(),
            term: leadership.term.as_u64(),
            leader: leadership.leader.map(|id| id.to_string()),
            members,
            watermarks: self.state_machine.watermarks(),
            persist_failures: self.state_machine.failures(),
        }
    }

    fn ensure_open(&self) -> Result<(), ClusterError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ClusterError::Closed)
        } else {
            Ok(())
        }
    }

    fn reject(&self, node_id: &NodeId, err: ClusterError) -> ClusterError {
        tracing::warn!(node = %node_id, kind = err.kind(), error = %err, "Join rejected");
        obs_count!(self.meter, "skein_join_rejected_total", &[], 1);
        self.meter.emit(ObsEvent::Membership(MembershipEvt {
            node: self.engine.node_id().to_string(),
            kind: MembershipKind::JoinRejected {
                id: node_id.to_string(),
            },
        }));
        err
    }
}

#[async_trait]
impl RecordSink for ClusterCoordinator {
    fn leadership(&self) -> watch::Receiver<Leadership> {
        self.engine.leadership()
    }

    fn watermark(&self, source: &str) -> Option<u64> {
        self.state_machine.watermark(source)
    }

    async fn submit(&self, record: IngestedRecord) -> Result<LogIndex, IngestError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IngestError::LeadershipLost { leader: None });
        }
        let command = IngestCommand::Record(record).encode()?;
        Ok(self.engine.propose(Bytes::from(command)).await?)
    }
}

impl Drop for ClusterCoordinator {
    fn drop(&mut self) {
        for handle in self.listeners.get_mut().drain(..) {
            handle.abort();
        }
    }
}
