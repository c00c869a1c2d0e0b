//! Main Raft consensus module - wires everything together.
//!
//! The Raft struct implements the `ConsensusEngine` trait and manages:
//! - Recovery from the data directory (hard state, snapshot, log)
//! - Background tasks (election, heartbeat, apply, RPC handling)
//! - Membership changes, one voter at a time
//! - Lifecycle (start/shutdown)

use crate::config::RaftConfig;
use crate::election::election_loop;
use crate::error::{RaftError, Result};
use crate::hard_state::HardStateStore;
use crate::log::{LogBase, RaftLog};
use crate::replication::{apply_loop, heartbeat_loop};
use crate::rpc_handler::rpc_handler_loop;
use crate::snapshot::{SnapshotStore, StateMachine};
use crate::state::{RaftState, RecoveredState};
use crate::timer::ElectionTimer;
use crate::transport::{RaftTransport, RpcReceiver};
use crate::types::*;
use crate::ConsensusEngine;
use bytes::Bytes;
use parking_lot::Mutex;
use skein_observe::{Meter, MembershipEvt, MembershipKind, ObsEvent};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Main Raft consensus module.
///
/// Wraps RaftState and manages background tasks for election, heartbeat,
/// apply, and incoming RPCs.
pub struct Raft {
    state: Arc<RaftState>,

    config: RaftConfig,

    transport: Arc<dyn RaftTransport>,

    /// Committed entries are applied here in log order.
    state_machine: Arc<dyn StateMachine>,

    election_timer: Arc<ElectionTimer>,

    shutdown_tx: broadcast::Sender<()>,

    /// Taken by `start`.
    rpc_rx: Mutex<Option<RpcReceiver>>,

    tasks: Mutex<Vec<JoinHandle<()>>>,

    /// Only one membership change may be in flight.
    membership_lock: tokio::sync::Mutex<()>,

    meter: Arc<dyn Meter>,

    stopped: AtomicBool,
}

impl Raft {
    /// Open a Raft instance over `data_dir`, recovering anything persisted there.
    ///
    /// The latest snapshot (if any) is restored into `state_machine` before
    /// the log is replayed by the apply loop.
    pub async fn open(
        node_id: NodeId,
        config: RaftConfig,
        data_dir: impl AsRef<Path>,
        transport: Arc<dyn RaftTransport>,
        rpc_rx: RpcReceiver,
        state_machine: Arc<dyn StateMachine>,
        meter: Arc<dyn Meter>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|reason| RaftError::ConfigError { reason })?;

        let dir = data_dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;

        let hard_state_store = HardStateStore::new(dir);
        let hard_state = hard_state_store.load()?.unwrap_or_default();
        let snapshots = SnapshotStore::new(dir);
        let snapshot = snapshots.load()?;
        let (log, recovery) = RaftLog::open(dir).await?;

        let mut snapshot_index = LogIndex::ZERO;
        match snapshot {
            Some(snapshot) => {
                let metadata = &snapshot.metadata;
                state_machine.restore(&snapshot.data).await?;
                log.compact_through(LogBase {
                    index: metadata.last_included_index,
                    term: metadata.last_included_term,
                    configuration: metadata.configuration.clone(),
                })
                .await?;
                snapshot_index = metadata.last_included_index;
                tracing::info!(index = %snapshot_index, "Restored state machine from snapshot");
            }
            None => {
                let first = log.first_index().await;
                if first > LogIndex(1) {
                    return Err(RaftError::Corrupted {
                        offset: 0,
                        reason: format!("log starts at {} but no snapshot exists", first),
                    });
                }
            }
        }

        let (configuration_index, configuration) = log.latest_configuration().await;
        transport.update_peers(&configuration);

        tracing::info!(
            node = %node_id,
            term = %hard_state.current_term,
            entries = recovery.entries_recovered,
            truncated_bytes = recovery.truncated_bytes,
            members = configuration.len(),
            "Opened raft state"
        );

        let recovered = RecoveredState {
            hard_state,
            log,
            hard_state_store,
            snapshots,
            snapshot_index,
            configuration,
            configuration_index,
        };
        let state = Arc::new(RaftState::new(
            node_id,
            config.clone(),
            recovered,
            transport.clone(),
            meter.clone(),
        ));

        let election_timer = Arc::new(ElectionTimer::new(config.clone()));
        let (shutdown_tx, _) = broadcast::channel(16);

        Ok(Self {
            state,
            config,
            transport,
            state_machine,
            election_timer,
            shutdown_tx,
            rpc_rx: Mutex::new(Some(rpc_rx)),
            tasks: Mutex::new(Vec::new()),
            membership_lock: tokio::sync::Mutex::new(()),
            meter,
            stopped: AtomicBool::new(false),
        })
    }

    /// Start the background tasks:
    /// - Election timer and election loop
    /// - Heartbeat loop (only sends when leader)
    /// - Apply loop
    /// - RPC handler loop
    pub fn start(&self) -> Result<()> {
        self.ensure_running()?;
        let rpc_rx = self.rpc_rx.lock().take().ok_or_else(|| RaftError::Internal {
            reason: "raft already started".to_string(),
        })?;
        let timeout_rx = self
            .election_timer
            .take_receiver()
            .ok_or_else(|| RaftError::Internal {
                reason: "election timer receiver already taken".to_string(),
            })?;

        let mut tasks = self.tasks.lock();

        tasks.push(tokio::spawn(self.election_timer.clone().run()));

        tasks.push(tokio::spawn(election_loop(
            self.state.clone(),
            self.config.clone(),
            self.transport.clone(),
            timeout_rx,
            self.shutdown_tx.subscribe(),
        )));

        tasks.push(tokio::spawn(heartbeat_loop(
            self.state.clone(),
            self.transport.clone(),
            self.shutdown_tx.subscribe(),
        )));

        tasks.push(tokio::spawn(apply_loop(
            self.state.clone(),
            self.state_machine.clone(),
            self.shutdown_tx.subscribe(),
        )));

        tasks.push(tokio::spawn(rpc_handler_loop(
            self.state.clone(),
            self.state_machine.clone(),
            rpc_rx,
            self.election_timer.clone(),
            self.shutdown_tx.subscribe(),
        )));

        tracing::info!(node = %self.state.node_id(), "Raft started");
        Ok(())
    }

    /// Shared state (exposed for status reporting and tests).
    pub fn state(&self) -> &Arc<RaftState> {
        &self.state
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    /// Snapshot the state machine now and compact the log.
    ///
    /// Returns None when nothing was applied since the last snapshot.
    pub async fn create_snapshot(&self) -> Result<Option<SnapshotMetadata>> {
        self.ensure_running()?;
        self.state.take_snapshot(self.state_machine.as_ref()).await
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(RaftError::Shutdown);
        }
        Ok(())
    }

    fn not_leader(&self) -> RaftError {
        RaftError::NotLeader {
            leader: self.state.leader(),
        }
    }

    /// Wait until the entry (`term`, `index`) is committed.
    ///
    /// Fails with `NotLeader` if leadership of `term` is lost first or the
    /// entry was replaced, and with `Timeout` after `limit`.
    async fn wait_for_commit(&self, term: Term, index: LogIndex, limit: Duration) -> Result<()> {
        let started = Instant::now();
        let mut commit_rx = self.state.subscribe_commit();
        let mut leadership_rx = self.state.subscribe_leadership();

        let wait = async {
            loop {
                let committed = *commit_rx.borrow_and_update() >= index;
                if committed {
                    let base_index = self.state.log_ref().first_index().await.prev();
                    return match self.state.log_ref().term_at(index).await {
                        Some(t) if t == term => Ok(()),
                        None if base_index.map_or(false, |b| index <= b) => Ok(()),
                        _ => Err(self.not_leader()),
                    };
                }

                let lost = {
                    let leadership = leadership_rx.borrow_and_update();
                    (!leadership.is_leader() || leadership.term != term)
                        .then(|| leadership.leader.clone())
                };
                if let Some(leader) = lost {
                    return Err(RaftError::NotLeader { leader });
                }

                tokio::select! {
                    changed = commit_rx.changed() => changed.map_err(|_| RaftError::Shutdown)?,
                    changed = leadership_rx.changed() => changed.map_err(|_| RaftError::Shutdown)?,
                }
            }
        };

        match tokio::time::timeout(limit, wait).await {
            Ok(result) => result,
            Err(_) => Err(RaftError::Timeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }
}

#[async_trait::async_trait]
impl ConsensusEngine for Raft {
    fn node_id(&self) -> NodeId {
        self.state.node_id().clone()
    }

    async fn bootstrap(&self, self_id: NodeId, self_addr: ServerAddress) -> Result<()> {
        self.ensure_running()?;
        if &self_id != self.state.node_id() {
            return Err(RaftError::ConfigError {
                reason: format!(
                    "bootstrap id {} does not match node id {}",
                    self_id,
                    self.state.node_id()
                ),
            });
        }
        self.state
            .bootstrap(ClusterConfiguration::single(self_id, self_addr))
            .await
    }

    async fn has_existing_state(&self) -> bool {
        self.state.has_existing_state().await
    }

    fn is_leader(&self) -> bool {
        self.state.role() == LeadershipState::Leader
    }

    fn leadership(&self) -> watch::Receiver<Leadership> {
        self.state.subscribe_leadership()
    }

    fn commit_index(&self) -> watch::Receiver<LogIndex> {
        self.state.subscribe_commit()
    }

    /// Add a voter through a single-server configuration change.
    ///
    /// The new configuration is used as soon as it is appended; this call
    /// returns once it is committed.
    async fn add_voter(&self, id: NodeId, addr: ServerAddress) -> Result<()> {
        let _change = self.membership_lock.lock().await;
        self.ensure_running()?;

        let leadership = self.state.leadership();
        if !leadership.is_leader() {
            return Err(RaftError::NotLeader {
                leader: leadership.leader,
            });
        }

        // A previous change must commit before the next one starts
        let pending = self.state.configuration_index();
        if pending > self.state.commit_index() {
            let pending_term = self
                .state
                .log_ref()
                .term_at(pending)
                .await
                .unwrap_or(leadership.term);
            tracing::debug!(index = %pending, "Waiting for previous configuration to commit");
            self.wait_for_commit(pending_term, pending, self.config.membership_timeout)
                .await?;
        }

        let current = self.state.configuration();
        let next = current
            .with_member(Member::new(id.clone(), addr.clone()))
            .ok_or_else(|| RaftError::AlreadyMember {
                id: id.clone(),
                addr: addr.clone(),
            })?;

        tracing::info!(id = %id, addr = %addr, members = next.len(), "Proposing new voter");
        self.meter.emit(ObsEvent::Membership(MembershipEvt {
            node: self.state.node_id().to_string(),
            kind: MembershipKind::VoterProposed {
                id: id.to_string(),
                addr: addr.to_string(),
            },
        }));

        let members = next.len();
        let (term, index) = self
            .state
            .append_as_leader(EntryPayload::Membership(next))
            .await?;
        self.wait_for_commit(term, index, self.config.membership_timeout)
            .await?;

        tracing::info!(id = %id, index = %index, members, "Voter committed");
        self.meter.emit(ObsEvent::Membership(MembershipEvt {
            node: self.state.node_id().to_string(),
            kind: MembershipKind::VoterCommitted {
                id: id.to_string(),
                members,
            },
        }));
        Ok(())
    }

    async fn current_configuration(&self) -> Result<ClusterConfiguration> {
        self.ensure_running()?;
        self.state.check_freshness()?;
        Ok(self.state.committed_configuration().await)
    }

    /// Replicate `command`, returning once it is committed and applied locally.
    async fn propose(&self, command: Bytes) -> Result<LogIndex> {
        self.ensure_running()?;
        if !self.is_leader() {
            return Err(self.not_leader());
        }

        let started = Instant::now();
        let (term, index) = self
            .state
            .append_as_leader(EntryPayload::Command(command))
            .await?;
        self.wait_for_commit(term, index, self.config.propose_timeout)
            .await?;

        let remaining = self.config.propose_timeout.saturating_sub(started.elapsed());
        let mut applied_rx = self.state.subscribe_applied();
        let waited = tokio::time::timeout(remaining, applied_rx.wait_for(|applied| *applied >= index))
            .await
            .map(|r| r.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(index),
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => Err(RaftError::Timeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    /// Stop background tasks and release leadership.
    ///
    /// Idempotent. Tasks that do not exit within `shutdown_timeout` are
    /// aborted and `Timeout` is returned.
    async fn shutdown(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        tracing::info!(node = %self.state.node_id(), "Raft shutting down");
        self.state.mark_stopped();
        self.election_timer.shutdown();
        let _ = self.shutdown_tx.send(());

        let mut handles = std::mem::take(&mut *self.tasks.lock());
        let started = Instant::now();
        let joined = tokio::time::timeout(
            self.config.shutdown_timeout,
            futures::future::join_all(handles.iter_mut()),
        )
        .await;

        match joined {
            Ok(_) => Ok(()),
            Err(_) => {
                for handle in &handles {
                    handle.abort();
                }
                tracing::warn!("Raft tasks did not stop in time; aborted");
                Err(RaftError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }
}
