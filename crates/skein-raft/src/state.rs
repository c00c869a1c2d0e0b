//! Raft node state (Follower, Candidate, Leader roles and transitions).
//!
//! # Persistent State (survives crashes)
//!
//! - `current_term` and `voted_for`: written to `hard_state.bin` before any
//!   reply that depends on them
//! - `log`: entries in `RaftLog`, plus the latest snapshot
//!
//! # Volatile State (all servers)
//!
//! - `commit_index`: highest log entry known to be committed
//! - `last_applied`: highest log entry applied to the state machine
//! - `configuration`: latest configuration in the log (used as soon as appended)
//!
//! # Volatile State (leaders only)
//!
//! - `next_index[]`, `match_index[]`: per-follower replication progress
//! - `lease`: valid while a majority acknowledged a recent heartbeat round
//!
//! Every role or term transition is published on a `watch` channel so
//! observers wait on changes instead of polling.

use crate::config::RaftConfig;
use crate::election::is_log_up_to_date;
use crate::error::{RaftError, Result};
use crate::hard_state::{HardState, HardStateStore};
use crate::lease::LeaseState;
use crate::log::{LogBase, RaftLog};
use crate::snapshot::{Snapshot, SnapshotStore, StateMachine};
use crate::transport::RaftTransport;
use crate::types::*;
use parking_lot::RwLock;
use skein_observe::{obs_count, obs_gauge, Meter, ObsEvent, RaftEvt, RaftKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Mutex, Notify};

/// Raft node state.
///
/// Encapsulates all Raft state and logic for a single node.
/// Thread-safe via internal locking; lock order is `persistent` then `volatile`.
pub struct RaftState {
    node_id: NodeId,

    config: RaftConfig,

    persistent: RwLock<PersistentState>,

    volatile: RwLock<VolatileState>,

    log: RaftLog,

    hard_state: HardStateStore,

    snapshots: SnapshotStore,

    transport: Arc<dyn RaftTransport>,

    meter: Arc<dyn Meter>,

    leadership_tx: watch::Sender<Leadership>,

    commit_tx: watch::Sender<LogIndex>,

    applied_tx: watch::Sender<LogIndex>,

    /// Wakes the heartbeat loop for an immediate replication round.
    replicate_notify: Notify,

    /// Serializes log appends (leader proposals and follower AppendEntries).
    append_lock: Mutex<()>,

    /// Held while applying entries, taking a snapshot, or installing one.
    apply_lock: Mutex<()>,
}

struct PersistentState {
    current_term: Term,
    voted_for: Option<NodeId>,
}

/// Volatile state (lost on crash, recomputed on recovery).
pub struct VolatileState {
    pub role: LeadershipState,

    /// Followers track this to redirect clients.
    pub leader_id: Option<NodeId>,

    pub commit_index: LogIndex,

    pub last_applied: LogIndex,

    /// Highest log index included in the last snapshot.
    pub last_snapshot_index: LogIndex,

    /// Only valid when role == Leader.
    pub leader_state: Option<LeaderState>,

    /// Last time the election timer had reason to be reset.
    pub last_heartbeat: Instant,

    /// Last time a valid leader for the current term contacted us.
    pub last_leader_contact: Option<Instant>,

    /// Latest configuration in the log.
    pub configuration: ClusterConfiguration,

    /// Index the latest configuration was written at.
    pub configuration_index: LogIndex,

    /// Set once the engine is shutting down; no role can be gained afterwards.
    pub stopped: bool,
}

/// Leader-specific volatile state.
pub struct LeaderState {
    /// For each peer, index of next log entry to send.
    pub next_index: HashMap<NodeId, LogIndex>,

    /// For each peer, index of highest log entry known to be replicated.
    pub match_index: HashMap<NodeId, LogIndex>,

    pub lease: LeaseState,

    /// Start of the last heartbeat round a majority acknowledged.
    pub last_quorum_contact: Instant,
}

/// Everything recovered from disk that `RaftState::new` needs.
pub struct RecoveredState {
    pub hard_state: HardState,
    pub log: RaftLog,
    pub hard_state_store: HardStateStore,
    pub snapshots: SnapshotStore,
    pub snapshot_index: LogIndex,
    pub configuration: ClusterConfiguration,
    pub configuration_index: LogIndex,
}

impl RaftState {
    pub fn new(
        node_id: NodeId,
        config: RaftConfig,
        recovered: RecoveredState,
        transport: Arc<dyn RaftTransport>,
        meter: Arc<dyn Meter>,
    ) -> Self {
        let term = recovered.hard_state.current_term;
        let (leadership_tx, _) = watch::channel(Leadership::follower(term));
        let (commit_tx, _) = watch::channel(recovered.snapshot_index);
        let (applied_tx, _) = watch::channel(recovered.snapshot_index);

        Self {
            node_id,
            config,
            persistent: RwLock::new(PersistentState {
                current_term: term,
                voted_for: recovered.hard_state.voted_for,
            }),
            volatile: RwLock::new(VolatileState {
                role: LeadershipState::Follower,
                leader_id: None,
                commit_index: recovered.snapshot_index,
                last_applied: recovered.snapshot_index,
                last_snapshot_index: recovered.snapshot_index,
                leader_state: None,
                last_heartbeat: Instant::now(),
                last_leader_contact: None,
                configuration: recovered.configuration,
                configuration_index: recovered.configuration_index,
                stopped: false,
            }),
            log: recovered.log,
            hard_state: recovered.hard_state_store,
            snapshots: recovered.snapshots,
            transport,
            meter,
            leadership_tx,
            commit_tx,
            applied_tx,
            replicate_notify: Notify::new(),
            append_lock: Mutex::new(()),
            apply_lock: Mutex::new(()),
        }
    }

    pub fn role(&self) -> LeadershipState {
        self.volatile.read().role
    }

    pub fn current_term(&self) -> Term {
        self.persistent.read().current_term
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.volatile.read().leader_id.clone()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.volatile.read().commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.volatile.read().last_applied
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn log_ref(&self) -> &RaftLog {
        &self.log
    }

    pub fn volatile_state(&self) -> &RwLock<VolatileState> {
        &self.volatile
    }

    pub fn meter(&self) -> &Arc<dyn Meter> {
        &self.meter
    }

    /// Latest configuration in the log (may not be committed yet).
    pub fn configuration(&self) -> ClusterConfiguration {
        self.volatile.read().configuration.clone()
    }

    pub fn configuration_index(&self) -> LogIndex {
        self.volatile.read().configuration_index
    }

    /// Whether this node is a voter in its latest configuration.
    pub fn is_voter(&self) -> bool {
        self.volatile.read().configuration.contains_id(&self.node_id)
    }

    pub fn leadership(&self) -> Leadership {
        self.leadership_tx.borrow().clone()
    }

    pub fn subscribe_leadership(&self) -> watch::Receiver<Leadership> {
        self.leadership_tx.subscribe()
    }

    pub fn subscribe_commit(&self) -> watch::Receiver<LogIndex> {
        self.commit_tx.subscribe()
    }

    pub fn subscribe_applied(&self) -> watch::Receiver<LogIndex> {
        self.applied_tx.subscribe()
    }

    pub fn notify_replicate(&self) {
        self.replicate_notify.notify_one();
    }

    pub async fn replicate_requested(&self) {
        self.replicate_notify.notified().await;
    }

    pub fn apply_lock(&self) -> &Mutex<()> {
        &self.apply_lock
    }

    /// Whether we heard from a leader (or granted a vote) within `window`.
    pub fn heard_from_leader_within(&self, window: std::time::Duration) -> bool {
        self.volatile.read().last_heartbeat.elapsed() < window
    }

    /// Whether the data directory held any Raft state when opened or since.
    pub async fn has_existing_state(&self) -> bool {
        self.current_term() > Term::ZERO || self.log.last_index().await > LogIndex::ZERO
    }

    /// Configuration as of the commit index.
    pub async fn committed_configuration(&self) -> ClusterConfiguration {
        let commit = self.commit_index();
        self.log.configuration_at(commit).await.1
    }

    /// Confirm local state is fresh enough to answer configuration reads.
    ///
    /// A leader needs a valid lease (or to be the only voter); anyone else
    /// needs recent contact from a known leader.
    pub fn check_freshness(&self) -> Result<()> {
        let volatile = self.volatile.read();
        match volatile.role {
            LeadershipState::Leader => {
                let sole_voter = volatile.configuration.len() == 1
                    && volatile.configuration.contains_id(&self.node_id);
                let lease_valid = volatile
                    .leader_state
                    .as_ref()
                    .map_or(false, |ls| ls.lease.is_valid());
                if sole_voter || lease_valid {
                    Ok(())
                } else {
                    Err(RaftError::Unavailable {
                        reason: "leader lease expired; quorum not confirmed".to_string(),
                    })
                }
            }
            _ => {
                let recent = volatile
                    .last_leader_contact
                    .map_or(false, |t| t.elapsed() < self.config.election_timeout_max);
                if recent && volatile.leader_id.is_some() {
                    Ok(())
                } else {
                    Err(RaftError::Unavailable {
                        reason: "no recent contact with a leader".to_string(),
                    })
                }
            }
        }
    }

    /// Set the current term (for testing).
    #[cfg(test)]
    pub fn set_current_term(&self, term: Term) {
        self.persistent.write().current_term = term;
    }

    /// Initialize a one-member cluster on a fresh directory.
    ///
    /// Writes the configuration as entry (T1, I1) and treats it as committed.
    pub async fn bootstrap(&self, configuration: ClusterConfiguration) -> Result<()> {
        let _append = self.append_lock.lock().await;
        let last_index = self.log.last_index().await;
        if self.current_term() > Term::ZERO || last_index > LogIndex::ZERO {
            return Err(RaftError::AlreadyBootstrapped { last_index });
        }

        let term = Term(1);
        {
            let mut persistent = self.persistent.write();
            persistent.current_term = term;
            persistent.voted_for = None;
            self.persist(&persistent)?;
        }

        let index = LogIndex(1);
        self.log
            .append(LogEntry::new(
                term,
                index,
                EntryPayload::Membership(configuration.clone()),
            ))
            .await?;
        self.transport.update_peers(&configuration);

        {
            let persistent = self.persistent.read();
            let mut volatile = self.volatile.write();
            volatile.configuration = configuration;
            volatile.configuration_index = index;
            volatile.commit_index = index;
            self.publish_leadership(&persistent, &volatile);
        }
        self.commit_tx.send_replace(index);

        tracing::info!(node = %self.node_id, "Bootstrapped single-member cluster");
        Ok(())
    }

    /// Handle RequestVote RPC.
    pub async fn handle_request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        // Read the log before taking locks (no lock held across await)
        let last_log_term = self.log.last_term().await;
        let last_log_index = self.log.last_index().await;

        let mut persistent = self.persistent.write();
        let mut volatile = self.volatile.write();

        if request.term > persistent.current_term {
            self.step_down_inner(&mut persistent, &mut volatile, request.term)?;
        }

        let mut vote_granted = false;

        if request.term == persistent.current_term && !volatile.stopped {
            let already_voted = persistent
                .voted_for
                .as_ref()
                .map_or(false, |id| id != &request.candidate_id);

            if !already_voted
                && is_log_up_to_date(
                    request.last_log_term,
                    request.last_log_index,
                    last_log_term,
                    last_log_index,
                )
            {
                persistent.voted_for = Some(request.candidate_id.clone());
                self.persist(&persistent)?;
                vote_granted = true;
                volatile.last_heartbeat = Instant::now();

                self.meter.emit(ObsEvent::Raft(RaftEvt {
                    node: self.node_id.to_string(),
                    term: persistent.current_term.as_u64(),
                    kind: RaftKind::VoteGranted {
                        candidate: request.candidate_id.to_string(),
                    },
                }));
            }
        }

        Ok(RequestVoteResponse {
            term: persistent.current_term,
            vote_granted,
        })
    }

    /// Accept the sender of a current-term AppendEntries/InstallSnapshot as
    /// leader. Returns our term and whether the request is stale.
    fn observe_leader(&self, term: Term, leader_id: &NodeId) -> Result<(Term, bool)> {
        let mut persistent = self.persistent.write();
        let mut volatile = self.volatile.write();

        if term > persistent.current_term {
            self.step_down_inner(&mut persistent, &mut volatile, term)?;
        }

        if term < persistent.current_term {
            return Ok((persistent.current_term, true));
        }

        let now = Instant::now();
        volatile.last_heartbeat = now;
        volatile.last_leader_contact = Some(now);

        // Two leaders in one term cannot happen; a candidate yields here
        if volatile.role != LeadershipState::Follower {
            if volatile.role == LeadershipState::Leader {
                tracing::warn!(
                    term = %persistent.current_term,
                    "Leader stepping down after receiving AppendEntries from {}",
                    leader_id
                );
            }
            volatile.role = LeadershipState::Follower;
            volatile.leader_state = None;
        }
        volatile.leader_id = Some(leader_id.clone());
        self.publish_leadership(&persistent, &volatile);

        Ok((persistent.current_term, false))
    }

    /// Handle AppendEntries RPC (replication and heartbeats).
    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        // Phase 1: term check and leader bookkeeping
        let (current_term, stale) = self.observe_leader(request.term, &request.leader_id)?;

        if stale {
            return Ok(AppendEntriesResponse {
                term: current_term,
                success: false,
                conflict_index: None,
                last_log_index: self.log.last_index().await,
            });
        }

        let _append = self.append_lock.lock().await;

        // Phase 2: log consistency check. Anything at or below the snapshot
        // base is committed and therefore matches.
        let base_index = self.log.first_index().await.prev().unwrap_or(LogIndex::ZERO);
        let last_log_index = self.log.last_index().await;
        let log_ok = request.prev_log_index < base_index
            || self.log.term_at(request.prev_log_index).await == Some(request.prev_log_term);

        if !log_ok {
            let conflict_index = request.prev_log_index.min(last_log_index.next());
            return Ok(AppendEntriesResponse {
                term: current_term,
                success: false,
                conflict_index: Some(conflict_index.max(LogIndex(1))),
                last_log_index,
            });
        }

        // Phase 3: skip entries we already hold, truncate at the first conflict
        let sent = request.entries.len() as u64;
        let mut configuration_touched = false;
        let mut to_append = Vec::new();
        for entry in request.entries {
            if entry.index <= base_index {
                continue;
            }
            if !to_append.is_empty() {
                configuration_touched |= entry.configuration().is_some();
                to_append.push(entry);
                continue;
            }
            match self.log.term_at(entry.index).await {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.commit_index() {
                        return Err(RaftError::Internal {
                            reason: format!("leader overwrote committed entry {}", entry.index),
                        });
                    }
                    tracing::debug!(from = %entry.index, "Truncating conflicting log suffix");
                    self.log.truncate(entry.index).await?;
                    configuration_touched = true;
                    configuration_touched |= entry.configuration().is_some();
                    to_append.push(entry);
                }
                None => {
                    configuration_touched |= entry.configuration().is_some();
                    to_append.push(entry);
                }
            }
        }
        self.log.append_batch(to_append).await?;

        if configuration_touched {
            self.reload_configuration().await;
        }

        // Phase 4: advance commit index
        let last_new_index = LogIndex(request.prev_log_index.0 + sent);
        let new_commit = {
            let mut volatile = self.volatile.write();
            let target = request.leader_commit.min(last_new_index);
            if target > volatile.commit_index {
                volatile.commit_index = target;
                Some(target)
            } else {
                None
            }
        };
        if let Some(commit) = new_commit {
            self.commit_tx.send_replace(commit);
        }

        Ok(AppendEntriesResponse {
            term: current_term,
            success: true,
            conflict_index: None,
            last_log_index: self.log.last_index().await,
        })
    }

    /// Handle InstallSnapshot RPC: restore the state machine and replace the
    /// log prefix covered by the snapshot.
    pub async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
        state_machine: &dyn StateMachine,
    ) -> Result<InstallSnapshotResponse> {
        let (current_term, stale) = self.observe_leader(request.term, &request.leader_id)?;
        if stale {
            return Ok(InstallSnapshotResponse {
                term: current_term,
                bytes_stored: 0,
            });
        }

        let metadata = request.metadata;
        let snapshot_index = metadata.last_included_index;
        if snapshot_index <= self.commit_index() {
            return Ok(InstallSnapshotResponse {
                term: current_term,
                bytes_stored: 0,
            });
        }

        let _apply = self.apply_lock.lock().await;
        let _append = self.append_lock.lock().await;

        state_machine.restore(&request.data).await?;
        self.snapshots
            .save(&Snapshot::new(metadata.clone(), request.data.clone()))?;

        let base = LogBase {
            index: snapshot_index,
            term: metadata.last_included_term,
            configuration: metadata.configuration.clone(),
        };
        if self.log.term_at(snapshot_index).await == Some(metadata.last_included_term) {
            self.log.compact_through(base).await?;
        } else {
            self.log.reset(base).await?;
        }
        self.reload_configuration().await;

        {
            let mut volatile = self.volatile.write();
            volatile.commit_index = volatile.commit_index.max(snapshot_index);
            volatile.last_applied = snapshot_index;
            volatile.last_snapshot_index = snapshot_index;
        }
        self.commit_tx.send_replace(self.commit_index());
        self.applied_tx.send_replace(snapshot_index);

        tracing::info!(
            index = %snapshot_index,
            bytes = request.data.len(),
            "Installed snapshot from leader {}",
            request.leader_id
        );
        self.meter.emit(ObsEvent::Raft(RaftEvt {
            node: self.node_id.to_string(),
            term: current_term.as_u64(),
            kind: RaftKind::SnapshotInstalled {
                last_included_index: snapshot_index.as_u64(),
            },
        }));

        Ok(InstallSnapshotResponse {
            term: current_term,
            bytes_stored: request.data.len() as u64,
        })
    }

    /// Step down to follower, adopting `new_term` if it is newer.
    fn step_down_inner(
        &self,
        persistent: &mut PersistentState,
        volatile: &mut VolatileState,
        new_term: Term,
    ) -> Result<()> {
        let was_leader = volatile.role == LeadershipState::Leader;

        if new_term > persistent.current_term {
            persistent.current_term = new_term;
            persistent.voted_for = None;
            self.persist(persistent)?;
        }
        volatile.role = LeadershipState::Follower;
        volatile.leader_state = None;
        volatile.leader_id = None;
        volatile.last_heartbeat = Instant::now();
        self.publish_leadership(persistent, volatile);

        if was_leader {
            tracing::info!(term = %persistent.current_term, "Stepped down from leader");
            self.emit_step_down(persistent.current_term);
        }
        Ok(())
    }

    /// Step down after seeing a higher term in an RPC response.
    pub fn step_down(&self, new_term: Term) -> Result<()> {
        let mut persistent = self.persistent.write();
        let mut volatile = self.volatile.write();
        if new_term < persistent.current_term {
            return Ok(());
        }
        self.step_down_inner(&mut persistent, &mut volatile, new_term)
    }

    /// Transition to candidate for a new term, voting for ourselves.
    pub fn start_election(&self) -> Result<Term> {
        let mut persistent = self.persistent.write();
        let mut volatile = self.volatile.write();

        if volatile.stopped {
            return Err(RaftError::Shutdown);
        }

        persistent.current_term = persistent.current_term.next();
        persistent.voted_for = Some(self.node_id.clone());
        self.persist(&persistent)?;
        let term = persistent.current_term;

        volatile.role = LeadershipState::Candidate;
        volatile.leader_state = None;
        volatile.leader_id = None;
        volatile.last_heartbeat = Instant::now();
        self.publish_leadership(&persistent, &volatile);

        obs_count!(self.meter, "skein_raft_elections_total", &[], 1);
        obs_gauge!(self.meter, "skein_raft_term", &[], term.as_u64());
        self.meter.emit(ObsEvent::Raft(RaftEvt {
            node: self.node_id.to_string(),
            term: term.as_u64(),
            kind: RaftKind::ElectionStarted,
        }));

        Ok(term)
    }

    /// Transition to leader after winning the election for `term`.
    ///
    /// Appends a blank entry so entries from earlier terms can commit.
    /// Returns false if the term moved on while votes were counted.
    pub async fn become_leader(&self, term: Term) -> Result<bool> {
        let last_log_index = self.log.last_index().await;

        {
            let persistent = self.persistent.read();
            let mut volatile = self.volatile.write();
            if persistent.current_term != term
                || volatile.role != LeadershipState::Candidate
                || volatile.stopped
            {
                return Ok(false);
            }

            volatile.role = LeadershipState::Leader;
            volatile.leader_id = Some(self.node_id.clone());

            let mut next_index = HashMap::new();
            let mut match_index = HashMap::new();
            for node in volatile.configuration.voter_ids() {
                if node != self.node_id {
                    next_index.insert(node.clone(), last_log_index.next());
                    match_index.insert(node, LogIndex::ZERO);
                }
            }

            volatile.leader_state = Some(LeaderState {
                next_index,
                match_index,
                lease: LeaseState::new(&self.config),
                last_quorum_contact: Instant::now(),
            });
            self.publish_leadership(&persistent, &volatile);
        }

        tracing::info!(term = %term, node = %self.node_id, "Became leader");
        obs_count!(self.meter, "skein_raft_leader_elected_total", &[], 1);
        self.meter.emit(ObsEvent::Raft(RaftEvt {
            node: self.node_id.to_string(),
            term: term.as_u64(),
            kind: RaftKind::LeaderElected,
        }));

        self.append_as_leader(EntryPayload::Blank).await?;
        Ok(true)
    }

    /// Append a new entry to the local log as leader.
    ///
    /// Membership entries take effect here, before they commit.
    pub async fn append_as_leader(&self, payload: EntryPayload) -> Result<(Term, LogIndex)> {
        let _append = self.append_lock.lock().await;

        let term = {
            let persistent = self.persistent.read();
            let volatile = self.volatile.read();
            if volatile.role != LeadershipState::Leader {
                return Err(RaftError::NotLeader {
                    leader: volatile.leader_id.clone(),
                });
            }
            persistent.current_term
        };

        let index = self.log.last_index().await.next();
        let configuration = match &payload {
            EntryPayload::Membership(config) => Some(config.clone()),
            _ => None,
        };
        self.log.append(LogEntry::new(term, index, payload)).await?;

        if let Some(configuration) = configuration {
            self.transport.update_peers(&configuration);
            let mut volatile = self.volatile.write();
            if let Some(leader_state) = volatile.leader_state.as_mut() {
                for id in configuration.voter_ids() {
                    if id != self.node_id {
                        leader_state.next_index.entry(id.clone()).or_insert(index);
                        leader_state.match_index.entry(id).or_insert(LogIndex::ZERO);
                    }
                }
            }
            volatile.configuration = configuration;
            volatile.configuration_index = index;
        }

        self.notify_replicate();
        Ok((term, index))
    }

    /// Leader: record that a majority acknowledged the round started at `round_started`.
    pub fn record_quorum_contact(&self, term: Term, round_started: Instant) {
        if self.current_term() != term {
            return;
        }
        let mut volatile = self.volatile.write();
        if let Some(leader_state) = volatile.leader_state.as_mut() {
            leader_state.lease.grant(round_started);
            if round_started > leader_state.last_quorum_contact {
                leader_state.last_quorum_contact = round_started;
            }
        }
    }

    /// Leader: give up the role if no majority answered for longer than an
    /// election timeout. A partitioned leader stops acting as one instead of
    /// waiting to hear about a newer term.
    pub fn check_leader_quorum(&self) -> bool {
        let persistent = self.persistent.read();
        let mut volatile = self.volatile.write();
        if volatile.role != LeadershipState::Leader || volatile.configuration.len() <= 1 {
            return false;
        }
        let silent_for = match volatile.leader_state.as_ref() {
            Some(ls) => ls.last_quorum_contact.elapsed(),
            None => return false,
        };
        if silent_for <= self.config.election_timeout_max {
            return false;
        }

        tracing::warn!(
            term = %persistent.current_term,
            silent_ms = silent_for.as_millis() as u64,
            "Lost contact with a majority; stepping down"
        );
        volatile.role = LeadershipState::Follower;
        volatile.leader_state = None;
        volatile.leader_id = None;
        volatile.last_heartbeat = Instant::now();
        self.publish_leadership(&persistent, &volatile);
        self.emit_step_down(persistent.current_term);
        true
    }

    pub fn set_commit_index(&self, index: LogIndex) {
        let advanced = {
            let mut volatile = self.volatile.write();
            if index > volatile.commit_index {
                volatile.commit_index = index;
                true
            } else {
                false
            }
        };
        if advanced {
            obs_gauge!(self.meter, "skein_raft_commit_index", &[], index.as_u64());
            self.commit_tx.send_replace(index);
        }
    }

    pub fn set_last_applied(&self, index: LogIndex) {
        {
            let mut volatile = self.volatile.write();
            if index <= volatile.last_applied {
                return;
            }
            volatile.last_applied = index;
        }
        self.applied_tx.send_replace(index);
    }

    /// Mark the engine stopped: role drops to Follower with no leader and
    /// observers are told so.
    pub fn mark_stopped(&self) {
        let persistent = self.persistent.read();
        let mut volatile = self.volatile.write();
        let was_leader = volatile.role == LeadershipState::Leader;
        volatile.stopped = true;
        volatile.role = LeadershipState::Follower;
        volatile.leader_state = None;
        volatile.leader_id = None;
        self.publish_leadership(&persistent, &volatile);
        if was_leader {
            self.emit_step_down(persistent.current_term);
        }
    }

    pub fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        self.snapshots.load()
    }

    /// Snapshot the state machine at `last_applied` and compact the log.
    pub async fn take_snapshot(
        &self,
        state_machine: &dyn StateMachine,
    ) -> Result<Option<SnapshotMetadata>> {
        let _apply = self.apply_lock.lock().await;

        let (last_applied, last_snapshot_index) = {
            let volatile = self.volatile.read();
            (volatile.last_applied, volatile.last_snapshot_index)
        };
        if last_applied <= last_snapshot_index {
            return Ok(None);
        }

        let term = self
            .log
            .term_at(last_applied)
            .await
            .ok_or_else(|| RaftError::SnapshotFailed {
                reason: format!("no term for applied index {}", last_applied),
            })?;
        let configuration = self.log.configuration_at(last_applied).await.1;
        let data = state_machine.snapshot().await?;

        let metadata = SnapshotMetadata {
            last_included_index: last_applied,
            last_included_term: term,
            configuration: configuration.clone(),
            size_bytes: data.len() as u64,
            created_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        };

        // Snapshot must be durable before the prefix it covers is dropped
        self.snapshots.save(&Snapshot::new(metadata.clone(), data))?;
        self.log
            .compact_through(LogBase {
                index: last_applied,
                term,
                configuration,
            })
            .await?;
        self.volatile.write().last_snapshot_index = last_applied;

        tracing::info!(index = %last_applied, bytes = metadata.size_bytes, "Snapshot taken");
        self.meter.emit(ObsEvent::Raft(RaftEvt {
            node: self.node_id.to_string(),
            term: self.current_term().as_u64(),
            kind: RaftKind::SnapshotTaken {
                last_included_index: last_applied.as_u64(),
            },
        }));
        Ok(Some(metadata))
    }

    /// Recompute the effective configuration from the log after it changed
    /// underneath us (truncation, snapshot install).
    async fn reload_configuration(&self) {
        let (index, configuration) = self.log.latest_configuration().await;
        self.transport.update_peers(&configuration);
        let mut volatile = self.volatile.write();
        volatile.configuration = configuration;
        volatile.configuration_index = index;
    }

    fn persist(&self, persistent: &PersistentState) -> Result<()> {
        self.hard_state.save(&HardState {
            current_term: persistent.current_term,
            voted_for: persistent.voted_for.clone(),
        })
    }

    fn publish_leadership(&self, persistent: &PersistentState, volatile: &VolatileState) {
        let next = Leadership {
            state: volatile.role,
            term: persistent.current_term,
            leader: volatile.leader_id.clone(),
        };
        self.leadership_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn emit_step_down(&self, term: Term) {
        self.meter.emit(ObsEvent::Raft(RaftEvt {
            node: self.node_id.to_string(),
            term: term.as_u64(),
            kind: RaftKind::StepDown,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;
    use tempfile::TempDir;

    fn three_members() -> ClusterConfiguration {
        ClusterConfiguration::single(NodeId::new("n1"), ServerAddress::new("n1:9125"))
            .with_member(Member::new(NodeId::new("n2"), ServerAddress::new("n2:9125")))
            .and_then(|c| c.with_member(Member::new(NodeId::new("n3"), ServerAddress::new("n3:9125"))))
            .unwrap()
    }

    async fn create_test_state(configuration: ClusterConfiguration) -> (RaftState, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let (log, _) = RaftLog::open(temp_dir.path()).await.unwrap();

        let transport: Arc<dyn RaftTransport> =
            Arc::new(InMemoryTransport::new(NodeId::new("n1"), HashMap::new()));

        let recovered = RecoveredState {
            hard_state: HardState::default(),
            log,
            hard_state_store: HardStateStore::new(temp_dir.path()),
            snapshots: SnapshotStore::new(temp_dir.path()),
            snapshot_index: LogIndex::ZERO,
            configuration,
            configuration_index: LogIndex::ZERO,
        };
        let meter = Arc::new(skein_observe::NoopMeter);
        let state = RaftState::new(NodeId::new("n1"), RaftConfig::default(), recovered, transport, meter);
        (state, temp_dir)
    }

    fn append_request(term: u64, prev: u64, prev_term: u64, entries: Vec<LogEntry>, commit: u64) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term: Term(term),
            leader_id: NodeId::new("n2"),
            prev_log_index: LogIndex(prev),
            prev_log_term: Term(prev_term),
            entries,
            leader_commit: LogIndex(commit),
        }
    }

    fn blank(term: u64, index: u64) -> LogEntry {
        LogEntry::new(Term(term), LogIndex(index), EntryPayload::Blank)
    }

    #[tokio::test]
    async fn test_raft_state_initial_state() {
        let (state, _temp) = create_test_state(three_members()).await;

        assert_eq!(state.role(), LeadershipState::Follower);
        assert_eq!(state.current_term(), Term::ZERO);
        assert_eq!(state.leader(), None);
        assert!(state.is_voter());
        assert!(!state.has_existing_state().await);
    }

    #[tokio::test]
    async fn test_raft_state_handle_request_vote_grants_and_persists() {
        let (state, temp) = create_test_state(three_members()).await;

        let request = RequestVoteRequest {
            term: Term(5),
            candidate_id: NodeId::new("n2"),
            last_log_index: LogIndex::ZERO,
            last_log_term: Term::ZERO,
        };

        let response = state.handle_request_vote(request).await.unwrap();
        assert!(response.vote_granted);
        assert_eq!(response.term, Term(5));

        let persisted = HardStateStore::new(temp.path()).load().unwrap().unwrap();
        assert_eq!(persisted.current_term, Term(5));
        assert_eq!(persisted.voted_for, Some(NodeId::new("n2")));
    }

    #[tokio::test]
    async fn test_raft_state_votes_once_per_term() {
        let (state, _temp) = create_test_state(three_members()).await;

        let vote = |candidate: &str| RequestVoteRequest {
            term: Term(2),
            candidate_id: NodeId::new(candidate),
            last_log_index: LogIndex::ZERO,
            last_log_term: Term::ZERO,
        };

        assert!(state.handle_request_vote(vote("n2")).await.unwrap().vote_granted);
        assert!(!state.handle_request_vote(vote("n3")).await.unwrap().vote_granted);
        // Re-asking by the same candidate is idempotent
        assert!(state.handle_request_vote(vote("n2")).await.unwrap().vote_granted);
    }

    #[tokio::test]
    async fn test_raft_state_handle_request_vote_rejects_stale_term() {
        let (state, _temp) = create_test_state(three_members()).await;
        state.set_current_term(Term(10));

        let request = RequestVoteRequest {
            term: Term(5),
            candidate_id: NodeId::new("n2"),
            last_log_index: LogIndex::ZERO,
            last_log_term: Term::ZERO,
        };

        let response = state.handle_request_vote(request).await.unwrap();
        assert!(!response.vote_granted);
        assert_eq!(response.term, Term(10));
    }

    #[tokio::test]
    async fn test_raft_state_rejects_candidate_with_stale_log() {
        let (state, _temp) = create_test_state(three_members()).await;
        state
            .handle_append_entries(append_request(3, 0, 0, vec![blank(3, 1)], 0))
            .await
            .unwrap();

        let request = RequestVoteRequest {
            term: Term(4),
            candidate_id: NodeId::new("n3"),
            last_log_index: LogIndex(5),
            last_log_term: Term(2),
        };
        assert!(!state.handle_request_vote(request).await.unwrap().vote_granted);
    }

    #[tokio::test]
    async fn test_append_entries_sets_leader_and_commit() {
        let (state, _temp) = create_test_state(three_members()).await;
        let mut leadership = state.subscribe_leadership();

        let response = state
            .handle_append_entries(append_request(1, 0, 0, vec![blank(1, 1), blank(1, 2)], 1))
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(response.last_log_index, LogIndex(2));
        assert_eq!(state.commit_index(), LogIndex(1));
        assert_eq!(state.leader(), Some(NodeId::new("n2")));
        assert!(leadership.has_changed().unwrap());
        assert_eq!(leadership.borrow_and_update().leader, Some(NodeId::new("n2")));
        assert!(state.check_freshness().is_ok());
    }

    #[tokio::test]
    async fn test_append_entries_rejects_gap_with_hint() {
        let (state, _temp) = create_test_state(three_members()).await;

        let response = state
            .handle_append_entries(append_request(1, 5, 1, vec![blank(1, 6)], 0))
            .await
            .unwrap();

        assert!(!response.success);
        assert_eq!(response.conflict_index, Some(LogIndex(1)));
    }

    #[tokio::test]
    async fn test_append_entries_truncates_conflicting_suffix() {
        let (state, _temp) = create_test_state(three_members()).await;
        state
            .handle_append_entries(append_request(1, 0, 0, vec![blank(1, 1), blank(1, 2), blank(1, 3)], 1))
            .await
            .unwrap();

        let response = state
            .handle_append_entries(append_request(2, 1, 1, vec![blank(2, 2)], 1))
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(state.log_ref().last_index().await, LogIndex(2));
        assert_eq!(state.log_ref().term_at(LogIndex(2)).await, Some(Term(2)));
    }

    #[tokio::test]
    async fn test_duplicate_append_does_not_truncate() {
        let (state, _temp) = create_test_state(three_members()).await;
        state
            .handle_append_entries(append_request(1, 0, 0, vec![blank(1, 1), blank(1, 2)], 0))
            .await
            .unwrap();

        // A delayed copy of an older request must not drop entry 2
        state
            .handle_append_entries(append_request(1, 0, 0, vec![blank(1, 1)], 0))
            .await
            .unwrap();
        assert_eq!(state.log_ref().last_index().await, LogIndex(2));
    }

    #[tokio::test]
    async fn test_membership_entry_takes_effect_on_append() {
        let single = ClusterConfiguration::single(NodeId::new("n2"), ServerAddress::new("n2:9125"));
        let (state, _temp) = create_test_state(ClusterConfiguration::empty()).await;
        assert!(!state.is_voter());

        let grown = single
            .with_member(Member::new(NodeId::new("n1"), ServerAddress::new("n1:9125")))
            .unwrap();
        state
            .handle_append_entries(append_request(
                1,
                0,
                0,
                vec![
                    LogEntry::new(Term(1), LogIndex(1), EntryPayload::Membership(single.clone())),
                    LogEntry::new(Term(1), LogIndex(2), EntryPayload::Membership(grown.clone())),
                ],
                1,
            ))
            .await
            .unwrap();

        assert!(state.is_voter());
        assert_eq!(state.configuration(), grown);
        assert_eq!(state.configuration_index(), LogIndex(2));
        assert_eq!(state.committed_configuration().await, single);
    }

    #[tokio::test]
    async fn test_bootstrap_only_once() {
        let (state, _temp) = create_test_state(ClusterConfiguration::empty()).await;
        let config = ClusterConfiguration::single(NodeId::new("n1"), ServerAddress::new("n1:9125"));

        state.bootstrap(config.clone()).await.unwrap();
        assert_eq!(state.current_term(), Term(1));
        assert_eq!(state.commit_index(), LogIndex(1));
        assert_eq!(state.committed_configuration().await, config);

        assert!(matches!(
            state.bootstrap(config).await,
            Err(RaftError::AlreadyBootstrapped { .. })
        ));
    }

    #[tokio::test]
    async fn test_election_and_leadership_publication() {
        let (state, _temp) = create_test_state(three_members()).await;
        let mut leadership = state.subscribe_leadership();

        let term = state.start_election().unwrap();
        assert_eq!(leadership.borrow_and_update().state, LeadershipState::Candidate);

        assert!(state.become_leader(term).await.unwrap());
        let current = leadership.borrow_and_update().clone();
        assert!(current.is_leader());
        assert_eq!(current.term, term);
        assert_eq!(current.leader, Some(NodeId::new("n1")));

        // Blank entry appended for the new term
        assert_eq!(state.log_ref().last_term().await, term);

        // Without quorum contact the lease is not valid
        assert!(state.check_freshness().is_err());

        state.step_down(term.next()).unwrap();
        assert_eq!(leadership.borrow_and_update().state, LeadershipState::Follower);
    }

    #[tokio::test]
    async fn test_stale_election_win_ignored() {
        let (state, _temp) = create_test_state(three_members()).await;
        let term = state.start_election().unwrap();
        state.step_down(term.next()).unwrap();
        assert!(!state.become_leader(term).await.unwrap());
        assert_eq!(state.role(), LeadershipState::Follower);
    }

    #[tokio::test]
    async fn test_append_as_leader_requires_leadership() {
        let (state, _temp) = create_test_state(three_members()).await;
        assert!(matches!(
            state.append_as_leader(EntryPayload::Blank).await,
            Err(RaftError::NotLeader { .. })
        ));
    }

    #[tokio::test]
    async fn test_mark_stopped_publishes_follower() {
        let (state, _temp) = create_test_state(three_members()).await;
        let term = state.start_election().unwrap();
        state.become_leader(term).await.unwrap();

        let rx = state.subscribe_leadership();
        state.mark_stopped();
        assert!(!rx.borrow().is_leader());
        assert!(state.start_election().is_err());
    }
}
