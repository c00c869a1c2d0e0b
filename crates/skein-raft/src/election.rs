//! Leader election.
//!
//! - A follower whose election timer fires becomes a candidate, but only if
//!   it is a voter in its latest configuration and has not heard from a
//!   leader recently. A node that is still joining never campaigns.
//! - Candidates request votes from every other voter in parallel and win as
//!   soon as a majority of the configuration has granted.
//! - Split votes time out and retry with a new term; randomized timeouts make
//!   repeats unlikely.

use crate::config::RaftConfig;
use crate::error::Result;
use crate::state::RaftState;
use crate::transport::RaftTransport;
use crate::types::*;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::timeout;

/// Election result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// Won election (caller should become leader)
    Won { term: Term, votes_received: usize },

    /// Lost election (discovered higher term or another leader)
    Lost { current_term: Term },

    /// Not enough votes before every peer answered or timed out
    Timeout,
}

/// Run an election as a candidate.
///
/// Increments the term, votes for self, then collects votes until a majority
/// is reached, a higher term is seen, or all requests have finished.
pub async fn run_election(
    state: Arc<RaftState>,
    config: &RaftConfig,
    transport: Arc<dyn RaftTransport>,
) -> Result<ElectionOutcome> {
    let term = state.start_election()?;
    let configuration = state.configuration();
    let node_id = state.node_id().clone();

    let mut votes_received = HashSet::new();
    votes_received.insert(node_id.clone());

    // A lone voter elects itself
    if configuration.has_quorum(&votes_received) {
        return Ok(ElectionOutcome::Won {
            term,
            votes_received: votes_received.len(),
        });
    }

    let last_log_index = state.log_ref().last_index().await;
    let last_log_term = state.log_ref().last_term().await;

    let mut pending: FuturesUnordered<_> = configuration
        .voter_ids()
        .into_iter()
        .filter(|peer| peer != &node_id)
        .map(|peer| {
            let transport = transport.clone();
            let request = RequestVoteRequest {
                term,
                candidate_id: node_id.clone(),
                last_log_index,
                last_log_term,
            };
            let rpc_timeout = config.rpc_timeout;
            async move {
                let result = timeout(rpc_timeout, transport.request_vote(&peer, request)).await;
                (peer, result)
            }
        })
        .collect();

    while let Some((peer, result)) = pending.next().await {
        match result {
            Ok(Ok(response)) => {
                if response.term > term {
                    state.step_down(response.term)?;
                    return Ok(ElectionOutcome::Lost {
                        current_term: response.term,
                    });
                }

                if response.vote_granted {
                    tracing::debug!(term = %term, voter = %peer, "Vote granted");
                    votes_received.insert(peer);
                    if configuration.has_quorum(&votes_received) {
                        return Ok(ElectionOutcome::Won {
                            term,
                            votes_received: votes_received.len(),
                        });
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::trace!(peer = %peer, error = %e, "RequestVote failed");
            }
            Err(_) => {
                tracing::trace!(peer = %peer, "RequestVote timed out");
            }
        }

        // Someone else won, or a higher term showed up through an RPC
        let current_term = state.current_term();
        if current_term != term || state.role() != LeadershipState::Candidate {
            return Ok(ElectionOutcome::Lost { current_term });
        }
    }

    Ok(ElectionOutcome::Timeout)
}

/// Election loop (runs for the lifetime of the engine).
///
/// Waits for election timeouts and campaigns when this node is an eligible
/// voter without a live leader.
pub async fn election_loop(
    state: Arc<RaftState>,
    config: RaftConfig,
    transport: Arc<dyn RaftTransport>,
    mut timeout_rx: tokio::sync::mpsc::Receiver<()>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            fired = timeout_rx.recv() => {
                if fired.is_none() {
                    break;
                }
                if state.role() == LeadershipState::Leader {
                    continue;
                }
                if !state.is_voter() {
                    tracing::trace!("Not a voter yet; skipping election");
                    continue;
                }
                if state.heard_from_leader_within(config.election_timeout_min) {
                    continue;
                }

                match run_election(state.clone(), &config, transport.clone()).await {
                    Ok(ElectionOutcome::Won { term, votes_received }) => {
                        tracing::info!(
                            term = %term,
                            votes = votes_received,
                            "Won election, becoming leader"
                        );
                        if let Err(e) = state.become_leader(term).await {
                            tracing::error!(error = %e, "Failed to become leader");
                        }
                    }
                    Ok(ElectionOutcome::Lost { current_term }) => {
                        tracing::debug!(term = %current_term, "Lost election");
                    }
                    Ok(ElectionOutcome::Timeout) => {
                        tracing::debug!("Election timed out (split vote), will retry");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Election error");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("Election loop shutting down");
                break;
            }
        }
    }
}

/// Check if candidate's log is at least as up-to-date as ours.
///
/// A later last term wins; with equal last terms the longer log wins.
pub fn is_log_up_to_date(
    candidate_last_term: Term,
    candidate_last_index: LogIndex,
    our_last_term: Term,
    our_last_index: LogIndex,
) -> bool {
    candidate_last_term > our_last_term
        || (candidate_last_term == our_last_term && candidate_last_index >= our_last_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hard_state::{HardState, HardStateStore};
    use crate::log::RaftLog;
    use crate::snapshot::SnapshotStore;
    use crate::state::RecoveredState;
    use crate::transport::{InMemoryTransport, RpcMessage};
    use std::collections::HashMap;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    async fn create_test_state(
        configuration: ClusterConfiguration,
        transport: Arc<dyn RaftTransport>,
    ) -> (Arc<RaftState>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let (log, _) = RaftLog::open(temp_dir.path()).await.unwrap();
        let recovered = RecoveredState {
            hard_state: HardState::default(),
            log,
            hard_state_store: HardStateStore::new(temp_dir.path()),
            snapshots: SnapshotStore::new(temp_dir.path()),
            snapshot_index: LogIndex::ZERO,
            configuration,
            configuration_index: LogIndex::ZERO,
        };
        let state = RaftState::new(
            NodeId::new("n1"),
            RaftConfig::default(),
            recovered,
            transport,
            Arc::new(skein_observe::NoopMeter),
        );
        (Arc::new(state), temp_dir)
    }

    /// Answer every RequestVote on `rx` with the given grant and term.
    fn spawn_voter(mut rx: mpsc::Receiver<RpcMessage>, grant: bool, term: Option<Term>) {
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let RpcMessage::RequestVote { request, response_tx } = msg {
                    let _ = response_tx.send(RequestVoteResponse {
                        term: term.unwrap_or(request.term),
                        vote_granted: grant,
                    });
                }
            }
        });
    }

    fn config_of(ids: &[&str]) -> ClusterConfiguration {
        let mut members = ClusterConfiguration::empty();
        for id in ids {
            members = members
                .with_member(Member::new(NodeId::new(*id), ServerAddress::new(format!("{}:1", id))))
                .unwrap();
        }
        members
    }

    #[test]
    fn test_is_log_up_to_date() {
        assert!(is_log_up_to_date(Term(2), LogIndex(1), Term(1), LogIndex(10)));
        assert!(is_log_up_to_date(Term(2), LogIndex(5), Term(2), LogIndex(5)));
        assert!(!is_log_up_to_date(Term(2), LogIndex(4), Term(2), LogIndex(5)));
        assert!(!is_log_up_to_date(Term(1), LogIndex(99), Term(2), LogIndex(1)));
    }

    #[tokio::test]
    async fn test_single_voter_wins_immediately() {
        let transport: Arc<dyn RaftTransport> =
            Arc::new(InMemoryTransport::new(NodeId::new("n1"), HashMap::new()));
        let (state, _temp) = create_test_state(config_of(&["n1"]), transport.clone()).await;

        let outcome = run_election(state, &RaftConfig::default(), transport).await.unwrap();
        assert_eq!(
            outcome,
            ElectionOutcome::Won {
                term: Term(1),
                votes_received: 1
            }
        );
    }

    #[tokio::test]
    async fn test_wins_with_majority() {
        let (tx2, rx2) = mpsc::channel(8);
        let (tx3, rx3) = mpsc::channel(8);
        spawn_voter(rx2, true, None);
        spawn_voter(rx3, false, None);

        let mut peers = HashMap::new();
        peers.insert(NodeId::new("n2"), tx2);
        peers.insert(NodeId::new("n3"), tx3);
        let transport: Arc<dyn RaftTransport> = Arc::new(InMemoryTransport::new(NodeId::new("n1"), peers));
        let (state, _temp) = create_test_state(config_of(&["n1", "n2", "n3"]), transport.clone()).await;

        let outcome = run_election(state, &RaftConfig::default(), transport).await.unwrap();
        assert!(matches!(outcome, ElectionOutcome::Won { votes_received: 2, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_peers_time_out() {
        // n2 and n3 are in the configuration but have no route
        let transport: Arc<dyn RaftTransport> =
            Arc::new(InMemoryTransport::new(NodeId::new("n1"), HashMap::new()));
        let (state, _temp) = create_test_state(config_of(&["n1", "n2", "n3"]), transport.clone()).await;

        let outcome = run_election(state.clone(), &RaftConfig::default(), transport).await.unwrap();
        assert_eq!(outcome, ElectionOutcome::Timeout);
        assert_eq!(state.role(), LeadershipState::Candidate);
    }

    #[tokio::test]
    async fn test_higher_term_response_steps_down() {
        let (tx2, rx2) = mpsc::channel(8);
        spawn_voter(rx2, false, Some(Term(9)));

        let mut peers = HashMap::new();
        peers.insert(NodeId::new("n2"), tx2);
        let transport: Arc<dyn RaftTransport> = Arc::new(InMemoryTransport::new(NodeId::new("n1"), peers));
        let (state, _temp) = create_test_state(config_of(&["n1", "n2", "n3"]), transport.clone()).await;

        let outcome = run_election(state.clone(), &RaftConfig::default(), transport).await.unwrap();
        assert_eq!(outcome, ElectionOutcome::Lost { current_term: Term(9) });
        assert_eq!(state.role(), LeadershipState::Follower);
        assert_eq!(state.current_term(), Term(9));
    }
}
