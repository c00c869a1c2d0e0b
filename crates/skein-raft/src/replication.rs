//! Log replication from leader to followers.
//!
//! The leader runs one replication round per heartbeat tick, or sooner when
//! a new entry is appended. Each round:
//! 1. Sends AppendEntries (or InstallSnapshot when the follower needs a
//!    compacted prefix) to every follower in parallel
//! 2. Grants the read lease if a majority acknowledged the round
//! 3. Advances `commit_index` to the highest index stored on a majority with
//!    an entry from the current term
//! 4. Gives up leadership if no majority has answered for an election timeout

use crate::error::{RaftError, Result};
use crate::snapshot::StateMachine;
use crate::state::RaftState;
use crate::transport::RaftTransport;
use crate::types::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{interval, timeout, MissedTickBehavior};

const APPLY_BATCH: usize = 256;

/// Replicate to a single follower.
///
/// Returns true if the follower answered within the current term, whether or
/// not its log matched. That answer counts toward the round's quorum.
pub async fn replicate_to_follower(
    state: &Arc<RaftState>,
    follower: &NodeId,
    transport: &Arc<dyn RaftTransport>,
) -> Result<bool> {
    let term = state.current_term();
    let last_log_index = state.log_ref().last_index().await;

    let next_index = {
        let volatile = state.volatile_state().read();
        match volatile.leader_state.as_ref() {
            Some(ls) => ls
                .next_index
                .get(follower)
                .copied()
                .unwrap_or(last_log_index.next()),
            None => return Ok(false),
        }
    };

    let base_index = state.log_ref().first_index().await.prev().unwrap_or(LogIndex::ZERO);
    let prev_log_index = next_index.prev().unwrap_or(LogIndex::ZERO);

    // Follower needs entries we no longer have
    if next_index <= base_index {
        return send_snapshot(state, follower, transport, term).await;
    }
    let prev_log_term = match state.log_ref().term_at(prev_log_index).await {
        Some(t) => t,
        None => return send_snapshot(state, follower, transport, term).await,
    };

    let entries = state.log_ref().get_range(
        next_index,
        last_log_index.next(),
        state.config().max_entries_per_append,
    ).await;
    let sent = entries.len() as u64;

    let request = AppendEntriesRequest {
        term,
        leader_id: state.node_id().clone(),
        prev_log_index,
        prev_log_term,
        entries,
        leader_commit: state.commit_index(),
    };

    let response = match timeout(
        state.config().rpc_timeout,
        transport.append_entries(follower, request),
    )
    .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            tracing::trace!(follower = %follower, error = %e, "AppendEntries failed");
            return Ok(false);
        }
        Err(_) => {
            tracing::trace!(follower = %follower, "AppendEntries timed out");
            return Ok(false);
        }
    };

    if response.term > term {
        tracing::info!(
            follower = %follower,
            term = %response.term,
            "Follower has higher term, stepping down"
        );
        state.step_down(response.term)?;
        return Ok(false);
    }
    if response.term < term || state.current_term() != term {
        return Ok(false);
    }

    let mut volatile = state.volatile_state().write();
    let Some(leader_state) = volatile.leader_state.as_mut() else {
        return Ok(false);
    };

    if response.success {
        let matched = LogIndex(prev_log_index.0 + sent);
        let current = leader_state.match_index.entry(follower.clone()).or_insert(LogIndex::ZERO);
        if matched > *current {
            *current = matched;
        }
        leader_state.next_index.insert(follower.clone(), current.next());
    } else {
        // Back off using the follower's hint, never below 1
        let hint = response
            .conflict_index
            .unwrap_or(prev_log_index)
            .min(response.last_log_index.next());
        let backed_off = hint.min(next_index.prev().unwrap_or(LogIndex(1))).max(LogIndex(1));
        tracing::debug!(
            follower = %follower,
            next_index = %backed_off,
            "Log mismatch, backing off"
        );
        leader_state.next_index.insert(follower.clone(), backed_off);
    }

    Ok(true)
}

/// Ship the latest snapshot to a follower that fell behind log compaction.
async fn send_snapshot(
    state: &Arc<RaftState>,
    follower: &NodeId,
    transport: &Arc<dyn RaftTransport>,
    term: Term,
) -> Result<bool> {
    let snapshot = state.load_snapshot()?.ok_or_else(|| RaftError::Internal {
        reason: "log compacted but no snapshot on disk".to_string(),
    })?;
    let snapshot_index = snapshot.metadata.last_included_index;

    tracing::info!(
        follower = %follower,
        index = %snapshot_index,
        bytes = snapshot.size(),
        "Sending snapshot"
    );

    let request = InstallSnapshotRequest {
        term,
        leader_id: state.node_id().clone(),
        metadata: snapshot.metadata,
        data: snapshot.data,
    };

    let response = match timeout(
        state.config().rpc_timeout * 4,
        transport.install_snapshot(follower, request),
    )
    .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            tracing::debug!(follower = %follower, error = %e, "InstallSnapshot failed");
            return Ok(false);
        }
        Err(_) => {
            tracing::debug!(follower = %follower, "InstallSnapshot timed out");
            return Ok(false);
        }
    };

    if response.term > term {
        state.step_down(response.term)?;
        return Ok(false);
    }
    if state.current_term() != term {
        return Ok(false);
    }

    let mut volatile = state.volatile_state().write();
    if let Some(leader_state) = volatile.leader_state.as_mut() {
        let current = leader_state.match_index.entry(follower.clone()).or_insert(LogIndex::ZERO);
        if snapshot_index > *current {
            *current = snapshot_index;
        }
        leader_state.next_index.insert(follower.clone(), current.next());
    }
    Ok(true)
}

/// Advance commit index to the highest index replicated on a majority of
/// the latest configuration, provided that entry is from the current term.
///
/// Returns true if commit index was advanced.
pub async fn advance_commit_index(state: &Arc<RaftState>) -> Result<bool> {
    let term = state.current_term();
    let last_log_index = state.log_ref().last_index().await;

    let (mut replicated, quorum, commit_index) = {
        let volatile = state.volatile_state().read();
        let Some(leader_state) = volatile.leader_state.as_ref() else {
            return Ok(false);
        };
        let configuration = &volatile.configuration;
        if configuration.is_empty() {
            return Ok(false);
        }
        let replicated: Vec<LogIndex> = configuration
            .voter_ids()
            .iter()
            .map(|id| {
                if id == state.node_id() {
                    last_log_index
                } else {
                    leader_state.match_index.get(id).copied().unwrap_or(LogIndex::ZERO)
                }
            })
            .collect();
        (replicated, configuration.quorum(), volatile.commit_index)
    };

    replicated.sort_unstable_by(|a, b| b.cmp(a));
    let Some(&candidate) = replicated.get(quorum - 1) else {
        return Ok(false);
    };

    if candidate > commit_index && state.log_ref().term_at(candidate).await == Some(term) {
        tracing::trace!(commit_index = %candidate, "Advanced commit index");
        state.set_commit_index(candidate);
        return Ok(true);
    }
    Ok(false)
}

/// Run one replication round to every follower.
pub async fn replicate_round(state: &Arc<RaftState>, transport: &Arc<dyn RaftTransport>) -> Result<()> {
    let term = state.current_term();
    let round_started = Instant::now();
    let configuration = state.configuration();

    let followers: Vec<NodeId> = configuration
        .voter_ids()
        .into_iter()
        .filter(|id| id != state.node_id())
        .collect();

    let futures = followers.iter().map(|follower| async move {
        let acked = match replicate_to_follower(state, follower, transport).await {
            Ok(acked) => acked,
            Err(e) => {
                tracing::warn!(follower = %follower, error = %e, "Replication error");
                false
            }
        };
        (follower.clone(), acked)
    });
    let results = futures::future::join_all(futures).await;

    if state.role() != LeadershipState::Leader || state.current_term() != term {
        return Ok(());
    }

    let mut acks: HashSet<NodeId> = results
        .into_iter()
        .filter_map(|(id, acked)| acked.then_some(id))
        .collect();
    acks.insert(state.node_id().clone());

    if configuration.has_quorum(&acks) {
        state.record_quorum_contact(term, round_started);
    }

    advance_commit_index(state).await?;
    state.check_leader_quorum();
    Ok(())
}

/// Heartbeat loop (leader only, runs for the lifetime of the engine).
///
/// Idle while this node is not leader.
pub async fn heartbeat_loop(
    state: Arc<RaftState>,
    transport: Arc<dyn RaftTransport>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    let mut ticker = interval(state.config().heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = state.replicate_requested() => {}
            _ = shutdown_rx.recv() => {
                tracing::debug!("Heartbeat loop shutting down");
                break;
            }
        }

        if state.role() != LeadershipState::Leader {
            continue;
        }

        if let Err(e) = replicate_round(&state, &transport).await {
            tracing::error!(error = %e, "Replication round failed");
        }
    }
}

/// Apply committed entries to the state machine in log order.
///
/// Returns the index of the last entry applied.
pub async fn apply_committed(state: &Arc<RaftState>, state_machine: &dyn StateMachine) -> LogIndex {
    let _apply = state.apply_lock().lock().await;

    loop {
        let last_applied = state.last_applied();
        let commit_index = state.commit_index();
        if commit_index <= last_applied {
            return last_applied;
        }

        let entries = state
            .log_ref()
            .get_range(last_applied.next(), commit_index.next(), APPLY_BATCH)
            .await;
        if entries.is_empty() {
            return last_applied;
        }

        for entry in entries {
            if let EntryPayload::Command(command) = &entry.payload {
                if let Err(e) = state_machine.apply(entry.index, command).await {
                    tracing::error!(index = %entry.index, error = %e, "Failed to apply entry");
                }
            }
            state.set_last_applied(entry.index);
        }
    }
}

/// Apply loop: applies entries whenever the commit index moves, and takes
/// a snapshot once enough entries accumulated since the previous one.
pub async fn apply_loop(
    state: Arc<RaftState>,
    state_machine: Arc<dyn StateMachine>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    let mut commit_rx = state.subscribe_commit();
    let threshold = state.config().snapshot_entry_count;

    loop {
        let applied = apply_committed(&state, state_machine.as_ref()).await;

        let last_snapshot = state.volatile_state().read().last_snapshot_index;
        if applied.as_u64().saturating_sub(last_snapshot.as_u64()) >= threshold {
            if let Err(e) = state.take_snapshot(state_machine.as_ref()).await {
                tracing::error!(error = %e, "Snapshot failed");
            }
        }

        tokio::select! {
            changed = commit_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("Apply loop shutting down");
                break;
            }
        }
    }
}
