//! RPC handler loop for processing incoming Raft RPCs.
//!
//! ```text
//! Transport receives RPC → RpcMessage → rpc_handler_loop
//!     ↓
//! RaftState::handle_XXX
//!     ↓
//! Response back via oneshot channel
//! ```
//!
//! Messages are handled one at a time so log mutations from the leader are
//! applied in arrival order.

use crate::snapshot::StateMachine;
use crate::state::RaftState;
use crate::timer::ElectionTimer;
use crate::transport::{RpcMessage, RpcReceiver};
use std::sync::Arc;
use tokio::sync::broadcast;

/// RPC handler loop.
///
/// Exits on the shutdown signal or when every transport sender is dropped.
pub async fn rpc_handler_loop(
    state: Arc<RaftState>,
    state_machine: Arc<dyn StateMachine>,
    mut rpc_rx: RpcReceiver,
    election_timer: Arc<ElectionTimer>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            msg = rpc_rx.recv() => {
                match msg {
                    Some(msg) => {
                        handle_rpc_message(&state, state_machine.as_ref(), &election_timer, msg).await;
                    }
                    None => {
                        tracing::debug!("RPC channel closed, exiting handler loop");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("RPC handler loop shutting down");
                break;
            }
        }
    }
}

/// Dispatch a single RPC message to its handler.
///
/// On handler error the reply channel is dropped; the sender sees a
/// transport error and retries on its next round.
async fn handle_rpc_message(
    state: &Arc<RaftState>,
    state_machine: &dyn StateMachine,
    election_timer: &ElectionTimer,
    msg: RpcMessage,
) {
    match msg {
        RpcMessage::RequestVote { request, response_tx } => {
            match state.handle_request_vote(request).await {
                Ok(resp) => {
                    if resp.vote_granted {
                        election_timer.reset();
                    }
                    let _ = response_tx.send(resp);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to handle RequestVote");
                }
            }
        }

        RpcMessage::AppendEntries { request, response_tx } => {
            let request_term = request.term;
            match state.handle_append_entries(request).await {
                Ok(resp) => {
                    // Any current-term AppendEntries comes from the live leader
                    if resp.term == request_term {
                        election_timer.reset();
                    }
                    let _ = response_tx.send(resp);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to handle AppendEntries");
                }
            }
        }

        RpcMessage::InstallSnapshot { request, response_tx } => {
            let request_term = request.term;
            match state.handle_install_snapshot(request, state_machine).await {
                Ok(resp) => {
                    if resp.term == request_term {
                        election_timer.reset();
                    }
                    let _ = response_tx.send(resp);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to handle InstallSnapshot");
                }
            }
        }
    }
}
