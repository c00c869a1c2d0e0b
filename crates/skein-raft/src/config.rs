//! Raft configuration (timeouts, limits, tuning parameters).

use std::time::Duration;

/// Raft configuration.
///
/// Controls election timeouts, heartbeat intervals, membership and shutdown
/// bounds, and the snapshot trigger.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Heartbeat interval (leader → followers).
    ///
    /// Leader sends AppendEntries (heartbeat or real entries) at this interval.
    /// Must be < election_timeout_min to prevent spurious elections.
    ///
    /// Default: 150ms
    pub heartbeat_interval: Duration,

    /// Minimum election timeout (follower → candidate).
    ///
    /// If follower doesn't hear from leader within this duration, it starts election.
    /// Randomized between [min, max] to prevent split votes.
    ///
    /// Default: 300ms
    pub election_timeout_min: Duration,

    /// Maximum election timeout.
    ///
    /// Also bounds how long a follower trusts its last leader contact, and how
    /// long a leader keeps its role without hearing from a majority.
    ///
    /// Default: 600ms
    pub election_timeout_max: Duration,

    /// Timeout for a single RPC to a peer.
    ///
    /// Default: 250ms
    pub rpc_timeout: Duration,

    /// Maximum number of entries per AppendEntries RPC.
    ///
    /// Default: 512 entries
    pub max_entries_per_append: usize,

    /// Snapshot trigger: entries applied since the last snapshot.
    ///
    /// Default: 10,000 entries
    pub snapshot_entry_count: u64,

    /// Propose timeout (how long to wait for commit and local apply).
    ///
    /// Default: 5000ms
    pub propose_timeout: Duration,

    /// How long `add_voter` waits for the new configuration to commit.
    ///
    /// Default: 10000ms
    pub membership_timeout: Duration,

    /// Bound on waiting for background tasks during shutdown.
    ///
    /// Default: 5000ms
    pub shutdown_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(150),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            rpc_timeout: Duration::from_millis(250),

            max_entries_per_append: 512,
            snapshot_entry_count: 10_000,

            propose_timeout: Duration::from_millis(5000),
            membership_timeout: Duration::from_millis(10_000),
            shutdown_timeout: Duration::from_millis(5000),
        }
    }
}

impl RaftConfig {
    /// Validate configuration (ensure invariants hold).
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(format!(
                "heartbeat_interval ({:?}) must be < election_timeout_min ({:?})",
                self.heartbeat_interval, self.election_timeout_min
            ));
        }

        if self.election_timeout_min >= self.election_timeout_max {
            return Err(format!(
                "election_timeout_min ({:?}) must be < election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            ));
        }

        if self.rpc_timeout.is_zero() {
            return Err("rpc_timeout must be > 0".to_string());
        }

        if self.max_entries_per_append == 0 {
            return Err("max_entries_per_append must be > 0".to_string());
        }

        if self.snapshot_entry_count == 0 {
            return Err("snapshot_entry_count must be > 0".to_string());
        }

        if self.membership_timeout.is_zero() || self.propose_timeout.is_zero() {
            return Err("propose_timeout and membership_timeout must be > 0".to_string());
        }

        Ok(())
    }

    /// Get randomized election timeout.
    ///
    /// Returns a random duration between [election_timeout_min, election_timeout_max].
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let random_ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        Duration::from_millis(random_ms)
    }
}
