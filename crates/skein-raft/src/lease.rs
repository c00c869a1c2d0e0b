//! Leader lease.
//!
//! A leader that collected heartbeat acknowledgments from a majority holds a
//! lease for slightly less than the minimum election timeout. No other node
//! can win an election while the lease is valid, so the leader may answer
//! configuration reads from local state without another quorum round.

use crate::config::RaftConfig;
use std::time::{Duration, Instant};

/// Lease state for a Raft leader.
#[derive(Debug, Clone)]
pub struct LeaseState {
    /// When the lease expires
    pub expiry: Option<Instant>,

    /// Lease duration (derived from config)
    duration: Duration,
}

impl LeaseState {
    /// Lease duration is 90% of the minimum election timeout to leave a margin
    /// for clock drift between nodes.
    pub fn new(config: &RaftConfig) -> Self {
        Self {
            expiry: None,
            duration: config.election_timeout_min.mul_f32(0.9),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.expiry.map_or(false, |expiry| Instant::now() < expiry)
    }

    /// Grant or renew the lease, measured from when the heartbeat round started.
    pub fn grant(&mut self, round_started: Instant) {
        let expiry = round_started + self.duration;
        if self.expiry.map_or(true, |current| expiry > current) {
            self.expiry = Some(expiry);
        }
    }

    pub fn revoke(&mut self) {
        self.expiry = None;
    }

    pub fn remaining(&self) -> Option<Duration> {
        let expiry = self.expiry?;
        let now = Instant::now();
        (now < expiry).then(|| expiry - now)
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_initially_invalid() {
        let lease = LeaseState::new(&RaftConfig::default());
        assert!(!lease.is_valid());
        assert_eq!(lease.remaining(), None);
    }

    #[test]
    fn test_lease_grant_and_revoke() {
        let mut lease = LeaseState::new(&RaftConfig::default());
        lease.grant(Instant::now());
        assert!(lease.is_valid());
        assert!(lease.remaining().unwrap() <= lease.duration());

        lease.revoke();
        assert!(!lease.is_valid());
    }

    #[test]
    fn test_lease_duration_below_election_timeout() {
        let config = RaftConfig::default();
        let lease = LeaseState::new(&config);
        assert!(lease.duration() < config.election_timeout_min);
    }

    #[test]
    fn test_stale_round_does_not_shorten_lease() {
        let mut lease = LeaseState::new(&RaftConfig::default());
        let now = Instant::now();
        lease.grant(now);
        let expiry = lease.expiry;
        lease.grant(now - Duration::from_millis(100));
        assert_eq!(lease.expiry, expiry);
    }

    #[test]
    fn test_lease_expires() {
        let mut lease = LeaseState::new(&RaftConfig::default());
        lease.grant(Instant::now() - Duration::from_secs(5));
        assert!(!lease.is_valid());
    }
}
