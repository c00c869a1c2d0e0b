//! Replicated ingestion state machine.
//!
//! Every node applies the same committed `IngestCommand`s in log order. A
//! per-source watermark (highest sequence applied) makes apply idempotent:
//! records at or below the watermark are skipped, so a record that was
//! proposed twice (re-delivery, leadership change) is persisted once.
//!
//! Snapshots carry the stored records alongside the watermarks. A follower
//! that catches up from a snapshot re-inserts them into its own store before
//! adopting the watermarks, since it never applied the compacted entries.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use skein_observe::{obs_count, obs_gauge, IngestEvt, IngestKind, Meter, ObsEvent};
use skein_raft::{LogIndex, RaftError, StateMachine};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::IngestError;
use crate::record::{IngestCommand, IngestedRecord};
use crate::store::{InsertOutcome, RecordStore};

/// Bounded exponential retry for store inserts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// A record given up on after every retry failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistFailureRecord {
    pub index: u64,
    pub source: String,
    pub sequence: u64,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct IngestState {
    watermarks: BTreeMap<String, u64>,
    failures: Vec<PersistFailureRecord>,
}

#[derive(Serialize, Deserialize)]
struct IngestSnapshot {
    state: IngestState,
    records: Vec<IngestedRecord>,
}

pub struct IngestStateMachine {
    store: Arc<dyn RecordStore>,
    state: RwLock<IngestState>,
    retry: RetryPolicy,
    meter: Arc<dyn Meter>,
}

impl IngestStateMachine {
    pub fn new(store: Arc<dyn RecordStore>, retry: RetryPolicy, meter: Arc<dyn Meter>) -> Self {
        Self {
            store,
            state: RwLock::new(IngestState::default()),
            retry,
            meter,
        }
    }

    /// Highest applied sequence for `source`.
    pub fn watermark(&self, source: &str) -> Option<u64> {
        self.state.read().watermarks.get(source).copied()
    }

    pub fn watermarks(&self) -> BTreeMap<String, u64> {
        self.state.read().watermarks.clone()
    }

    pub fn failures(&self) -> Vec<PersistFailureRecord> {
        self.state.read().failures.clone()
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    async fn apply_record(&self, index: LogIndex, record: IngestedRecord) {
        if let Some(mark) = self.watermark(&record.source) {
            if record.sequence <= mark {
                tracing::debug!(
                    source = %record.source,
                    sequence = record.sequence,
                    watermark = mark,
                    "Skipping already applied record"
                );
                obs_count!(self.meter, "skein_apply_duplicates_total", &[], 1);
                return;
            }
        }

        match self.persist_with_retry(&record).await {
            Ok(InsertOutcome::Inserted) => {
                obs_count!(self.meter, "skein_records_persisted_total", &[], 1);
            }
            Ok(InsertOutcome::Duplicate) => {
                // Replay after restart: the store already has it.
                obs_count!(self.meter, "skein_apply_duplicates_total", &[], 1);
            }
            Err(IngestError::PersistFailure {
                source_id,
                sequence,
                attempts,
                reason,
            }) => {
                tracing::error!(
                    index = %index,
                    source = %source_id,
                    sequence,
                    attempts,
                    reason = %reason,
                    "Record could not be persisted, giving up"
                );
                obs_count!(self.meter, "skein_persist_failures_total", &[], 1);
                self.meter.emit(ObsEvent::Ingest(IngestEvt {
                    source: source_id.clone(),
                    kind: IngestKind::PersistAlarm { sequence, attempts },
                }));
                self.state.write().failures.push(PersistFailureRecord {
                    index: index.as_u64(),
                    source: source_id,
                    sequence,
                    attempts,
                    reason,
                });
            }
            Err(other) => {
                tracing::error!(index = %index, error = %other, "Unexpected persist error");
            }
        }

        let mut state = self.state.write();
        let mark = state.watermarks.entry(record.source).or_insert(0);
        *mark = (*mark).max(record.sequence);
        obs_gauge!(self.meter, "skein_watermark_sources", &[], state.watermarks.len());
    }

    async fn persist_with_retry(
        &self,
        record: &IngestedRecord,
    ) -> Result<InsertOutcome, IngestError> {
        let mut attempt = 1;
        loop {
            match self.store.insert(record).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempt >= self.retry.attempts => {
                    return Err(IngestError::PersistFailure {
                        source_id: record.source.clone(),
                        sequence: record.sequence,
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        source = %record.source,
                        sequence = record.sequence,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Store insert failed, retrying"
                    );
                    obs_count!(self.meter, "skein_persist_retries_total", &[], 1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl StateMachine for IngestStateMachine {
    async fn apply(&self, index: LogIndex, command: &[u8]) -> skein_raft::Result<()> {
        match IngestCommand::decode(command)? {
            IngestCommand::Record(record) => self.apply_record(index, record).await,
        }
        Ok(())
    }

    async fn snapshot(&self) -> skein_raft::Result<Bytes> {
        let state = self.state.read().clone();
        let records = self
            .store
            .records()
            .await
            .map_err(|e| RaftError::SnapshotFailed {
                reason: format!("reading record store: {}", e),
            })?;
        let snapshot = IngestSnapshot { state, records };
        Ok(Bytes::from(bincode::serialize(&snapshot)?))
    }

    async fn restore(&self, data: &[u8]) -> skein_raft::Result<()> {
        let snapshot: IngestSnapshot =
            bincode::deserialize(data).map_err(|e| RaftError::SnapshotFailed {
                reason: format!("invalid ingest snapshot: {}", e),
            })?;

        let mut inserted = 0usize;
        for record in &snapshot.records {
            match self.persist_with_retry(record).await {
                Ok(InsertOutcome::Inserted) => inserted += 1,
                Ok(InsertOutcome::Duplicate) => {}
                Err(e) => {
                    return Err(RaftError::SnapshotFailed {
                        reason: format!("re-persisting snapshot records: {}", e),
                    });
                }
            }
        }
        if inserted > 0 {
            obs_count!(self.meter, "skein_records_persisted_total", &[], inserted as u64);
        }

        tracing::info!(
            sources = snapshot.state.watermarks.len(),
            failures = snapshot.state.failures.len(),
            records = snapshot.records.len(),
            inserted,
            "Restored ingest state from snapshot"
        );
        *self.state.write() = snapshot.state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::MemoryRecordStore;
    use skein_observe::NoopMeter;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn command(source: &str, sequence: u64) -> Vec<u8> {
        IngestCommand::Record(IngestedRecord::new(source, sequence, format!("m{}", sequence)))
            .encode()
            .unwrap()
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    /// Fails the first `failures` inserts, then delegates.
    struct FlakyStore {
        inner: MemoryRecordStore,
        failures: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl RecordStore for FlakyStore {
        async fn insert(&self, record: &IngestedRecord) -> Result<InsertOutcome, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("down".to_string()));
            }
            self.inner.insert(record).await
        }

        async fn contains(&self, source: &str, sequence: u64) -> Result<bool, StoreError> {
            self.inner.contains(source, sequence).await
        }

        async fn len(&self) -> Result<usize, StoreError> {
            self.inner.len().await
        }

        async fn records(&self) -> Result<Vec<IngestedRecord>, StoreError> {
            self.inner.records().await
        }
    }

    #[test]
    fn test_backoff_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(10), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_apply_is_idempotent_per_sequence() {
        let store = Arc::new(MemoryRecordStore::new());
        let sm = IngestStateMachine::new(store.clone(), fast_retry(3), Arc::new(NoopMeter));

        sm.apply(LogIndex(1), &command("feed", 1)).await.unwrap();
        sm.apply(LogIndex(2), &command("feed", 2)).await.unwrap();
        sm.apply(LogIndex(3), &command("feed", 2)).await.unwrap();
        sm.apply(LogIndex(4), &command("feed", 1)).await.unwrap();
        sm.apply(LogIndex(5), &command("other", 1)).await.unwrap();

        assert_eq!(store.len().await.unwrap(), 3);
        assert_eq!(sm.watermark("feed"), Some(2));
        assert_eq!(sm.watermark("other"), Some(1));
    }

    #[tokio::test]
    async fn test_replay_after_restart_does_not_duplicate() {
        let store = Arc::new(MemoryRecordStore::new());
        let first = IngestStateMachine::new(store.clone(), fast_retry(3), Arc::new(NoopMeter));
        first.apply(LogIndex(1), &command("feed", 1)).await.unwrap();
        let snapshot = first.snapshot().await.unwrap();
        first.apply(LogIndex(2), &command("feed", 2)).await.unwrap();

        // Crash after I2 was persisted but before the next snapshot.
        let second = IngestStateMachine::new(store.clone(), fast_retry(3), Arc::new(NoopMeter));
        second.restore(&snapshot).await.unwrap();
        assert_eq!(second.watermark("feed"), Some(1));
        second.apply(LogIndex(2), &command("feed", 2)).await.unwrap();

        assert_eq!(store.len().await.unwrap(), 2);
        assert_eq!(second.watermark("feed"), Some(2));
    }

    #[tokio::test]
    async fn test_transient_store_failure_is_retried() {
        let store = Arc::new(FlakyStore {
            inner: MemoryRecordStore::new(),
            failures: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        });
        let sm = IngestStateMachine::new(store.clone(), fast_retry(5), Arc::new(NoopMeter));

        sm.apply(LogIndex(1), &command("feed", 7)).await.unwrap();

        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert!(store.contains("feed", 7).await.unwrap());
        assert!(sm.failures().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_raise_alarm_and_advance() {
        let store = Arc::new(FlakyStore {
            inner: MemoryRecordStore::new(),
            failures: AtomicU32::new(3),
            calls: AtomicU32::new(0),
        });
        let sm = IngestStateMachine::new(store.clone(), fast_retry(3), Arc::new(NoopMeter));

        sm.apply(LogIndex(4), &command("feed", 9)).await.unwrap();

        let failures = sm.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].index, 4);
        assert_eq!(failures[0].sequence, 9);
        assert_eq!(failures[0].attempts, 3);
        assert_eq!(sm.watermark("feed"), Some(9));
        assert!(!store.contains("feed", 9).await.unwrap());

        // Later records are not blocked.
        sm.apply(LogIndex(5), &command("feed", 10)).await.unwrap();
        assert!(store.contains("feed", 10).await.unwrap());

        // Failures travel with snapshots.
        let snapshot = sm.snapshot().await.unwrap();
        let restored =
            IngestStateMachine::new(Arc::new(MemoryRecordStore::new()), fast_retry(3), Arc::new(NoopMeter));
        restored.restore(&snapshot).await.unwrap();
        assert_eq!(restored.failures(), failures);
    }

    #[tokio::test]
    async fn test_restore_repersists_snapshot_records() {
        let leader_store = Arc::new(MemoryRecordStore::new());
        let leader = IngestStateMachine::new(leader_store.clone(), fast_retry(3), Arc::new(NoopMeter));
        for seq in 1..=5 {
            leader.apply(LogIndex(seq), &command("feed", seq)).await.unwrap();
        }
        let snapshot = leader.snapshot().await.unwrap();

        // Follower already holds the first record from before it fell behind.
        let follower_store = Arc::new(MemoryRecordStore::new());
        let follower =
            IngestStateMachine::new(follower_store.clone(), fast_retry(3), Arc::new(NoopMeter));
        follower.apply(LogIndex(1), &command("feed", 1)).await.unwrap();

        follower.restore(&snapshot).await.unwrap();

        assert_eq!(follower.watermark("feed"), Some(5));
        assert_eq!(
            follower_store.records().await.unwrap(),
            leader_store.records().await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_restore_fails_when_store_is_down() {
        let leader = IngestStateMachine::new(
            Arc::new(MemoryRecordStore::new()),
            fast_retry(3),
            Arc::new(NoopMeter),
        );
        leader.apply(LogIndex(1), &command("feed", 1)).await.unwrap();
        let snapshot = leader.snapshot().await.unwrap();

        let store = Arc::new(FlakyStore {
            inner: MemoryRecordStore::new(),
            failures: AtomicU32::new(10),
            calls: AtomicU32::new(0),
        });
        let follower = IngestStateMachine::new(store, fast_retry(2), Arc::new(NoopMeter));

        assert!(follower.restore(&snapshot).await.is_err());
        // Watermarks are not adopted without the records behind them.
        assert_eq!(follower.watermark("feed"), None);
    }

    #[tokio::test]
    async fn test_undecodable_command_is_an_error() {
        let sm = IngestStateMachine::new(
            Arc::new(MemoryRecordStore::new()),
            fast_retry(1),
            Arc::new(NoopMeter),
        );
        assert!(sm.apply(LogIndex(1), &[0xff; 3]).await.is_err());
        assert!(sm.restore(b"garbage").await.is_err());
    }
}
