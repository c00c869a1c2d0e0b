//! Leader-gated ingestion worker.
//!
//! The worker cycles `Idle → Connecting → Streaming → Closing → Idle`. It
//! leaves Idle only while the local engine reports Leader, and it tears the
//! stream down as soon as leadership is lost. Leadership is only a liveness
//! gate: exactly-once persistence is enforced by the replicated state
//! machine's per-source watermark, not by this worker.

use async_trait::async_trait;
use futures_util::StreamExt;
use skein_observe::{obs_count, obs_gauge, IngestEvt, IngestKind, Meter, ObsEvent};
use skein_raft::{Leadership, LogIndex};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::IngestError;
use crate::record::IngestedRecord;
use crate::source::{MessageStream, StreamMessage, StreamSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionWorkerState {
    Idle,
    Connecting,
    Streaming,
    Closing,
}

impl IngestionWorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionWorkerState::Idle => "Idle",
            IngestionWorkerState::Connecting => "Connecting",
            IngestionWorkerState::Streaming => "Streaming",
            IngestionWorkerState::Closing => "Closing",
        }
    }

    fn gauge_value(&self) -> i64 {
        match self {
            IngestionWorkerState::Idle => 0,
            IngestionWorkerState::Connecting => 1,
            IngestionWorkerState::Streaming => 2,
            IngestionWorkerState::Closing => 3,
        }
    }
}

impl fmt::Display for IngestionWorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the worker sends records: the replicated log, in a running node.
#[async_trait]
pub trait RecordSink: Send + Sync {
    fn leadership(&self) -> watch::Receiver<Leadership>;

    /// Highest sequence already applied for `source`.
    fn watermark(&self, source: &str) -> Option<u64>;

    /// Returns once the record is committed and applied.
    async fn submit(&self, record: IngestedRecord) -> Result<LogIndex, IngestError>;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

enum SessionEnd {
    Shutdown,
    LeadershipLost,
    Closed,
    Failed(IngestError),
}

pub struct IngestionWorker {
    source: Arc<dyn StreamSource>,
    sink: Arc<dyn RecordSink>,
    config: WorkerConfig,
    meter: Arc<dyn Meter>,
    state_tx: watch::Sender<IngestionWorkerState>,
}

impl IngestionWorker {
    pub fn new(
        source: Arc<dyn StreamSource>,
        sink: Arc<dyn RecordSink>,
        config: WorkerConfig,
        meter: Arc<dyn Meter>,
    ) -> Self {
        let (state_tx, _) = watch::channel(IngestionWorkerState::Idle);
        Self {
            source,
            sink,
            config,
            meter,
            state_tx,
        }
    }

    pub fn state(&self) -> IngestionWorkerState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<IngestionWorkerState> {
        self.state_tx.subscribe()
    }

    pub fn source_id(&self) -> &str {
        self.source.source_id()
    }

    /// Run until `shutdown` flips to true (or its sender is dropped).
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut leadership = self.sink.leadership();
        let mut backoff = self.config.reconnect_initial;

        tracing::info!(source = %self.source_id(), "Ingestion worker started");

        loop {
            // Idle: block until leader or shutdown.
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                alive = leadership_gained(&mut leadership) => {
                    if !alive {
                        break;
                    }
                }
            }

            self.transition(IngestionWorkerState::Connecting);
            obs_count!(self.meter, "skein_ingest_connects_total", &[], 1);

            let connected = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => {
                    self.transition(IngestionWorkerState::Closing);
                    break;
                }
                _ = leadership_lost(&mut leadership) => {
                    self.transition(IngestionWorkerState::Closing);
                    self.transition(IngestionWorkerState::Idle);
                    continue;
                }
                result = self.source.connect() => result,
            };

            let end = match connected {
                Ok(messages) => {
                    backoff = self.config.reconnect_initial;
                    self.transition(IngestionWorkerState::Streaming);
                    let end = self
                        .stream_session(messages, &mut leadership, &mut shutdown)
                        .await;
                    self.transition(IngestionWorkerState::Closing);
                    end
                }
                Err(e) => {
                    self.transition(IngestionWorkerState::Closing);
                    SessionEnd::Failed(e)
                }
            };
            // The message stream was dropped with the session: connection released.

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::LeadershipLost => {
                    tracing::info!(source = %self.source_id(), "Leadership lost, stream closed");
                    self.transition(IngestionWorkerState::Idle);
                    continue;
                }
                SessionEnd::Closed => {
                    tracing::info!(source = %self.source_id(), "Stream ended");
                }
                SessionEnd::Failed(e) => {
                    tracing::warn!(source = %self.source_id(), error = %e, "Stream failed");
                    obs_count!(self.meter, "skein_ingest_stream_errors_total", &[], 1);
                }
            }

            self.transition(IngestionWorkerState::Idle);

            let delay = backoff;
            backoff = backoff.saturating_mul(2).min(self.config.reconnect_max);
            tracing::debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = leadership_lost(&mut leadership) => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.transition(IngestionWorkerState::Idle);
        tracing::info!(source = %self.source_id(), "Ingestion worker stopped");
    }

    async fn stream_session(
        &self,
        mut messages: MessageStream,
        leadership: &mut watch::Receiver<Leadership>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return SessionEnd::Shutdown,
                _ = leadership_lost(leadership) => return SessionEnd::LeadershipLost,
                next = messages.next() => match next {
                    None => return SessionEnd::Closed,
                    Some(Err(e)) => return SessionEnd::Failed(e),
                    Some(Ok(message)) => message,
                },
            };

            // In-flight submissions are abandoned on shutdown; a committed
            // duplicate is absorbed by the watermark.
            let forwarded = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return SessionEnd::Shutdown,
                result = self.forward(message) => result,
            };

            match forwarded {
                Ok(()) => {}
                Err(IngestError::LeadershipLost { .. }) => return SessionEnd::LeadershipLost,
                Err(e) => return SessionEnd::Failed(e),
            }
        }
    }

    async fn forward(&self, message: StreamMessage) -> Result<(), IngestError> {
        let source = self.source.source_id();

        let Some(sequence) = message.sequence else {
            tracing::warn!(source = %source, "Dropping message without a sequence number");
            obs_count!(self.meter, "skein_ingest_malformed_total", &[], 1);
            return Ok(());
        };

        if let Some(mark) = self.sink.watermark(source) {
            if sequence <= mark {
                tracing::debug!(source = %source, sequence, watermark = mark, "Skipping re-delivered message");
                obs_count!(self.meter, "skein_ingest_skipped_total", &[], 1);
                return Ok(());
            }
        }

        let index = self
            .sink
            .submit(IngestedRecord::new(source, sequence, message.payload))
            .await?;
        tracing::trace!(source = %source, sequence, index = %index, "Record committed");
        obs_count!(self.meter, "skein_ingest_forwarded_total", &[], 1);
        Ok(())
    }

    fn transition(&self, next: IngestionWorkerState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if !changed {
            return;
        }

        tracing::info!(source = %self.source_id(), state = %next, "Ingestion worker transition");
        obs_gauge!(self.meter, "skein_ingest_worker_state", &[], next.gauge_value());
        self.meter.emit(ObsEvent::Ingest(IngestEvt {
            source: self.source_id().to_string(),
            kind: IngestKind::Worker {
                state: next.as_str(),
            },
        }));
    }
}

/// Resolves once shutdown is signalled or the signal's sender is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Resolves `true` once the local node leads, `false` if the engine is gone.
async fn leadership_gained(rx: &mut watch::Receiver<Leadership>) -> bool {
    loop {
        if rx.borrow_and_update().is_leader() {
            return true;
        }
        if rx.changed().await.is_err() {
            return false;
        }
    }
}

async fn leadership_lost(rx: &mut watch::Receiver<Leadership>) {
    loop {
        if !rx.borrow_and_update().is_leader() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use parking_lot::Mutex;
    use skein_observe::NoopMeter;
    use skein_raft::{LeadershipState, NodeId, Term};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn leader(term: u64) -> Leadership {
        Leadership {
            state: LeadershipState::Leader,
            term: Term(term),
            leader: Some(NodeId::new("1")),
        }
    }

    struct TestSink {
        leadership_tx: watch::Sender<Leadership>,
        submitted: Mutex<Vec<IngestedRecord>>,
        watermarks: Mutex<HashMap<String, u64>>,
    }

    impl TestSink {
        fn new() -> Arc<Self> {
            let (leadership_tx, _) = watch::channel(Leadership::follower(Term(1)));
            Arc::new(Self {
                leadership_tx,
                submitted: Mutex::new(Vec::new()),
                watermarks: Mutex::new(HashMap::new()),
            })
        }

        fn sequences(&self) -> Vec<u64> {
            self.submitted.lock().iter().map(|r| r.sequence).collect()
        }
    }

    #[async_trait]
    impl RecordSink for TestSink {
        fn leadership(&self) -> watch::Receiver<Leadership> {
            self.leadership_tx.subscribe()
        }

        fn watermark(&self, source: &str) -> Option<u64> {
            self.watermarks.lock().get(source).copied()
        }

        async fn submit(&self, record: IngestedRecord) -> Result<LogIndex, IngestError> {
            if !self.leadership_tx.borrow().is_leader() {
                return Err(IngestError::LeadershipLost { leader: None });
            }
            self.watermarks
                .lock()
                .insert(record.source.clone(), record.sequence);
            let mut submitted = self.submitted.lock();
            submitted.push(record);
            Ok(LogIndex(submitted.len() as u64))
        }
    }

    /// Replays `payloads` on every connection, then holds it open.
    struct ScriptedSource {
        payloads: Vec<Option<u64>>,
        fail_connects: AtomicU32,
        connects: AtomicU32,
    }

    impl ScriptedSource {
        fn new(payloads: Vec<Option<u64>>) -> Arc<Self> {
            Arc::new(Self {
                payloads,
                fail_connects: AtomicU32::new(0),
                connects: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl StreamSource for ScriptedSource {
        fn source_id(&self) -> &str {
            "feed"
        }

        async fn connect(&self) -> Result<MessageStream, IngestError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fail_connects.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_connects.store(remaining - 1, Ordering::SeqCst);
                return Err(IngestError::StreamConnect {
                    url: "scripted".to_string(),
                    reason: "refused".to_string(),
                });
            }
            let messages: Vec<_> = self
                .payloads
                .iter()
                .map(|seq| {
                    Ok(StreamMessage {
                        sequence: *seq,
                        payload: format!("{:?}", seq),
                    })
                })
                .collect();
            Ok(stream::iter(messages).chain(stream::pending()).boxed())
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            reconnect_initial: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(40),
        }
    }

    async fn wait_for_state(
        rx: &mut watch::Receiver<IngestionWorkerState>,
        target: IngestionWorkerState,
    ) {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == target))
            .await
            .expect("worker did not reach state")
            .expect("worker state channel closed");
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "condition not met");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_worker_streams_only_while_leader() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let sink = TestSink::new();
        let source = ScriptedSource::new(vec![Some(1), Some(2), Some(3)]);
        let worker = Arc::new(IngestionWorker::new(
            source.clone(),
            sink.clone(),
            fast_config(),
            Arc::new(NoopMeter),
        ));
        let mut states = worker.subscribe_state();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.clone().run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(worker.state(), IngestionWorkerState::Idle);
        assert_eq!(source.connects.load(Ordering::SeqCst), 0);

        sink.leadership_tx.send_replace(leader(2));
        wait_for_state(&mut states, IngestionWorkerState::Streaming).await;
        wait_until(|| sink.sequences() == vec![1, 2, 3]).await;

        sink.leadership_tx.send_replace(Leadership::follower(Term(3)));
        wait_for_state(&mut states, IngestionWorkerState::Idle).await;

        shutdown_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(source.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_redelivered_and_malformed_messages_are_skipped() {
        let sink = TestSink::new();
        sink.watermarks.lock().insert("feed".to_string(), 2);
        let source = ScriptedSource::new(vec![Some(1), None, Some(2), Some(3), Some(3), Some(4)]);
        let worker = Arc::new(IngestionWorker::new(
            source,
            sink.clone(),
            fast_config(),
            Arc::new(NoopMeter),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        sink.leadership_tx.send_replace(leader(1));
        let handle = tokio::spawn(worker.run(shutdown_rx));

        wait_until(|| sink.sequences() == vec![3, 4]).await;

        shutdown_tx.send_replace(true);
        handle.await.unwrap();
        assert_eq!(sink.sequences(), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_connect_failures_back_off_and_retry() {
        let sink = TestSink::new();
        let source = ScriptedSource::new(vec![Some(10)]);
        source.fail_connects.store(2, Ordering::SeqCst);
        let worker = Arc::new(IngestionWorker::new(
            source.clone(),
            sink.clone(),
            fast_config(),
            Arc::new(NoopMeter),
        ));
        let mut states = worker.subscribe_state();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        sink.leadership_tx.send_replace(leader(1));
        let handle = tokio::spawn(worker.clone().run(shutdown_rx));

        wait_for_state(&mut states, IngestionWorkerState::Streaming).await;
        wait_until(|| sink.sequences() == vec![10]).await;
        assert_eq!(source.connects.load(Ordering::SeqCst), 3);

        shutdown_tx.send_replace(true);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_streaming() {
        let sink = TestSink::new();
        let source = ScriptedSource::new(vec![]);
        let worker = Arc::new(IngestionWorker::new(
            source,
            sink.clone(),
            fast_config(),
            Arc::new(NoopMeter),
        ));
        let mut states = worker.subscribe_state();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        sink.leadership_tx.send_replace(leader(1));
        let handle = tokio::spawn(worker.clone().run(shutdown_rx));

        wait_for_state(&mut states, IngestionWorkerState::Streaming).await;

        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(worker.state(), IngestionWorkerState::Idle);
    }
}
