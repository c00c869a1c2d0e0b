//! Prometheus metrics implementation.
//!
//! Implements skein_observe::Meter using prometheus-client.

use parking_lot::Mutex;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter as PromCounter;
use prometheus_client::metrics::family::{Family, MetricConstructor};
use prometheus_client::metrics::gauge::Gauge as PromGauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram as PromHistogram};
use prometheus_client::registry::Registry;
use skein_observe::{
    Counter, Gauge, Histogram, IngestKind, MembershipKind, Meter, ObsEvent, RaftKind,
};
use std::collections::HashMap;
use std::sync::Arc;

type Labels = Vec<(String, String)>;

/// Histogram constructor; empty bucket lists get exponential 1ms..512ms buckets.
#[derive(Debug, Clone, Copy)]
struct Buckets(&'static [f64]);

impl MetricConstructor<PromHistogram> for Buckets {
    fn new_metric(&self) -> PromHistogram {
        if self.0.is_empty() {
            PromHistogram::new(exponential_buckets(1.0, 2.0, 10))
        } else {
            PromHistogram::new(self.0.iter().copied())
        }
    }
}

/// Prometheus metrics collector.
pub struct PrometheusMeter {
    registry: Arc<Mutex<Registry>>,
    counters: Arc<Mutex<HashMap<&'static str, Family<Labels, PromCounter>>>>,
    gauges: Arc<Mutex<HashMap<&'static str, Family<Labels, PromGauge>>>>,
    histograms: Arc<Mutex<HashMap<&'static str, Family<Labels, PromHistogram, Buckets>>>>,
    events: Family<Labels, PromCounter>,
}

impl PrometheusMeter {
    /// Create a new Prometheus meter with a fresh registry.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let events = Family::<Labels, PromCounter>::default();
        registry.register("skein_events", "Lifecycle events by category and kind", events.clone());

        Self {
            registry: Arc::new(Mutex::new(registry)),
            counters: Arc::new(Mutex::new(HashMap::new())),
            gauges: Arc::new(Mutex::new(HashMap::new())),
            histograms: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn export(&self) -> Result<String, std::fmt::Error> {
        let registry = self.registry.lock();
        let mut buffer = String::new();
        encode(&mut buffer, &registry)?;
        Ok(buffer)
    }

    fn get_or_create_counter(&self, name: &'static str) -> Family<Labels, PromCounter> {
        let mut counters = self.counters.lock();
        if let Some(family) = counters.get(name) {
            return family.clone();
        }

        let family = Family::<Labels, PromCounter>::default();
        // The text encoder appends `_total` to counters itself.
        let base = name.strip_suffix("_total").unwrap_or(name);
        self.registry.lock().register(base, "Counter", family.clone());

        counters.insert(name, family.clone());
        family
    }

    fn get_or_create_gauge(&self, name: &'static str) -> Family<Labels, PromGauge> {
        let mut gauges = self.gauges.lock();
        if let Some(family) = gauges.get(name) {
            return family.clone();
        }

        let family = Family::<Labels, PromGauge>::default();
        self.registry.lock().register(name, "Gauge", family.clone());

        gauges.insert(name, family.clone());
        family
    }

    fn get_or_create_histogram(
        &self,
        name: &'static str,
        buckets: &'static [f64],
    ) -> Family<Labels, PromHistogram, Buckets> {
        let mut histograms = self.histograms.lock();
        if let Some(family) = histograms.get(name) {
            return family.clone();
        }

        let family = Family::<Labels, PromHistogram, Buckets>::new_with_constructor(Buckets(buckets));
        self.registry.lock().register(name, "Histogram", family.clone());

        histograms.insert(name, family.clone());
        family
    }
}

impl Default for PrometheusMeter {
    fn default() -> Self {
        Self::new()
    }
}

fn to_labels(labels: &'static [(&'static str, &'static str)]) -> Labels {
    labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// `(category, kind)` label pair for an event.
fn event_labels(evt: &ObsEvent) -> (&'static str, &'static str) {
    match evt {
        ObsEvent::Raft(e) => (
            "raft",
            match e.kind {
                RaftKind::ElectionStarted => "election_started",
                RaftKind::VoteGranted { .. } => "vote_granted",
                RaftKind::LeaderElected => "leader_elected",
                RaftKind::StepDown => "step_down",
                RaftKind::SnapshotTaken { .. } => "snapshot_taken",
                RaftKind::SnapshotInstalled { .. } => "snapshot_installed",
            },
        ),
        ObsEvent::Membership(e) => (
            "membership",
            match e.kind {
                MembershipKind::VoterProposed { .. } => "voter_proposed",
                MembershipKind::VoterCommitted { .. } => "voter_committed",
                MembershipKind::JoinRejected { .. } => "join_rejected",
            },
        ),
        ObsEvent::Ingest(e) => (
            "ingest",
            match e.kind {
                IngestKind::Worker { state } => state,
                IngestKind::PersistAlarm { .. } => "persist_alarm",
            },
        ),
        _ => ("other", "unknown"),
    }
}

struct PrometheusCounter {
    counter: PromCounter,
}

impl Counter for PrometheusCounter {
    fn inc(&self, v: u64) {
        self.counter.inc_by(v);
    }
}

struct PrometheusGauge {
    gauge: PromGauge,
}

impl Gauge for PrometheusGauge {
    fn set(&self, v: i64) {
        self.gauge.set(v);
    }
}

struct PrometheusHistogram {
    histogram: PromHistogram,
}

impl Histogram for PrometheusHistogram {
    fn observe(&self, v: f64) {
        self.histogram.observe(v);
    }
}

impl Meter for PrometheusMeter {
    fn counter(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter> {
        let counter = self
            .get_or_create_counter(name)
            .get_or_create(&to_labels(labels))
            .clone();
        Box::new(PrometheusCounter { counter })
    }

    fn gauge(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge> {
        let gauge = self
            .get_or_create_gauge(name)
            .get_or_create(&to_labels(labels))
            .clone();
        Box::new(PrometheusGauge { gauge })
    }

    fn histo(
        &self,
        name: &'static str,
        buckets: &'static [f64],
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram> {
        let histogram = self
            .get_or_create_histogram(name, buckets)
            .get_or_create(&to_labels(labels))
            .clone();
        Box::new(PrometheusHistogram { histogram })
    }

    fn emit(&self, evt: ObsEvent) {
        let (category, kind) = event_labels(&evt);
        tracing::debug!(category, kind, event = ?evt, "Observability event");
        self.events
            .get_or_create(&vec![
                ("category".to_string(), category.to_string()),
                ("kind".to_string(), kind.to_string()),
            ])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_observe::{obs_count, IngestEvt, RaftEvt};

    #[test]
    fn test_counter() {
        let meter = PrometheusMeter::new();
        let counter = meter.counter("skein_test_total", &[("label", "value")]);
        counter.inc(5);
        counter.inc(3);
        obs_count!(meter, "skein_test_total", &[("label", "value")], 2);

        let output = meter.export().unwrap();
        assert!(output.contains("skein_test_total{label=\"value\"} 10"));
    }

    #[test]
    fn test_gauge() {
        let meter = PrometheusMeter::new();
        let gauge = meter.gauge("skein_test_gauge", &[]);
        gauge.set(42);

        let output = meter.export().unwrap();
        assert!(output
            .lines()
            .any(|line| line.starts_with("skein_test_gauge") && line.ends_with(" 42")));
    }

    #[test]
    fn test_histogram() {
        let meter = PrometheusMeter::new();
        let histo = meter.histo("skein_test_ms", &[], &[("label", "value")]);
        histo.observe(1.5);
        histo.observe(2.5);

        let output = meter.export().unwrap();
        assert!(output.contains("skein_test_ms_count{label=\"value\"} 2"));
    }

    #[test]
    fn test_events_are_counted() {
        let meter = PrometheusMeter::new();
        meter.emit(ObsEvent::Raft(RaftEvt {
            node: "1".into(),
            term: 2,
            kind: RaftKind::LeaderElected,
        }));
        meter.emit(ObsEvent::Ingest(IngestEvt {
            source: "feed".into(),
            kind: IngestKind::PersistAlarm {
                sequence: 3,
                attempts: 5,
            },
        }));

        let output = meter.export().unwrap();
        assert!(output.contains("category=\"raft\""));
        assert!(output.contains("kind=\"leader_elected\""));
        assert!(output.contains("kind=\"persist_alarm\""));
    }
}
