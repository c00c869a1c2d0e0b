//! skein-observe: vendor-neutral observability ABI.
//!
//! The consensus engine and the node depend only on these traits and event
//! types. Exporters (Prometheus, tests) live in the crates that need them.

pub trait Counter: Send + Sync {
    fn inc(&self, v: u64);
}
pub trait Gauge: Send + Sync {
    fn set(&self, v: i64);
}
pub trait Histogram: Send + Sync {
    fn observe(&self, v: f64);
}

pub trait Meter: Send + Sync + 'static {
    fn counter(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter>;
    fn gauge(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge>;
    fn histo(
        &self,
        name: &'static str,
        _buckets: &'static [f64],
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram>;
    fn emit(&self, evt: ObsEvent);
}

/// A do-nothing meter for tests and users who don't care about telemetry.
#[derive(Clone, Default)]
pub struct NoopMeter;
struct NoopC;
impl Counter for NoopC {
    fn inc(&self, _v: u64) {}
}
struct NoopG;
impl Gauge for NoopG {
    fn set(&self, _v: i64) {}
}
struct NoopH;
impl Histogram for NoopH {
    fn observe(&self, _v: f64) {}
}
impl Meter for NoopMeter {
    fn counter(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter> {
        Box::new(NoopC)
    }
    fn gauge(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge> {
        Box::new(NoopG)
    }
    fn histo(
        &self,
        _n: &'static str,
        _b: &'static [f64],
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram> {
        Box::new(NoopH)
    }
    fn emit(&self, _e: ObsEvent) {}
}

/// Typed lifecycle events (record payloads are never included).
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq)]
pub enum ObsEvent {
    Raft(RaftEvt),
    Membership(MembershipEvt),
    Ingest(IngestEvt),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RaftEvt {
    pub node: String,
    pub term: u64,
    pub kind: RaftKind,
}
#[derive(Clone, Debug, PartialEq)]
pub enum RaftKind {
    ElectionStarted,
    VoteGranted { candidate: String },
    LeaderElected,
    StepDown,
    SnapshotTaken { last_included_index: u64 },
    SnapshotInstalled { last_included_index: u64 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct MembershipEvt {
    pub node: String,
    pub kind: MembershipKind,
}
#[derive(Clone, Debug, PartialEq)]
pub enum MembershipKind {
    VoterProposed { id: String, addr: String },
    VoterCommitted { id: String, members: usize },
    JoinRejected { id: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct IngestEvt {
    pub source: String,
    pub kind: IngestKind,
}
#[derive(Clone, Debug, PartialEq)]
pub enum IngestKind {
    /// Worker moved to a new lifecycle state (Idle, Connecting, Streaming, Closing).
    Worker { state: &'static str },
    /// A record could not be persisted after every retry attempt.
    PersistAlarm { sequence: u64, attempts: u32 },
}

/// Macros (simple versions).
#[macro_export]
macro_rules! obs_count {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.counter($name, $labels).inc($v as u64);
    }};
}
#[macro_export]
macro_rules! obs_gauge {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.gauge($name, $labels).set($v as i64);
    }};
}
#[macro_export]
macro_rules! obs_hist {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.histo($name, &[], $labels).observe($v as f64);
    }};
}
#[macro_export]
macro_rules! obs_timed {
    ($m:expr, $name:expr, $labels:expr, $body:block) => {{
        let __t = std::time::Instant::now();
        let __ret = { $body };
        let __ms = __t.elapsed().as_secs_f64() * 1000.0;
        $m.histo($name, &[], $labels).observe(__ms);
        __ret
    }};
}
