//! Counters, per-stage timing windows, failure reports and derived health.
//!
//! Every component writes into one shared [`Metrics`] handle. Nothing here
//! feeds back into control flow: the pipeline records, operators read.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Samples kept per timing window.
const TIMING_WINDOW: usize = 100;
/// Failure reports kept for inspection.
const FAILURE_LOG: usize = 100;
/// Recent outcomes that feed the error rate.
const OUTCOME_WINDOW: usize = 50;
/// Outcomes needed before the error rate alone can mark the pipeline unhealthy.
const MIN_OUTCOMES_FOR_UNHEALTHY: usize = 4;

const COUNTER_COUNT: usize = 15;

const DEGRADED_FAILURE_RATE: f64 = 0.1;
const UNHEALTHY_FAILURE_RATE: f64 = 0.5;

/// Monotonic counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    JobsSubmitted,
    JobsProcessed,
    JobsFailed,
    JobsRetried,
    JobsCoalesced,
    RecordsAccepted,
    RecordsRejected,
    TriplesAdded,
    TriplesSynced,
    BatchesSynced,
    BatchesFailed,
    FilesDetected,
    FilesQuarantined,
    SnapshotsCreated,
    SnapshotsFailed,
}

impl Counter {
    pub const ALL: [Counter; COUNTER_COUNT] = [
        Self::JobsSubmitted,
        Self::JobsProcessed,
        Self::JobsFailed,
        Self::JobsRetried,
        Self::JobsCoalesced,
        Self::RecordsAccepted,
        Self::RecordsRejected,
        Self::TriplesAdded,
        Self::TriplesSynced,
        Self::BatchesSynced,
        Self::BatchesFailed,
        Self::FilesDetected,
        Self::FilesQuarantined,
        Self::SnapshotsCreated,
        Self::SnapshotsFailed,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::JobsSubmitted => "jobs_submitted",
            Self::JobsProcessed => "jobs_processed",
            Self::JobsFailed => "jobs_failed",
            Self::JobsRetried => "jobs_retried",
            Self::JobsCoalesced => "jobs_coalesced",
            Self::RecordsAccepted => "records_accepted",
            Self::RecordsRejected => "records_rejected",
            Self::TriplesAdded => "triples_added",
            Self::TriplesSynced => "triples_synced",
            Self::BatchesSynced => "batches_synced",
            Self::BatchesFailed => "batches_failed",
            Self::FilesDetected => "files_detected",
            Self::FilesQuarantined => "files_quarantined",
            Self::SnapshotsCreated => "snapshots_created",
            Self::SnapshotsFailed => "snapshots_failed",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Pipeline stages with a latency window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Normalize,
    Map,
    Merge,
    Job,
    Sync,
    Snapshot,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Normalize => "normalize",
            Self::Map => "map",
            Self::Merge => "merge",
            Self::Job => "job",
            Self::Sync => "sync",
            Self::Snapshot => "snapshot",
        }
    }
}

/// What kind of failure a report describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Ingest,
    TransientSync,
    PermanentSync,
    SyncFailed,
    QueueFull,
    SnapshotWrite,
    Watch,
}

/// A structured failure record: kind, where it happened, what went wrong, when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: FailureKind,
    pub context: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Latency summary over the most recent samples of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingSummary {
    pub count: usize,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

/// Point-in-time copy of everything the aggregator holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub timings: BTreeMap<String, TimingSummary>,
    pub queue_depth: usize,
    pub parked_batches: usize,
    pub pending_triples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthDetail {
    pub metrics: MetricsSnapshot,
    pub recent_failures: Vec<FailureReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub triplestore_reachable: bool,
    pub recent_failure_rate: f64,
    pub checked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<HealthDetail>,
}

/// Shared metrics aggregator.
#[derive(Debug)]
pub struct Metrics {
    counters: [AtomicU64; COUNTER_COUNT],
    timings: DashMap<Stage, VecDeque<Duration>>,
    failures: Mutex<VecDeque<FailureReport>>,
    outcomes: Mutex<VecDeque<bool>>,
    store_reachable: AtomicBool,
    queue_depth: AtomicUsize,
    parked_batches: AtomicUsize,
    pending_triples: AtomicUsize,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            timings: DashMap::new(),
            failures: Mutex::new(VecDeque::with_capacity(FAILURE_LOG)),
            outcomes: Mutex::new(VecDeque::with_capacity(OUTCOME_WINDOW)),
            store_reachable: AtomicBool::new(true),
            queue_depth: AtomicUsize::new(0),
            parked_batches: AtomicUsize::new(0),
            pending_triples: AtomicUsize::new(0),
        }
    }

    // ── Counters ────────────────────────────────────────────────────────

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.counters[counter.index()].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    // ── Gauges ──────────────────────────────────────────────────────────

    pub fn set_store_reachable(&self, reachable: bool) {
        self.store_reachable.store(reachable, Ordering::Relaxed);
    }

    pub fn store_reachable(&self) -> bool {
        self.store_reachable.load(Ordering::Relaxed)
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn set_parked_batches(&self, n: usize) {
        self.parked_batches.store(n, Ordering::Relaxed);
    }

    pub fn parked_batches(&self) -> usize {
        self.parked_batches.load(Ordering::Relaxed)
    }

    pub fn set_pending_triples(&self, n: usize) {
        self.pending_triples.store(n, Ordering::Relaxed);
    }

    // ── Timings ─────────────────────────────────────────────────────────

    pub fn record_timing(&self, stage: Stage, elapsed: Duration) {
        let mut window = self.timings.entry(stage).or_default();
        if window.len() == TIMING_WINDOW {
            window.pop_front();
        }
        window.push_back(elapsed);
    }

    pub fn timing(&self, stage: Stage) -> Option<TimingSummary> {
        let window = self.timings.get(&stage)?;
        if window.is_empty() {
            return None;
        }
        let ms: Vec<f64> = window.iter().map(|d| d.as_micros() as f64 / 1000.0).collect();
        let sum: f64 = ms.iter().sum();
        Some(TimingSummary {
            count: ms.len(),
            avg_ms: sum / ms.len() as f64,
            min_ms: ms.iter().copied().fold(f64::INFINITY, f64::min),
            max_ms: ms.iter().copied().fold(0.0, f64::max),
        })
    }

    // ── Failures and outcomes ───────────────────────────────────────────

    /// Record a structured failure report.
    pub fn record_failure(
        &self,
        kind: FailureKind,
        context: impl Into<String>,
        message: impl Into<String>,
    ) {
        let report = FailureReport {
            kind,
            context: context.into(),
            message: message.into(),
            at: Utc::now(),
        };
        tracing::debug!(?kind, context = %report.context, "failure recorded");
        let mut log = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        if log.len() == FAILURE_LOG {
            log.pop_front();
        }
        log.push_back(report);
    }

    /// Most recent failure reports, oldest first.
    pub fn recent_failures(&self) -> Vec<FailureReport> {
        let log = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        log.iter().cloned().collect()
    }

    /// Feed one job or batch outcome into the error-rate window.
    pub fn record_outcome(&self, success: bool) {
        let mut window = self.outcomes.lock().unwrap_or_else(|e| e.into_inner());
        if window.len() == OUTCOME_WINDOW {
            window.pop_front();
        }
        window.push_back(success);
    }

    fn outcome_stats(&self) -> (usize, f64) {
        let window = self.outcomes.lock().unwrap_or_else(|e| e.into_inner());
        if window.is_empty() {
            return (0, 0.0);
        }
        let failed = window.iter().filter(|ok| !**ok).count();
        (window.len(), failed as f64 / window.len() as f64)
    }

    // ── Reports ─────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = Counter::ALL
            .into_iter()
            .map(|c| (c.name().to_string(), self.get(c)))
            .collect();
        let timings = [
            Stage::Normalize,
            Stage::Map,
            Stage::Merge,
            Stage::Job,
            Stage::Sync,
            Stage::Snapshot,
        ]
        .into_iter()
        .filter_map(|s| self.timing(s).map(|t| (s.name().to_string(), t)))
        .collect();
        MetricsSnapshot {
            counters,
            timings,
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            parked_batches: self.parked_batches(),
            pending_triples: self.pending_triples.load(Ordering::Relaxed),
        }
    }

    /// Derive the health status from reachability, parked work and the
    /// recent error rate.
    ///
    /// - unhealthy: triplestore unreachable, or at least half of the recent
    ///   outcomes failed
    /// - degraded: at least 10% of recent outcomes failed, or batches are
    ///   parked waiting for the triplestore
    /// - healthy: otherwise
    pub fn status(&self) -> (HealthStatus, f64) {
        let (samples, rate) = self.outcome_stats();
        let status = if !self.store_reachable()
            || (samples >= MIN_OUTCOMES_FOR_UNHEALTHY && rate >= UNHEALTHY_FAILURE_RATE)
        {
            HealthStatus::Unhealthy
        } else if rate >= DEGRADED_FAILURE_RATE || self.parked_batches() > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        (status, rate)
    }

    pub fn health(&self, detailed: bool) -> HealthReport {
        let (status, rate) = self.status();
        HealthReport {
            status,
            triplestore_reachable: self.store_reachable(),
            recent_failure_rate: rate,
            checked_at: Utc::now(),
            detail: detailed.then(|| HealthDetail {
                metrics: self.snapshot(),
                recent_failures: self.recent_failures(),
            }),
        }
    }
}
