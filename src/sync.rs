//! Synchronization client: outbox → batches → triplestore.
//!
//! Workers push newly merged triples into the outbox. The background loop
//! cuts the outbox into batches bounded by triple count and payload bytes and
//! sends each one through the configured [`TripleSink`], retrying transient
//! failures with exponential backoff.
//!
//! A batch that exhausts its retries is parked, not dropped: the triplestore
//! is marked unreachable and the loop re-sends parked batches once a ping
//! succeeds again. Permanent failures are reported and handed to the
//! rejection hook, which lets the owner forget those triples so a later
//! resubmission derives and sends them again. Insertion is idempotent on the
//! store side, so a batch delivered twice is harmless.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use oxigraph::model::Triple;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};

use crate::error::{SyncError, SyncResult};
use crate::graph::ntriples_line;
use crate::metrics::{Counter, FailureKind, Metrics, Stage};
use crate::retry::RetryPolicy;
use crate::store::{SyncBatch, TripleSink};

/// Batching and retry parameters.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub batch_max_triples: usize,
    pub batch_max_bytes: usize,
    pub flush_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_max_triples: 1000,
            batch_max_bytes: 512 * 1024,
            flush_interval: Duration::from_secs(2),
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub batches_sent: usize,
    pub triples_sent: usize,
    pub batches_failed: usize,
    pub batches_parked: usize,
}

impl SyncSummary {
    fn absorb(&mut self, other: SyncSummary) {
        self.batches_sent += other.batches_sent;
        self.triples_sent += other.triples_sent;
        self.batches_failed += other.batches_failed;
        self.batches_parked += other.batches_parked;
    }
}

/// Cut `triples` into batches of at most `max_triples` triples and roughly
/// `max_bytes` of N-Triples payload. A single oversized triple still gets a
/// batch of its own.
pub fn make_batches(
    triples: Vec<Triple>,
    max_triples: usize,
    max_bytes: usize,
    next_id: &AtomicU64,
) -> Vec<SyncBatch> {
    let max_triples = max_triples.max(1);
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut bytes = 0usize;

    for triple in triples {
        let size = ntriples_line(&triple).len() + 1;
        if !current.is_empty() && (current.len() >= max_triples || bytes + size > max_bytes) {
            let id = next_id.fetch_add(1, Ordering::Relaxed);
            batches.push(SyncBatch::new(id, std::mem::take(&mut current)));
            bytes = 0;
        }
        bytes += size;
        current.push(triple);
    }
    if !current.is_empty() {
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        batches.push(SyncBatch::new(id, current));
    }
    batches
}

pub struct SyncClient {
    sink: Arc<dyn TripleSink>,
    config: SyncConfig,
    outbox: Mutex<VecDeque<Triple>>,
    parked: Mutex<VecDeque<SyncBatch>>,
    notify: Notify,
    next_batch_id: AtomicU64,
    flush_lock: tokio::sync::Mutex<()>,
    on_rejected: Option<RejectionHook>,
    metrics: Arc<Metrics>,
}

/// Called with each batch the triplestore refused permanently.
pub type RejectionHook = Box<dyn Fn(&SyncBatch) + Send + Sync>;

impl SyncClient {
    pub fn new(sink: Arc<dyn TripleSink>, config: SyncConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            sink,
            config,
            outbox: Mutex::new(VecDeque::new()),
            parked: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            next_batch_id: AtomicU64::new(1),
            flush_lock: tokio::sync::Mutex::new(()),
            on_rejected: None,
            metrics,
        }
    }

    pub fn on_rejected(mut self, hook: impl Fn(&SyncBatch) + Send + Sync + 'static) -> Self {
        self.on_rejected = Some(Box::new(hook));
        self
    }

    pub fn sink(&self) -> &Arc<dyn TripleSink> {
        &self.sink
    }

    /// Queue triples for the next flush. Wakes the loop once a full batch is waiting.
    pub fn enqueue(&self, triples: Vec<Triple>) {
        if triples.is_empty() {
            return;
        }
        let pending = {
            let mut outbox = self.outbox.lock().unwrap_or_else(|e| e.into_inner());
            outbox.extend(triples);
            outbox.len()
        };
        self.metrics.set_pending_triples(pending);
        if pending >= self.config.batch_max_triples {
            self.notify.notify_one();
        }
    }

    /// Triples waiting in the outbox.
    pub fn pending(&self) -> usize {
        self.outbox.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Batches waiting for the triplestore to come back.
    pub fn parked(&self) -> usize {
        self.parked.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop everything not yet delivered.
    pub fn reset(&self) {
        self.outbox.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.parked.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.metrics.set_pending_triples(0);
        self.metrics.set_parked_batches(0);
    }

    /// Empty the triplestore and drop everything not yet delivered, then run
    /// `then`. Holds the flush lock throughout, so no batch already in
    /// delivery can land after the clear.
    pub async fn clear_store(&self, then: impl FnOnce()) -> SyncResult<()> {
        let _guard = self.flush_lock.lock().await;
        let sink = Arc::clone(&self.sink);
        tokio::task::spawn_blocking(move || sink.clear())
            .await
            .map_err(|e| SyncError::Transient {
                status: None,
                message: format!("clear task failed: {e}"),
            })??;
        self.reset();
        then();
        Ok(())
    }

    fn take_batches(&self) -> Vec<SyncBatch> {
        let drained: Vec<Triple> = {
            let mut outbox = self.outbox.lock().unwrap_or_else(|e| e.into_inner());
            outbox.drain(..).collect()
        };
        self.metrics.set_pending_triples(0);
        make_batches(
            drained,
            self.config.batch_max_triples,
            self.config.batch_max_bytes,
            &self.next_batch_id,
        )
    }

    fn park(&self, batch: SyncBatch) {
        let n = {
            let mut parked = self.parked.lock().unwrap_or_else(|e| e.into_inner());
            parked.push_back(batch);
            parked.len()
        };
        self.metrics.set_parked_batches(n);
    }

    /// Ask the store whether it is reachable, updating the health gauge.
    pub async fn probe(&self) -> bool {
        let sink = Arc::clone(&self.sink);
        let reachable = matches!(
            tokio::task::spawn_blocking(move || sink.ping()).await,
            Ok(Ok(()))
        );
        self.metrics.set_store_reachable(reachable);
        reachable
    }

    /// Send everything pending: parked batches first (if the store is back),
    /// then the outbox.
    pub async fn flush(&self) -> SyncSummary {
        let _guard = self.flush_lock.lock().await;
        let mut summary = SyncSummary::default();

        let has_parked = self.parked() > 0;
        if has_parked && !self.probe().await {
            // Still down: keep new work local until it recovers.
            for batch in self.take_batches() {
                self.park(batch);
                summary.batches_parked += 1;
            }
            return summary;
        }
        if has_parked {
            let parked: Vec<SyncBatch> = {
                let mut parked = self.parked.lock().unwrap_or_else(|e| e.into_inner());
                parked.drain(..).collect()
            };
            self.metrics.set_parked_batches(0);
            tracing::info!(batches = parked.len(), "triplestore reachable again, re-sending parked batches");
            summary.absorb(self.deliver(parked).await);
        }

        summary.absorb(self.deliver(self.take_batches()).await);
        summary
    }

    async fn deliver(&self, batches: Vec<SyncBatch>) -> SyncSummary {
        let mut summary = SyncSummary::default();
        let mut batches = batches.into_iter();
        while let Some(batch) = batches.next() {
            let started = Instant::now();
            match self.send_with_retry(&batch).await {
                Ok(()) => {
                    self.metrics.record_timing(Stage::Sync, started.elapsed());
                    self.metrics.incr(Counter::BatchesSynced);
                    self.metrics.add(Counter::TriplesSynced, batch.len() as u64);
                    self.metrics.record_outcome(true);
                    self.metrics.set_store_reachable(true);
                    summary.batches_sent += 1;
                    summary.triples_sent += batch.len();
                    tracing::debug!(batch_id = batch.id, triples = batch.len(), "batch synced");
                }
                Err(e @ SyncError::Exhausted { .. }) => {
                    tracing::error!(batch_id = batch.id, error = %e, "sync failed, parking batch");
                    self.metrics.incr(Counter::BatchesFailed);
                    self.metrics.record_outcome(false);
                    self.metrics.set_store_reachable(false);
                    self.metrics.record_failure(
                        FailureKind::SyncFailed,
                        format!("batch {} ({} triples)", batch.id, batch.len()),
                        e.to_string(),
                    );
                    self.park(batch);
                    summary.batches_failed += 1;
                    summary.batches_parked += 1;
                    // The rest would only burn their retries against a dead store.
                    for rest in batches.by_ref() {
                        self.park(rest);
                        summary.batches_parked += 1;
                    }
                }
                Err(e) => {
                    tracing::error!(batch_id = batch.id, error = %e, "triplestore rejected batch");
                    self.metrics.incr(Counter::BatchesFailed);
                    self.metrics.record_outcome(false);
                    self.metrics.record_failure(
                        FailureKind::PermanentSync,
                        format!("batch {} ({} triples)", batch.id, batch.len()),
                        e.to_string(),
                    );
                    if let Some(hook) = &self.on_rejected {
                        hook(&batch);
                    }
                    summary.batches_failed += 1;
                }
            }
        }
        summary
    }

    async fn send_with_retry(&self, batch: &SyncBatch) -> SyncResult<()> {
        let policy = self.config.retry;
        let mut attempt = 1;
        loop {
            let sink = Arc::clone(&self.sink);
            let payload = batch.clone();
            let result = tokio::task::spawn_blocking(move || sink.insert(&payload))
                .await
                .unwrap_or_else(|e| {
                    Err(SyncError::Transient {
                        status: None,
                        message: format!("sync task failed: {e}"),
                    })
                });

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && policy.should_retry(attempt) => {
                    let delay = policy.delay_for(attempt);
                    tracing::warn!(
                        batch_id = batch.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient sync failure, retrying"
                    );
                    self.metrics.record_failure(
                        FailureKind::TransientSync,
                        format!("batch {} attempt {attempt}", batch.id),
                        e.to_string(),
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(SyncError::Exhausted {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Background loop: flush on every tick or when a full batch is waiting,
    /// then once more on shutdown. Returns the totals for the whole run.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> SyncSummary {
        let mut tick = tokio::time::interval(self.config.flush_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(store = self.sink.name(), "sync loop started");
        let mut total = SyncSummary::default();

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.notify.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            let summary = self.flush().await;
            if summary.batches_sent > 0 || summary.batches_failed > 0 {
                tracing::info!(
                    sent = summary.batches_sent,
                    triples = summary.triples_sent,
                    failed = summary.batches_failed,
                    parked = summary.batches_parked,
                    "sync flush"
                );
            }
            total.absorb(summary);
        }

        let summary = self.flush().await;
        total.absorb(summary);
        tracing::info!(
            sent = total.batches_sent,
            parked = self.parked(),
            "sync loop stopped"
        );
        total
    }
}
