//! Bounded ingestion queue.
//!
//! Jobs arrive from the API entry points and the file watcher and are pulled
//! by a pool of workers. The queue owns the job lifecycle around that:
//!
//! - **Backpressure**: a full queue either blocks the caller or rejects the
//!   push with [`QueueError::Full`], per [`BackpressureMode`]. Nothing is
//!   ever dropped silently.
//! - **Deduplication**: payloads are keyed by blake3 content hash. A push
//!   whose payload matches a job that is still in flight, or that succeeded
//!   within the dedup window, is coalesced into that job's handle.
//! - **Retry**: a transient failure re-enqueues the job after an exponential
//!   backoff, up to the retry policy's attempt bound.
//! - **Status**: every job has a `watch` channel carrying its [`JobStatus`];
//!   recent jobs stay queryable by id in a bounded registry.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, mpsc, watch};

use crate::error::{QueueError, QueueResult};
use crate::metrics::{Counter, FailureKind, Metrics};
use crate::retry::RetryPolicy;

/// Terminal jobs kept for status lookups.
const MAX_TRACKED_JOBS: usize = 1024;

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureMode {
    /// Wait for space.
    Block,
    /// Fail fast with `QueueError::Full`.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOrigin {
    Api,
    Watcher,
}

#[derive(Debug, Clone)]
pub enum JobPayload {
    /// Raw records submitted directly.
    Records(Vec<Value>),
    /// A JSON file on disk, read when the job runs.
    File(PathBuf),
}

impl JobPayload {
    pub fn describe(&self) -> String {
        match self {
            Self::Records(records) => format!("{} submitted record(s)", records.len()),
            Self::File(path) => path.display().to_string(),
        }
    }
}

/// A unit of work on the queue.
#[derive(Debug, Clone)]
pub struct IngestionJob {
    pub id: JobId,
    pub origin: JobOrigin,
    pub payload: JobPayload,
    pub content_hash: String,
    /// 1-based attempt number of the upcoming run.
    pub attempt: u32,
    pub enqueued_at: Instant,
}

/// What a successful job did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub records_accepted: usize,
    pub records_rejected: usize,
    pub triples_added: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running { attempt: u32 },
    Retrying { attempt: u32 },
    Succeeded(JobOutcome),
    Failed { message: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed { .. })
    }
}

/// Returned to whoever pushed a job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: JobId,
    /// True when the push was folded into an existing job.
    pub coalesced: bool,
    status: watch::Receiver<JobStatus>,
}

/// Serializable view of a [`JobHandle`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTicket {
    pub job_id: JobId,
    pub coalesced: bool,
    pub status: JobStatus,
}

impl JobHandle {
    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    pub fn ticket(&self) -> JobTicket {
        JobTicket {
            job_id: self.id,
            coalesced: self.coalesced,
            status: self.status(),
        }
    }

    /// Wait until the job succeeds or fails.
    pub async fn wait(&mut self) -> JobStatus {
        loop {
            let status = self.status.borrow_and_update().clone();
            if status.is_terminal() {
                return status;
            }
            if self.status.changed().await.is_err() {
                return self.status.borrow().clone();
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub capacity: usize,
    pub backpressure: BackpressureMode,
    pub dedup_window: Duration,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            backpressure: BackpressureMode::Block,
            dedup_window: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

struct JobRecord {
    status: watch::Sender<JobStatus>,
    content_hash: String,
    finished_at: Option<Instant>,
}

pub struct IngestQueue {
    config: QueueConfig,
    tx: RwLock<Option<mpsc::Sender<IngestionJob>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<IngestionJob>>,
    next_id: AtomicU64,
    jobs: DashMap<JobId, JobRecord>,
    dedup: DashMap<String, JobId>,
    in_flight: AtomicUsize,
    idle: Notify,
    metrics: Arc<Metrics>,
}

/// Content hash of a record payload. serde_json maps are key-ordered, so
/// equal records hash equally regardless of input key order.
pub fn hash_records(records: &[Value]) -> String {
    let bytes = serde_json::to_vec(records).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

impl IngestQueue {
    pub fn new(config: QueueConfig, metrics: Arc<Metrics>) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        Self {
            config,
            tx: RwLock::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            next_id: AtomicU64::new(1),
            jobs: DashMap::new(),
            dedup: DashMap::new(),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            metrics,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn sender(&self) -> Option<mpsc::Sender<IngestionJob>> {
        self.tx.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Jobs waiting in the channel.
    pub fn depth(&self) -> usize {
        self.sender()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    /// Jobs queued, running, or waiting to be retried.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.read().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    /// Enqueue submitted records.
    pub async fn push_records(&self, records: Vec<Value>, origin: JobOrigin) -> QueueResult<JobHandle> {
        let hash = hash_records(&records);
        self.push(JobPayload::Records(records), hash, origin).await
    }

    /// Enqueue a file. Its current bytes are hashed for deduplication.
    pub async fn push_file(&self, path: PathBuf, origin: JobOrigin) -> QueueResult<JobHandle> {
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| QueueError::Unreadable {
                path: path.clone(),
                source,
            })?;
        let hash = hash_bytes(&bytes);
        self.push(JobPayload::File(path), hash, origin).await
    }

    async fn push(
        &self,
        payload: JobPayload,
        content_hash: String,
        origin: JobOrigin,
    ) -> QueueResult<JobHandle> {
        let Some(tx) = self.sender() else {
            return Err(QueueError::ShuttingDown);
        };

        if let Some(handle) = self.coalesce_duplicate(&content_hash) {
            return Ok(handle);
        }

        // Nothing is registered until the channel slot is ours, so a push
        // dropped while waiting for space leaves no trace.
        let reserved = match self.config.backpressure {
            BackpressureMode::Block => tx.reserve().await.map_err(|_| QueueError::ShuttingDown),
            BackpressureMode::Reject => tx.try_reserve().map_err(|e| match e {
                mpsc::error::TrySendError::Full(()) => QueueError::Full {
                    capacity: self.config.capacity,
                },
                mpsc::error::TrySendError::Closed(()) => QueueError::ShuttingDown,
            }),
        };
        let permit = match reserved {
            Ok(permit) => permit,
            Err(e) => {
                if let QueueError::Full { .. } = e {
                    self.metrics
                        .record_failure(FailureKind::QueueFull, format!("{origin:?} push"), e.to_string());
                }
                return Err(e);
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let status_rx = match self.dedup.entry(content_hash.clone()) {
            Entry::Occupied(mut existing) => {
                if let Some(handle) = self.coalesce(*existing.get()) {
                    tracing::debug!(job_id = handle.id, "payload already in flight, coalescing");
                    self.metrics.incr(Counter::JobsCoalesced);
                    return Ok(handle);
                }
                existing.insert(id);
                self.register(id, &content_hash)
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
                self.register(id, &content_hash)
            }
        };

        permit.send(IngestionJob {
            id,
            origin,
            payload,
            content_hash,
            attempt: 1,
            enqueued_at: Instant::now(),
        });

        self.metrics.incr(Counter::JobsSubmitted);
        self.metrics.set_queue_depth(self.depth());
        tracing::debug!(job_id = id, ?origin, "job enqueued");
        Ok(JobHandle {
            id,
            coalesced: false,
            status: status_rx,
        })
    }

    fn coalesce_duplicate(&self, content_hash: &str) -> Option<JobHandle> {
        let existing = self.dedup.get(content_hash).map(|owner| *owner)?;
        let handle = self.coalesce(existing)?;
        tracing::debug!(job_id = handle.id, "payload already in flight, coalescing");
        self.metrics.incr(Counter::JobsCoalesced);
        Some(handle)
    }

    /// A handle onto `existing` if it may absorb a duplicate push.
    fn coalesce(&self, existing: JobId) -> Option<JobHandle> {
        let record = self.jobs.get(&existing)?;
        let live = match &*record.status.borrow() {
            JobStatus::Failed { .. } => false,
            JobStatus::Succeeded(_) => record
                .finished_at
                .is_some_and(|at| at.elapsed() < self.config.dedup_window),
            _ => true,
        };
        live.then(|| JobHandle {
            id: existing,
            coalesced: true,
            status: record.status.subscribe(),
        })
    }

    fn register(&self, id: JobId, content_hash: &str) -> watch::Receiver<JobStatus> {
        let (status, rx) = watch::channel(JobStatus::Queued);
        self.jobs.insert(
            id,
            JobRecord {
                status,
                content_hash: content_hash.to_string(),
                finished_at: None,
            },
        );
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        rx
    }

    fn unregister(&self, id: JobId) {
        if let Some((_, record)) = self.jobs.remove(&id) {
            self.dedup.remove_if(&record.content_hash, |_, owner| *owner == id);
        }
        self.release();
    }

    fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.idle.notify_waiters();
    }

    fn set_status(&self, id: JobId, status: JobStatus) {
        if let Some(mut record) = self.jobs.get_mut(&id) {
            if status.is_terminal() {
                record.finished_at = Some(Instant::now());
            }
            record.status.send_replace(status);
        }
    }

    /// Next job, waiting while the queue is empty. `None` once the queue is
    /// closed and drained.
    pub async fn pull(&self) -> Option<IngestionJob> {
        let job = self.rx.lock().await.recv().await;
        if let Some(job) = &job {
            self.set_status(job.id, JobStatus::Running { attempt: job.attempt });
            self.metrics.set_queue_depth(self.depth());
        }
        job
    }

    pub fn complete(&self, job: &IngestionJob, outcome: JobOutcome) {
        self.set_status(job.id, JobStatus::Succeeded(outcome));
        self.metrics.incr(Counter::JobsProcessed);
        self.metrics.record_outcome(true);
        self.release();
        self.prune();
    }

    pub fn fail(&self, job: &IngestionJob, message: impl Into<String>) {
        self.set_status(
            job.id,
            JobStatus::Failed {
                message: message.into(),
            },
        );
        // A failed payload may be resubmitted as a fresh job.
        self.dedup
            .remove_if(&job.content_hash, |_, owner| *owner == job.id);
        self.metrics.incr(Counter::JobsFailed);
        self.metrics.record_outcome(false);
        self.release();
        self.prune();
    }

    /// Schedule another attempt after the policy's backoff delay.
    ///
    /// Returns `false` when the attempt budget is spent; the caller then
    /// fails the job.
    pub fn retry_later(self: &Arc<Self>, job: IngestionJob) -> bool {
        if !self.config.retry.should_retry(job.attempt) {
            return false;
        }
        let delay = self.config.retry.delay_for(job.attempt);
        let next = IngestionJob {
            attempt: job.attempt + 1,
            ..job
        };
        self.set_status(next.id, JobStatus::Retrying { attempt: next.attempt });
        self.metrics.incr(Counter::JobsRetried);
        tracing::info!(
            job_id = next.id,
            attempt = next.attempt,
            delay_ms = delay.as_millis() as u64,
            "job scheduled for retry"
        );

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(tx) = queue.sender() else {
                queue.fail(&next, "queue closed before retry");
                return;
            };
            queue.set_status(next.id, JobStatus::Queued);
            if let Err(mpsc::error::SendError(job)) = tx.send(next).await {
                queue.fail(&job, "queue closed before retry");
            }
        });
        true
    }

    pub fn job_status(&self, id: JobId) -> Option<JobStatus> {
        self.jobs.get(&id).map(|r| r.status.borrow().clone())
    }

    /// Ids of jobs that have not reached a terminal state, ascending.
    pub fn unfinished_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|r| !r.status.borrow().is_terminal())
            .map(|r| *r.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Forget every content hash so identical payloads are processed again.
    pub fn clear_dedup(&self) {
        self.dedup.clear();
    }

    /// Stop accepting new jobs. Queued jobs remain pullable.
    pub fn close(&self) {
        self.tx.write().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Wait until no job is queued, running or awaiting retry.
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }

    /// Drop the oldest terminal records once the registry is over its bound.
    fn prune(&self) {
        if self.jobs.len() <= MAX_TRACKED_JOBS {
            return;
        }
        let mut finished: Vec<(Instant, JobId)> = self
            .jobs
            .iter()
            .filter_map(|r| r.finished_at.map(|at| (at, *r.key())))
            .collect();
        finished.sort_unstable();
        let excess = self.jobs.len().saturating_sub(MAX_TRACKED_JOBS);
        for (_, id) in finished.into_iter().take(excess) {
            if let Some((_, record)) = self.jobs.remove(&id) {
                self.dedup
                    .remove_if(&record.content_hash, |_, owner| *owner == id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue(capacity: usize, backpressure: BackpressureMode) -> Arc<IngestQueue> {
        Arc::new(IngestQueue::new(
            QueueConfig {
                capacity,
                backpressure,
                dedup_window: Duration::from_secs(60),
                retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
            },
            Arc::new(Metrics::new()),
        ))
    }

    fn records(n: usize) -> Vec<Value> {
        vec![json!({ "url": format!("https://x.org/{n}.pdf"), "title": "T" })]
    }

    #[tokio::test]
    async fn reject_mode_reports_full() {
        let q = queue(1, BackpressureMode::Reject);
        q.push_records(records(1), JobOrigin::Api).await.unwrap();
        let err = q.push_records(records(2), JobOrigin::Api).await.unwrap_err();
        assert!(matches!(err, QueueError::Full { capacity: 1 }));
        // The rejected job is not tracked.
        assert_eq!(q.in_flight(), 1);
    }

    #[tokio::test]
    async fn block_mode_waits_for_space() {
        let q = queue(1, BackpressureMode::Block);
        q.push_records(records(1), JobOrigin::Api).await.unwrap();

        let pusher = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.push_records(records(2), JobOrigin::Api).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pusher.is_finished());

        let first = q.pull().await.unwrap();
        q.complete(&first, JobOutcome::default());
        let handle = pusher.await.unwrap().unwrap();
        assert!(!handle.coalesced);
        assert_eq!(q.pull().await.unwrap().id, handle.id);
    }

    #[tokio::test]
    async fn abandoned_blocking_push_leaves_no_job() {
        let q = queue(1, BackpressureMode::Block);
        let first = q.push_records(records(1), JobOrigin::Api).await.unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            q.push_records(records(2), JobOrigin::Api),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(q.in_flight(), 1);
        assert_eq!(q.unfinished_jobs(), vec![first.id]);

        let job = q.pull().await.unwrap();
        q.complete(&job, JobOutcome::default());
        assert!(q.wait_idle(Duration::from_millis(10)).await);

        // The same payload is accepted as a fresh job and runs.
        let mut again = q.push_records(records(2), JobOrigin::Api).await.unwrap();
        assert!(!again.coalesced);
        let job = q.pull().await.unwrap();
        assert_eq!(job.id, again.id);
        q.complete(&job, JobOutcome::default());
        assert!(matches!(again.wait().await, JobStatus::Succeeded(_)));
        assert!(q.wait_idle(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn identical_payload_is_coalesced() {
        let q = queue(8, BackpressureMode::Reject);
        let a = q.push_records(records(1), JobOrigin::Api).await.unwrap();
        let b = q.push_records(records(1), JobOrigin::Watcher).await.unwrap();
        assert_eq!(a.id, b.id);
        assert!(b.coalesced);
        assert_eq!(q.depth(), 1);

        // Still coalesced after success, within the window.
        let job = q.pull().await.unwrap();
        q.complete(&job, JobOutcome::default());
        let c = q.push_records(records(1), JobOrigin::Api).await.unwrap();
        assert_eq!(c.id, a.id);

        // Forgotten after a dedup reset.
        q.clear_dedup();
        let d = q.push_records(records(1), JobOrigin::Api).await.unwrap();
        assert_ne!(d.id, a.id);
    }

    #[tokio::test]
    async fn failed_payload_can_be_resubmitted() {
        let q = queue(8, BackpressureMode::Reject);
        let a = q.push_records(records(1), JobOrigin::Api).await.unwrap();
        let job = q.pull().await.unwrap();
        q.fail(&job, "bad");
        let b = q.push_records(records(1), JobOrigin::Api).await.unwrap();
        assert_ne!(a.id, b.id);
        assert!(!b.coalesced);
        assert_eq!(
            q.job_status(a.id),
            Some(JobStatus::Failed {
                message: "bad".into()
            })
        );
    }

    #[tokio::test]
    async fn retry_reenqueues_until_budget_spent() {
        let q = queue(8, BackpressureMode::Block);
        let mut handle = q.push_records(records(1), JobOrigin::Api).await.unwrap();

        let job = q.pull().await.unwrap();
        assert_eq!(job.attempt, 1);
        assert!(q.retry_later(job));
        let job = q.pull().await.unwrap();
        assert_eq!(job.attempt, 2);
        assert!(q.retry_later(job));
        let job = q.pull().await.unwrap();
        assert_eq!(job.attempt, 3);
        assert!(!q.retry_later(job.clone()));
        q.fail(&job, "gave up");

        assert!(matches!(handle.wait().await, JobStatus::Failed { .. }));
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test]
    async fn close_rejects_new_work_but_drains_queued() {
        let q = queue(8, BackpressureMode::Block);
        let handle = q.push_records(records(1), JobOrigin::Api).await.unwrap();
        q.close();
        assert!(matches!(
            q.push_records(records(2), JobOrigin::Api).await,
            Err(QueueError::ShuttingDown)
        ));
        let job = q.pull().await.unwrap();
        assert_eq!(job.id, handle.id);
        assert_eq!(q.unfinished_jobs(), vec![handle.id]);
        q.complete(&job, JobOutcome::default());
        assert!(q.pull().await.is_none());
        assert!(q.wait_idle(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn file_push_hashes_content() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        std::fs::write(&a, b"[]").unwrap();
        std::fs::write(&b, b"[]").unwrap();
        let q = queue(8, BackpressureMode::Block);
        let ha = q.push_file(a, JobOrigin::Watcher).await.unwrap();
        let hb = q.push_file(b, JobOrigin::Watcher).await.unwrap();
        assert_eq!(ha.id, hb.id);

        let missing = q
            .push_file(dir.path().join("missing.json"), JobOrigin::Api)
            .await
            .unwrap_err();
        assert!(matches!(missing, QueueError::Unreadable { .. }));
    }
}
