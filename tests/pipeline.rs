//! End-to-end tests for the ingestion pipeline.
//!
//! Each test starts a real [`Pipeline`] (workers, sync loop, optional watcher)
//! against the embedded oxigraph store and drives it through the public
//! operations.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value, json};

use papergraph::backup::list_snapshots;
use papergraph::config::{PipelineConfig, SinkBackend};
use papergraph::error::{PipelineError, SyncError, SyncResult, WatchError};
use papergraph::metrics::{FailureKind, HealthStatus};
use papergraph::pipeline::Pipeline;
use papergraph::queue::JobStatus;
use papergraph::store::{EmbeddedTripleStore, SyncBatch, TripleSink};
use papergraph::watcher::QUARANTINE_DIR;

fn test_config(dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.ingest.workers = 2;
    config.ingest.debounce_ms = 50;
    config.ingest.poll_interval_ms = 20;
    config.queue.dedup_window_secs = 0;
    config.queue.retry_base_ms = 10;
    config.sync.backend = SinkBackend::Embedded;
    config.sync.flush_interval_ms = 20;
    config.backup.dir = dir.join("backups");
    config.backup.interval_secs = 0;
    config.shutdown.drain_timeout_secs = 5;
    config
}

fn start(config: PipelineConfig) -> (Pipeline, Arc<EmbeddedTripleStore>) {
    let store = Arc::new(EmbeddedTripleStore::in_memory().unwrap());
    let sink: Arc<dyn TripleSink> = store.clone();
    (Pipeline::start(config, sink).unwrap(), store)
}

fn swin_record() -> Value {
    json!({
        "sourceUrl": "https://arxiv.org/pdf/2103.14030v2.pdf",
        "title": "T",
        "tasks": ["Image Classification"],
        "results": [{
            "task": "Segmentation",
            "dataset": "ADE20K",
            "model": "M",
            "metric": "mIoU",
            "value": "53.50",
            "rank": "75"
        }]
    })
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..250 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submitted_record_reaches_the_triplestore_once() {
    let dir = tempfile::TempDir::new().unwrap();
    let (pipeline, store) = start(test_config(dir.path()));

    let mut job = pipeline.submit_records(vec![swin_record()]).await.unwrap();
    let JobStatus::Succeeded(outcome) = job.wait().await else {
        panic!("job did not succeed");
    };
    assert_eq!(outcome.records_accepted, 1);
    assert!(outcome.triples_added > 0);

    let stats = pipeline.get_stats().await;
    assert_eq!(stats.entities.papers, 1);
    assert_eq!(stats.entities.tasks, 2);
    assert_eq!(stats.entities.datasets, 1);
    assert_eq!(stats.entities.results, 1);
    assert_eq!(stats.entities.methods, 0);

    pipeline.flush().await;
    let synced = store.triple_count().unwrap();
    assert_eq!(synced, stats.triple_count as u64);

    // Identical resubmission: processed again, nothing new anywhere.
    let mut again = pipeline.submit_records(vec![swin_record()]).await.unwrap();
    assert!(!again.coalesced);
    let JobStatus::Succeeded(outcome) = again.wait().await else {
        panic!("resubmission did not succeed");
    };
    assert_eq!(outcome.triples_added, 0);
    pipeline.flush().await;
    assert_eq!(pipeline.get_stats().await.triple_count, stats.triple_count);
    assert_eq!(store.triple_count().unwrap(), synced);

    let report = pipeline.shutdown().await;
    assert!(report.drained);
    assert!(report.incomplete_jobs.is_empty());
    assert_eq!(report.parked_batches, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_submission_within_window_is_coalesced() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.queue.dedup_window_secs = 60;
    let (pipeline, _store) = start(config);

    let mut first = pipeline.submit_records(vec![swin_record()]).await.unwrap();
    first.wait().await;
    let second = pipeline.submit_records(vec![swin_record()]).await.unwrap();
    assert!(second.coalesced);
    assert_eq!(second.id, first.id);

    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn final_graph_is_independent_of_submission_order() {
    let records = vec![
        swin_record(),
        json!({"url": "https://example.org/a.pdf", "title": "A", "methods": ["Adam", "Dropout"]}),
        json!({"pdfUrl": "https://example.org/b.pdf", "title": "B", "datasets": ["ADE20K"], "tasks": ["Segmentation"]}),
    ];

    let dir = tempfile::TempDir::new().unwrap();
    let (forward, _) = start(test_config(dir.path()));
    let mut job = forward.submit_records(records.clone()).await.unwrap();
    job.wait().await;

    let (backward, _) = start(test_config(dir.path()));
    let mut handles = Vec::new();
    for record in records.into_iter().rev() {
        handles.push(backward.submit_records(vec![record]).await.unwrap());
    }
    for handle in &mut handles {
        handle.wait().await;
    }

    assert_eq!(
        forward.graph().ntriples_lines(),
        backward.graph().ntriples_lines()
    );
    forward.shutdown().await;
    backward.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_records_are_reported_not_fatal() {
    let dir = tempfile::TempDir::new().unwrap();
    let (pipeline, _) = start(test_config(dir.path()));

    let mut mixed = pipeline
        .submit_records(vec![swin_record(), json!({"title": "no url"})])
        .await
        .unwrap();
    let JobStatus::Succeeded(outcome) = mixed.wait().await else {
        panic!("mixed batch should succeed");
    };
    assert_eq!(outcome.records_accepted, 1);
    assert_eq!(outcome.records_rejected, 1);

    let mut hopeless = pipeline
        .submit_records(vec![json!({"url": "https://example.org/x.pdf"})])
        .await
        .unwrap();
    assert!(matches!(hopeless.wait().await, JobStatus::Failed { .. }));

    let health = pipeline.get_health(true).await;
    let detail = health.detail.unwrap();
    let kinds: Vec<FailureKind> = detail.recent_failures.iter().map(|f| f.kind).collect();
    assert!(kinds.contains(&FailureKind::Validation));
    assert!(kinds.contains(&FailureKind::Ingest));
    assert_eq!(detail.metrics.counters["records_rejected"], 2);

    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watcher_ingests_and_quarantines() {
    let dir = tempfile::TempDir::new().unwrap();
    let inbox = dir.path().join("inbox");
    std::fs::create_dir_all(&inbox).unwrap();
    // Present before start: picked up by the startup sweep.
    std::fs::write(
        inbox.join("papers.json"),
        serde_json::to_vec(&vec![swin_record()]).unwrap(),
    )
    .unwrap();

    let mut config = test_config(dir.path());
    config.ingest.watch_dir = Some(inbox.clone());
    let (pipeline, _) = start(config);

    wait_for("swept file to be ingested", || {
        pipeline.graph().entity_counts().papers == 1
    })
    .await;

    // Dropped while running: debounced, fails to parse, quarantined.
    std::fs::write(inbox.join("broken.json"), b"[{\"title\": ").unwrap();
    let quarantine = inbox.join(QUARANTINE_DIR);
    wait_for("broken file to be quarantined", || {
        std::fs::read_dir(&quarantine)
            .map(|entries| entries.count() == 2)
            .unwrap_or(false)
    })
    .await;
    assert!(!inbox.join("broken.json").exists());

    let scan = pipeline.trigger_scan().await.unwrap();
    assert_eq!(scan.files, 1);

    let report = pipeline.shutdown().await;
    assert!(report.drained);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scan_requires_a_watch_directory() {
    let dir = tempfile::TempDir::new().unwrap();
    let (pipeline, _) = start(test_config(dir.path()));
    let err = pipeline.trigger_scan().await.unwrap_err();
    assert!(matches!(err, PipelineError::Watch(WatchError::Unconfigured)));
    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn uploaded_file_is_ingested() {
    let dir = tempfile::TempDir::new().unwrap();
    let file = dir.path().join("upload.json");
    // A single object is a batch of one.
    std::fs::write(&file, serde_json::to_vec(&swin_record()).unwrap()).unwrap();

    let (pipeline, _) = start(test_config(dir.path()));
    let mut job = pipeline.upload_file(&file).await.unwrap();
    assert!(matches!(job.wait().await, JobStatus::Succeeded(_)));
    assert!(matches!(
        pipeline.job_status(job.id),
        Some(JobStatus::Succeeded(_))
    ));
    assert!(pipeline.upload_file(dir.path().join("missing.json")).await.is_err());
    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backup_and_clear() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.backup.keep = 2;
    let (pipeline, store) = start(config);

    let mut job = pipeline.submit_records(vec![swin_record()]).await.unwrap();
    job.wait().await;
    let triples = pipeline.graph().len();

    for _ in 0..3 {
        let info = pipeline.create_backup().await.unwrap();
        assert_eq!(info.triple_count, triples);
    }
    let snapshots = list_snapshots(&dir.path().join("backups")).unwrap();
    assert_eq!(snapshots.len(), 2);
    let content = std::fs::read_to_string(&snapshots[1]).unwrap();
    assert_eq!(content.lines().count(), triples);

    pipeline.flush().await;
    pipeline.clear_graph().await.unwrap();
    let stats = pipeline.get_stats().await;
    assert_eq!(stats.triple_count, 0);
    assert_eq!(stats.store_triple_count, Some(0));
    assert_eq!(store.triple_count().unwrap(), 0);

    // Snapshots survive a clear.
    assert_eq!(list_snapshots(&dir.path().join("backups")).unwrap().len(), 2);
    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn healthy_pipeline_reports_healthy() {
    let dir = tempfile::TempDir::new().unwrap();
    let (pipeline, _) = start(test_config(dir.path()));
    let mut job = pipeline.submit_records(vec![swin_record()]).await.unwrap();
    job.wait().await;

    let health = pipeline.get_health(false).await;
    assert_eq!(health.status, HealthStatus::Healthy);
    assert!(health.triplestore_reachable);
    assert!(health.detail.is_none());
    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_flushes_outstanding_triples() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.sync.flush_interval_ms = 60_000;
    let (pipeline, store) = start(config);

    let mut job = pipeline.submit_records(vec![swin_record()]).await.unwrap();
    job.wait().await;
    let triples = pipeline.graph().len();

    let report = pipeline.shutdown().await;
    assert!(report.drained);
    assert_eq!(report.sync.triples_sent, triples);
    assert_eq!(store.triple_count().unwrap(), triples as u64);

    assert!(report.final_snapshot.is_none());
}

/// Refuses every insert while `reject` is set, as a store with bad
/// credentials would.
struct RejectingSink {
    inner: EmbeddedTripleStore,
    reject: AtomicBool,
}

impl TripleSink for RejectingSink {
    fn name(&self) -> &str {
        "rejecting"
    }
    fn insert(&self, batch: &SyncBatch) -> SyncResult<()> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(SyncError::Permanent {
                status: Some(401),
                message: "unauthorized".into(),
            });
        }
        self.inner.insert(batch)
    }
    fn triple_count(&self) -> SyncResult<u64> {
        self.inner.triple_count()
    }
    fn ping(&self) -> SyncResult<()> {
        Ok(())
    }
    fn clear(&self) -> SyncResult<()> {
        self.inner.clear()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_triples_are_sent_again_on_resubmission() {
    let dir = tempfile::TempDir::new().unwrap();
    let sink = Arc::new(RejectingSink {
        inner: EmbeddedTripleStore::in_memory().unwrap(),
        reject: AtomicBool::new(true),
    });
    let mut config = test_config(dir.path());
    config.queue.dedup_window_secs = 60;
    let pipeline = Pipeline::start(config, sink.clone()).unwrap();

    let mut job = pipeline.submit_records(vec![swin_record()]).await.unwrap();
    assert!(matches!(job.wait().await, JobStatus::Succeeded(_)));
    pipeline.flush().await;
    assert_eq!(sink.triple_count().unwrap(), 0);
    assert!(pipeline.graph().is_empty());

    // Credentials fixed: the same payload is processed again, not coalesced.
    sink.reject.store(false, Ordering::SeqCst);
    let mut again = pipeline.submit_records(vec![swin_record()]).await.unwrap();
    assert!(!again.coalesced);
    let JobStatus::Succeeded(outcome) = again.wait().await else {
        panic!("resubmission did not succeed");
    };
    assert!(outcome.triples_added > 0);
    pipeline.flush().await;
    assert_eq!(sink.triple_count().unwrap(), pipeline.graph().len() as u64);
    assert!(sink.triple_count().unwrap() > 0);

    pipeline.shutdown().await;
}
