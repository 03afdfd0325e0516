//! The running service: queue, workers, watcher, sync and backup tasks.
//!
//! [`Pipeline::start`] wires the subsystems together around one shared graph
//! accumulator and spawns the long-lived tasks. The methods on [`Pipeline`]
//! are the operations offered to an outer API layer; [`Pipeline::shutdown`]
//! runs the bounded drain sequence.

pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backup::{BackupManager, SnapshotInfo};
use crate::config::PipelineConfig;
use crate::error::{PipelineResult, QueueError, QueueResult, SnapshotResult, WatchError};
use crate::graph::{EntityCounts, GraphAccumulator, GraphMapper};
use crate::metrics::{HealthReport, Metrics};
use crate::queue::{IngestQueue, JobHandle, JobId, JobOrigin, JobStatus};
use crate::store::TripleSink;
use crate::sync::{SyncClient, SyncSummary};
use crate::watcher::{FileWatcher, blocking_dir, scan_directory};

pub use worker::{NormalizedBatch, map_records, normalize_batch, parse_payload};

use worker::WorkerContext;

/// How long an idle worker gets to notice the closed queue.
const WORKER_EXIT_GRACE: Duration = Duration::from_secs(5);

/// What a manual scan of the watched directory did.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanResult {
    /// Matching files found.
    pub files: usize,
    /// New jobs created.
    pub enqueued: usize,
    /// Files folded into an existing job with identical content.
    pub coalesced: usize,
    /// Files that could not be enqueued (vanished, unreadable, queue full).
    pub skipped: usize,
    pub job_ids: Vec<JobId>,
}

/// Graph statistics, local and remote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphStats {
    /// Triples in the local accumulator.
    pub triple_count: usize,
    pub entities: EntityCounts,
    pub store: String,
    /// Triples reported by the triplestore; `None` when it did not answer.
    pub store_triple_count: Option<u64>,
    pub pending_triples: usize,
    pub parked_batches: usize,
    pub queue_depth: usize,
}

/// Result of [`Pipeline::shutdown`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Every job reached a terminal state before the drain timeout.
    pub drained: bool,
    /// Jobs still queued, running or awaiting retry when workers stopped.
    pub incomplete_jobs: Vec<JobId>,
    /// Deliveries made by the sync loop over its lifetime, final flush included.
    pub sync: SyncSummary,
    /// Batches still parked because the triplestore never came back.
    pub parked_batches: usize,
    pub final_snapshot: Option<PathBuf>,
}

/// Handle to a running pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    metrics: Arc<Metrics>,
    graph: Arc<GraphAccumulator>,
    queue: Arc<IngestQueue>,
    sync: Arc<SyncClient>,
    backup: Arc<BackupManager>,
    /// Stops the watcher (intake).
    intake_tx: watch::Sender<bool>,
    /// Stops sync and backup loops, after workers have drained.
    stop_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
    sync_task: JoinHandle<SyncSummary>,
    backup_task: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Validate `config` and spawn every background task onto the current
    /// tokio runtime.
    pub fn start(config: PipelineConfig, sink: Arc<dyn TripleSink>) -> PipelineResult<Self> {
        config.validate()?;

        let metrics = Arc::new(Metrics::new());
        let graph = Arc::new(GraphAccumulator::new());
        let queue = Arc::new(IngestQueue::new(config.queue_config(), Arc::clone(&metrics)));
        let backup = Arc::new(BackupManager::new(
            config.backup_config(),
            Arc::clone(&graph),
            Arc::clone(&metrics),
        ));
        let sync = {
            let graph = Arc::clone(&graph);
            let queue = Arc::clone(&queue);
            let backup = Arc::clone(&backup);
            Arc::new(
                SyncClient::new(sink, config.sync_config(), Arc::clone(&metrics)).on_rejected(
                    move |batch| {
                        // Rejected triples leave the local graph so that
                        // resubmitting the payload sends them again.
                        let removed = graph.remove(&batch.triples);
                        queue.clear_dedup();
                        backup.mark_dirty();
                        tracing::warn!(batch_id = batch.id, removed, "rejected triples dropped from graph");
                    },
                ),
            )
        };

        let (intake_tx, intake_rx) = watch::channel(false);
        let (stop_tx, stop_rx) = watch::channel(false);

        let quarantine_root = if config.ingest.quarantine {
            config.ingest.watch_dir.clone()
        } else {
            None
        };
        let ctx = Arc::new(WorkerContext {
            queue: Arc::clone(&queue),
            graph: Arc::clone(&graph),
            mapper: GraphMapper::new(),
            sync: Arc::clone(&sync),
            backup: Arc::clone(&backup),
            metrics: Arc::clone(&metrics),
            quarantine_root,
        });
        let workers = (0..config.workers())
            .map(|n| tokio::spawn(Arc::clone(&ctx).run(n)))
            .collect();

        let sync_task = tokio::spawn(Arc::clone(&sync).run(stop_rx.clone()));

        let backup_task = if config.backup_config().interval.is_zero() {
            tracing::info!("scheduled backups disabled");
            None
        } else {
            Some(tokio::spawn(Arc::clone(&backup).run(stop_rx)))
        };

        let watcher = config.watcher_config().map(|wc| {
            let watcher = FileWatcher::new(wc, Arc::clone(&queue), Arc::clone(&metrics));
            tokio::spawn(watcher.run(intake_rx))
        });

        tracing::info!(
            workers = config.workers(),
            store = sync.sink().name(),
            watch_dir = ?config.ingest.watch_dir,
            backup_dir = %config.backup.dir.display(),
            "pipeline started"
        );

        Ok(Self {
            config,
            metrics,
            graph,
            queue,
            sync,
            backup,
            intake_tx,
            stop_tx,
            workers,
            watcher,
            sync_task,
            backup_task,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn graph(&self) -> &Arc<GraphAccumulator> {
        &self.graph
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Enqueue a batch of raw records.
    pub async fn submit_records(&self, records: Vec<Value>) -> QueueResult<JobHandle> {
        self.queue.push_records(records, JobOrigin::Api).await
    }

    /// Enqueue a JSON file by path.
    pub async fn upload_file(&self, path: impl Into<PathBuf>) -> QueueResult<JobHandle> {
        self.queue.push_file(path.into(), JobOrigin::Api).await
    }

    /// Enqueue every matching file currently in the watched directory,
    /// including ones the watcher already handled.
    pub async fn trigger_scan(&self) -> PipelineResult<ScanResult> {
        let wc = self.config.watcher_config().ok_or(WatchError::Unconfigured)?;
        let files = {
            let (dir, extension) = (wc.dir.clone(), wc.extension.clone());
            blocking_dir(&wc.dir, move || scan_directory(&dir, &extension)).await?
        };

        let mut result = ScanResult {
            files: files.len(),
            ..ScanResult::default()
        };
        for path in files {
            match self.queue.push_file(path.clone(), JobOrigin::Watcher).await {
                Ok(handle) => {
                    if handle.coalesced {
                        result.coalesced += 1;
                    } else {
                        result.enqueued += 1;
                    }
                    result.job_ids.push(handle.id);
                }
                Err(QueueError::ShuttingDown) => return Err(QueueError::ShuttingDown.into()),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "scan skipped file");
                    result.skipped += 1;
                }
            }
        }
        tracing::info!(
            files = result.files,
            enqueued = result.enqueued,
            coalesced = result.coalesced,
            skipped = result.skipped,
            "scan complete"
        );
        Ok(result)
    }

    pub async fn get_stats(&self) -> GraphStats {
        let sink = Arc::clone(self.sync.sink());
        let store_triple_count = match tokio::task::spawn_blocking(move || sink.triple_count()).await {
            Ok(Ok(n)) => Some(n),
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "triplestore count unavailable");
                None
            }
            Err(_) => None,
        };
        GraphStats {
            triple_count: self.graph.len(),
            entities: self.graph.entity_counts(),
            store: self.sync.sink().name().to_string(),
            store_triple_count,
            pending_triples: self.sync.pending(),
            parked_batches: self.sync.parked(),
            queue_depth: self.queue.depth(),
        }
    }

    /// Probe the triplestore, then derive health from recent outcomes.
    pub async fn get_health(&self, detailed: bool) -> HealthReport {
        self.sync.probe().await;
        self.metrics.set_queue_depth(self.queue.depth());
        self.metrics.set_pending_triples(self.sync.pending());
        self.metrics.set_parked_batches(self.sync.parked());
        self.metrics.health(detailed)
    }

    /// Write a snapshot now, regardless of whether the graph changed.
    pub async fn create_backup(&self) -> SnapshotResult<SnapshotInfo> {
        self.backup.create_snapshot().await
    }

    /// Empty the triplestore and every piece of local state derived from
    /// past ingestion: accumulator, outbox, parked batches and dedup memory.
    pub async fn clear_graph(&self) -> PipelineResult<()> {
        self.sync
            .clear_store(|| {
                self.graph.clear();
                self.queue.clear_dedup();
            })
            .await?;
        tracing::info!("graph cleared");
        Ok(())
    }

    pub fn job_status(&self, id: JobId) -> Option<JobStatus> {
        self.queue.job_status(id)
    }

    /// Push everything pending to the triplestore now.
    pub async fn flush(&self) -> SyncSummary {
        self.sync.flush().await
    }

    /// Stop intake, drain jobs up to the configured timeout, abort what is
    /// left, flush the outbox and stop the background loops.
    pub async fn shutdown(self) -> ShutdownReport {
        tracing::info!("shutting down");
        let _ = self.intake_tx.send(true);
        if let Some(watcher) = self.watcher {
            let _ = watcher.await;
        }

        self.queue.close();
        let drain_timeout = self.config.drain_timeout();
        let drained = self.queue.wait_idle(drain_timeout).await;
        let incomplete_jobs = self.queue.unfinished_jobs();
        if drained {
            for mut worker in self.workers {
                if tokio::time::timeout(WORKER_EXIT_GRACE, &mut worker).await.is_err() {
                    worker.abort();
                }
            }
        } else {
            tracing::warn!(
                incomplete = incomplete_jobs.len(),
                timeout_secs = drain_timeout.as_secs(),
                "drain timed out; aborting workers"
            );
            for worker in &self.workers {
                worker.abort();
            }
        }

        let _ = self.stop_tx.send(true);
        let sync = self.sync_task.await.unwrap_or_default();
        if let Some(task) = self.backup_task {
            let _ = task.await;
        }

        let final_snapshot = if !self.config.backup_config().interval.is_zero() && self.backup.is_dirty() {
            self.backup.create_snapshot().await.ok().map(|info| info.path)
        } else {
            None
        };

        let report = ShutdownReport {
            drained,
            incomplete_jobs,
            sync,
            parked_batches: self.sync.parked(),
            final_snapshot,
        };
        tracing::info!(
            drained = report.drained,
            incomplete = report.incomplete_jobs.len(),
            batches_sent = report.sync.batches_sent,
            parked = report.parked_batches,
            "pipeline stopped"
        );
        report
    }
}
