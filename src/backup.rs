//! Graph snapshots and retention.
//!
//! A snapshot is the full accumulator written as sorted N-Triples to
//! `kg_backup_<UTC timestamp>_<seq>.nt`. Names sort in creation order, so
//! retention is a lexical sort: keep the newest `keep`, delete the rest
//! oldest first. Writes go to a temporary file that is fsynced and renamed
//! into place; pruning only runs after a write succeeded.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{SnapshotError, SnapshotResult};
use crate::graph::GraphAccumulator;
use crate::metrics::{Counter, FailureKind, Metrics, Stage};

pub const SNAPSHOT_PREFIX: &str = "kg_backup_";
pub const SNAPSHOT_EXTENSION: &str = "nt";
const TEMP_NAME: &str = ".kg_backup.tmp";

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub dir: PathBuf,
    /// Snapshots retained after each successful write.
    pub keep: usize,
    /// Period of scheduled snapshots; zero disables the schedule.
    pub interval: Duration,
}

/// Result of a successful snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub triple_count: usize,
    pub bytes: u64,
    /// Older snapshots removed by retention.
    pub pruned: Vec<PathBuf>,
}

fn is_snapshot(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.starts_with(SNAPSHOT_PREFIX)
        && path.extension().and_then(|e| e.to_str()) == Some(SNAPSHOT_EXTENSION)
}

/// Snapshot files in `dir`, oldest first.
pub fn list_snapshots(dir: &Path) -> SnapshotResult<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|source| SnapshotError::List {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut snapshots: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_snapshot(p))
        .collect();
    snapshots.sort();
    Ok(snapshots)
}

/// Delete all but the newest `keep` snapshots in `dir`. Returns the deleted paths.
pub fn prune_snapshots(dir: &Path, keep: usize) -> SnapshotResult<Vec<PathBuf>> {
    let snapshots = list_snapshots(dir)?;
    let excess = snapshots.len().saturating_sub(keep);
    let mut pruned = Vec::with_capacity(excess);
    for path in snapshots.into_iter().take(excess) {
        std::fs::remove_file(&path).map_err(|source| SnapshotError::Prune {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "pruned snapshot");
        pruned.push(path);
    }
    Ok(pruned)
}

pub struct BackupManager {
    config: BackupConfig,
    graph: Arc<GraphAccumulator>,
    metrics: Arc<Metrics>,
    write_lock: Mutex<()>,
    seq: AtomicU64,
    dirty: AtomicBool,
}

impl BackupManager {
    pub fn new(config: BackupConfig, graph: Arc<GraphAccumulator>, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            graph,
            metrics,
            write_lock: Mutex::new(()),
            seq: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Note that the graph changed since the last snapshot.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn next_path(&self, now: DateTime<Utc>) -> PathBuf {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.config.dir.join(format!(
            "{SNAPSHOT_PREFIX}{}_{seq:06}.{SNAPSHOT_EXTENSION}",
            now.format("%Y%m%dT%H%M%S%3fZ")
        ))
    }

    /// Write a snapshot and apply retention. Blocking.
    pub fn snapshot_now(&self) -> SnapshotResult<SnapshotInfo> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let started = Instant::now();
        let was_dirty = self.dirty.swap(false, Ordering::AcqRel);

        match self.write_snapshot() {
            Ok(mut info) => {
                match prune_snapshots(&self.config.dir, self.config.keep) {
                    Ok(pruned) => info.pruned = pruned,
                    Err(e) => {
                        tracing::warn!(error = %e, "snapshot written but retention failed");
                        self.metrics.record_failure(
                            FailureKind::SnapshotWrite,
                            self.config.dir.display().to_string(),
                            e.to_string(),
                        );
                    }
                }
                self.metrics.incr(Counter::SnapshotsCreated);
                self.metrics.record_timing(Stage::Snapshot, started.elapsed());
                tracing::info!(
                    path = %info.path.display(),
                    triples = info.triple_count,
                    pruned = info.pruned.len(),
                    "snapshot created"
                );
                Ok(info)
            }
            Err(e) => {
                if was_dirty {
                    self.mark_dirty();
                }
                self.metrics.incr(Counter::SnapshotsFailed);
                self.metrics.record_failure(
                    FailureKind::SnapshotWrite,
                    self.config.dir.display().to_string(),
                    e.to_string(),
                );
                tracing::error!(error = %e, "snapshot failed; retention skipped");
                Err(e)
            }
        }
    }

    fn write_snapshot(&self) -> SnapshotResult<SnapshotInfo> {
        let tmp = self.config.dir.join(TEMP_NAME);
        let write_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| SnapshotError::Write { path, source }
        };

        std::fs::create_dir_all(&self.config.dir).map_err(write_err(&self.config.dir))?;

        let lines = self.graph.ntriples_lines();
        let file = File::create(&tmp).map_err(write_err(&tmp))?;
        let mut out = BufWriter::new(file);
        for line in &lines {
            out.write_all(line.as_bytes()).map_err(write_err(&tmp))?;
            out.write_all(b"\n").map_err(write_err(&tmp))?;
        }
        let file = out
            .into_inner()
            .map_err(|e| SnapshotError::Write {
                path: tmp.clone(),
                source: e.into_error(),
            })?;
        file.sync_all().map_err(write_err(&tmp))?;
        let bytes = file.metadata().map(|m| m.len()).unwrap_or(0);
        drop(file);

        let created_at = Utc::now();
        let path = self.next_path(created_at);
        std::fs::rename(&tmp, &path).map_err(write_err(&path))?;

        Ok(SnapshotInfo {
            path,
            created_at,
            triple_count: lines.len(),
            bytes,
            pruned: Vec::new(),
        })
    }

    /// On-demand snapshot from async code.
    pub async fn create_snapshot(self: &Arc<Self>) -> SnapshotResult<SnapshotInfo> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || this.snapshot_now())
            .await
            .map_err(|e| SnapshotError::Task {
                message: e.to_string(),
            })?
    }

    /// Scheduled snapshots. Ticks with no merged changes since the last
    /// snapshot are skipped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.config.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; nothing worth saving yet.
        tick.tick().await;
        tracing::info!(
            dir = %self.config.dir.display(),
            interval_secs = self.config.interval.as_secs(),
            keep = self.config.keep,
            "scheduled backups enabled"
        );

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            if !self.is_dirty() {
                tracing::debug!("graph unchanged, skipping scheduled snapshot");
                continue;
            }
            // Failures are already reported inside.
            let _ = self.create_snapshot().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphMapper;
    use crate::normalize::normalize_value;
    use serde_json::json;
    use tempfile::TempDir;

    fn manager(dir: &Path, keep: usize) -> (BackupManager, Arc<GraphAccumulator>) {
        let graph = Arc::new(GraphAccumulator::new());
        let rec = normalize_value(&json!({
            "url": "https://arxiv.org/pdf/2103.14030v2.pdf",
            "title": "T",
            "tasks": ["Detection"]
        }))
        .unwrap();
        graph.merge(GraphMapper::new().map_record(&rec));
        let m = BackupManager::new(
            BackupConfig {
                dir: dir.to_path_buf(),
                keep,
                interval: Duration::ZERO,
            },
            graph.clone(),
            Arc::new(Metrics::new()),
        );
        (m, graph)
    }

    #[test]
    fn snapshot_contains_whole_graph() {
        let dir = TempDir::new().unwrap();
        let (m, graph) = manager(dir.path(), 3);
        let info = m.snapshot_now().unwrap();
        let text = std::fs::read_to_string(&info.path).unwrap();
        assert_eq!(text.lines().count(), graph.len());
        assert_eq!(info.triple_count, graph.len());
        assert_eq!(info.bytes, text.len() as u64);
        assert!(!dir.path().join(TEMP_NAME).exists());
    }

    #[test]
    fn retention_keeps_newest_k() {
        let dir = TempDir::new().unwrap();
        let (m, _) = manager(dir.path(), 3);
        let mut written = Vec::new();
        for _ in 0..5 {
            written.push(m.snapshot_now().unwrap().path);
        }
        let remaining = list_snapshots(dir.path()).unwrap();
        assert_eq!(remaining, written[2..].to_vec());
    }

    #[test]
    fn failed_write_prunes_nothing() {
        let dir = TempDir::new().unwrap();
        let (m, _) = manager(dir.path(), 1);
        let first = m.snapshot_now().unwrap().path;

        // Block the temp path so the next write fails.
        std::fs::create_dir(dir.path().join(TEMP_NAME)).unwrap();
        let err = m.snapshot_now().unwrap_err();
        assert!(matches!(err, SnapshotError::Write { .. }));
        assert_eq!(list_snapshots(dir.path()).unwrap(), vec![first]);
    }

    #[test]
    fn failed_write_keeps_dirty_flag() {
        let dir = TempDir::new().unwrap();
        let (m, _) = manager(dir.path(), 1);
        m.mark_dirty();
        std::fs::create_dir(dir.path().join(TEMP_NAME)).unwrap();
        assert!(m.snapshot_now().is_err());
        assert!(m.is_dirty());
    }

    #[test]
    fn equal_graphs_produce_identical_snapshots() {
        let dir = TempDir::new().unwrap();
        let (m, _) = manager(dir.path(), 5);
        let a = std::fs::read(m.snapshot_now().unwrap().path).unwrap();
        let b = std::fs::read(m.snapshot_now().unwrap().path).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn prune_ignores_foreign_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep me").unwrap();
        std::fs::write(dir.path().join("kg_backup_20200101T000000000Z_000000.nt"), "").unwrap();
        std::fs::write(dir.path().join("kg_backup_20210101T000000000Z_000000.nt"), "").unwrap();
        let pruned = prune_snapshots(dir.path(), 1).unwrap();
        assert_eq!(pruned.len(), 1);
        assert!(pruned[0].ends_with("kg_backup_20200101T000000000Z_000000.nt"));
        assert!(dir.path().join("notes.txt").exists());
    }
}
