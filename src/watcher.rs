//! Directory watcher: startup sweep, then a polling observer with per-file
//! debounce.
//!
//! Each poll stats every matching file in the watched directory. A file is
//! emitted as an ingestion job once its (size, mtime) signature has held
//! still for the debounce interval and differs from the signature last
//! emitted for it. Any change in between resets that file's timer, so a file
//! written in several chunks yields one job for the final content.
//!
//! Delivery is at-least-once. Restarts re-sweep the directory; the queue's
//! dedup guard and the idempotent graph merge absorb the repeats.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use tokio::sync::watch;

use crate::error::{QueueError, WatchError};
use crate::metrics::{Counter, FailureKind, Metrics};
use crate::queue::{IngestQueue, JobOrigin};

/// Subdirectory that receives files which failed permanently.
pub const QUARANTINE_DIR: &str = "quarantine";

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub dir: PathBuf,
    /// Extension without the dot, compared case-insensitively.
    pub extension: String,
    pub debounce: Duration,
    pub poll_interval: Duration,
}

/// (size, mtime) of a file as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl Signature {
    fn of(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

#[derive(Debug)]
struct FileState {
    observed: Signature,
    changed_at: Instant,
    emitted: Option<Signature>,
}

/// List matching files in `dir`, sorted. Skips directories and hidden files.
pub fn scan_directory(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, WatchError> {
    let entries = std::fs::read_dir(dir).map_err(|source| WatchError::Directory {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            !path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'))
        })
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(extension))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Matching files in `dir` with their current signatures. Files that vanish
/// between listing and stat are left out.
pub fn observe_directory(dir: &Path, extension: &str) -> Result<Vec<(PathBuf, Signature)>, WatchError> {
    Ok(scan_directory(dir, extension)?
        .into_iter()
        .filter_map(|path| Signature::of(&path).ok().map(|sig| (path, sig)))
        .collect())
}

/// Run blocking directory work for `dir` off the async runtime.
pub async fn blocking_dir<T, F>(dir: &Path, f: F) -> Result<T, WatchError>
where
    F: FnOnce() -> Result<T, WatchError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .unwrap_or_else(|e| {
            Err(WatchError::Directory {
                path: dir.to_path_buf(),
                source: std::io::Error::other(e),
            })
        })
}

/// Move `path` into `<watch_dir>/quarantine/<timestamp>_<name>` and write a
/// `<timestamp>_<stem>_error.txt` report beside it. Returns the new path.
pub fn quarantine_file(watch_dir: &Path, path: &Path, reason: &str) -> std::io::Result<PathBuf> {
    let dir = watch_dir.join(QUARANTINE_DIR);
    std::fs::create_dir_all(&dir)?;

    let now = Utc::now();
    let stamp = now.format("%Y%m%d_%H%M%S");
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    let stem = path
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.clone());

    let target = dir.join(format!("{stamp}_{name}"));
    std::fs::rename(path, &target)?;

    let report = dir.join(format!("{stamp}_{stem}_error.txt"));
    std::fs::write(
        &report,
        format!(
            "Quarantined: {}\nOriginal path: {}\nReason: {reason}\n",
            now.format("%Y-%m-%d %H:%M:%S"),
            path.display()
        ),
    )?;
    Ok(target)
}

pub struct FileWatcher {
    config: WatcherConfig,
    queue: Arc<IngestQueue>,
    metrics: Arc<Metrics>,
    files: HashMap<PathBuf, FileState>,
}

impl FileWatcher {
    pub fn new(config: WatcherConfig, queue: Arc<IngestQueue>, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            queue,
            metrics,
            files: HashMap::new(),
        }
    }

    /// Enqueue every matching file already present, without waiting for debounce.
    pub async fn startup_sweep(&mut self) -> Result<usize, WatchError> {
        let (dir, extension) = (self.config.dir.clone(), self.config.extension.clone());
        let present = blocking_dir(&self.config.dir, move || {
            std::fs::create_dir_all(&dir).map_err(|source| WatchError::Directory {
                path: dir.clone(),
                source,
            })?;
            observe_directory(&dir, &extension)
        })
        .await?;

        let now = Instant::now();
        let mut enqueued = 0;
        for (path, sig) in present {
            self.files.insert(
                path.clone(),
                FileState {
                    observed: sig,
                    changed_at: now,
                    emitted: None,
                },
            );
            if self.emit(path, sig).await {
                enqueued += 1;
            }
        }
        tracing::info!(
            dir = %self.config.dir.display(),
            files = enqueued,
            "startup sweep complete"
        );
        Ok(enqueued)
    }

    /// Observe the directory at `now` and return files whose signature has
    /// been stable for the debounce interval and has not been emitted yet.
    pub async fn poll(&mut self, now: Instant) -> Result<Vec<(PathBuf, Signature)>, WatchError> {
        let (dir, extension) = (self.config.dir.clone(), self.config.extension.clone());
        let present = blocking_dir(&self.config.dir, move || observe_directory(&dir, &extension)).await?;
        Ok(self.settle(present, now))
    }

    fn settle(&mut self, present: Vec<(PathBuf, Signature)>, now: Instant) -> Vec<(PathBuf, Signature)> {
        self.files
            .retain(|path, _| present.iter().any(|(p, _)| p == path));

        let mut ready = Vec::new();
        for (path, sig) in present {
            let state = self.files.entry(path.clone()).or_insert_with(|| FileState {
                observed: sig,
                changed_at: now,
                emitted: None,
            });
            if state.observed != sig {
                state.observed = sig;
                state.changed_at = now;
            }
            let settled = now.saturating_duration_since(state.changed_at) >= self.config.debounce;
            if settled && state.emitted != Some(sig) {
                ready.push((path, sig));
            }
        }
        ready
    }

    /// Push one file onto the queue. Returns whether it was accepted; a file
    /// that is not accepted stays eligible for the next poll.
    async fn emit(&mut self, path: PathBuf, sig: Signature) -> bool {
        match self.queue.push_file(path.clone(), JobOrigin::Watcher).await {
            Ok(handle) => {
                self.metrics.incr(Counter::FilesDetected);
                tracing::info!(
                    path = %path.display(),
                    job_id = handle.id,
                    coalesced = handle.coalesced,
                    "file enqueued"
                );
                if let Some(state) = self.files.get_mut(&path) {
                    state.emitted = Some(sig);
                }
                true
            }
            Err(QueueError::Unreadable { source, .. }) => {
                tracing::debug!(path = %path.display(), error = %source, "file vanished before enqueue");
                false
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not enqueue file");
                false
            }
        }
    }

    /// Sweep, then poll until shutdown is signalled or the queue closes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.startup_sweep().await {
            tracing::error!(error = %e, "startup sweep failed");
            self.metrics
                .record_failure(FailureKind::Watch, self.config.dir.display().to_string(), e.to_string());
        }

        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            dir = %self.config.dir.display(),
            poll_ms = self.config.poll_interval.as_millis() as u64,
            debounce_ms = self.config.debounce.as_millis() as u64,
            "watching directory"
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
            if self.queue.is_closed() {
                break;
            }
            match self.poll(Instant::now()).await {
                Ok(ready) => {
                    for (path, sig) in ready {
                        self.emit(path, sig).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "directory poll failed");
                    self.metrics.record_failure(
                        FailureKind::Watch,
                        self.config.dir.display().to_string(),
                        e.to_string(),
                    );
                }
            }
        }
        tracing::info!(dir = %self.config.dir.display(), "watcher stopped");
    }
}
