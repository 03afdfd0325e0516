//! Pipeline configuration, persisted as TOML.
//!
//! Every field has a serde default, so an empty file (or no file) yields a
//! working local setup. Environment variables override the file for the
//! settings usually injected by a container runtime.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backup::BackupConfig;
use crate::error::{ConfigError, ConfigResult, SyncResult};
use crate::queue::{BackpressureMode, QueueConfig};
use crate::retry::RetryPolicy;
use crate::store::{EmbeddedTripleStore, HttpStoreConfig, HttpTripleStore, TripleSink};
use crate::sync::SyncConfig;
use crate::watcher::WatcherConfig;

pub const ENV_TRIPLESTORE_URL: &str = "PAPERGRAPH_TRIPLESTORE_URL";
pub const ENV_DATASET: &str = "PAPERGRAPH_DATASET";
pub const ENV_TRIPLESTORE_USER: &str = "PAPERGRAPH_TRIPLESTORE_USER";
pub const ENV_TRIPLESTORE_PASSWORD: &str = "PAPERGRAPH_TRIPLESTORE_PASSWORD";
pub const ENV_WATCH_DIR: &str = "PAPERGRAPH_WATCH_DIR";
pub const ENV_BACKUP_DIR: &str = "PAPERGRAPH_BACKUP_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub ingest: IngestSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub backup: BackupSection,
    #[serde(default)]
    pub shutdown: ShutdownSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSection {
    /// Directory to watch. No watcher runs when unset.
    #[serde(default)]
    pub watch_dir: Option<PathBuf>,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Move files that fail permanently into `<watch_dir>/quarantine/`.
    #[serde(default = "default_true")]
    pub quarantine: bool,
    /// Worker tasks draining the queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_backpressure")]
    pub backpressure: BackpressureMode,
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_job_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkBackend {
    Http,
    Embedded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    #[serde(default = "default_backend")]
    pub backend: SinkBackend,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_dataset")]
    pub dataset: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// On-disk location for the embedded backend; in memory when unset.
    #[serde(default)]
    pub embedded_path: Option<PathBuf>,
    #[serde(default = "default_batch_max_triples")]
    pub batch_max_triples: usize,
    #[serde(default = "default_batch_max_bytes")]
    pub batch_max_bytes: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_sync_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSection {
    #[serde(default = "default_backup_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_keep")]
    pub keep: usize,
    /// Scheduled snapshot period; 0 disables scheduled snapshots.
    #[serde(default = "default_backup_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownSection {
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_extension() -> String {
    "json".into()
}
fn default_debounce_ms() -> u64 {
    2_000
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_true() -> bool {
    true
}
fn default_workers() -> usize {
    4
}
fn default_capacity() -> usize {
    256
}
fn default_backpressure() -> BackpressureMode {
    BackpressureMode::Block
}
fn default_dedup_window_secs() -> u64 {
    60
}
fn default_job_attempts() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    500
}
fn default_retry_max_ms() -> u64 {
    30_000
}
fn default_backend() -> SinkBackend {
    SinkBackend::Http
}
fn default_endpoint() -> String {
    "http://localhost:3030".into()
}
fn default_dataset() -> String {
    "matic_papers_kg".into()
}
fn default_batch_max_triples() -> usize {
    1_000
}
fn default_batch_max_bytes() -> usize {
    512 * 1024
}
fn default_flush_interval_ms() -> u64 {
    2_000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_sync_attempts() -> u32 {
    5
}
fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}
fn default_keep() -> usize {
    5
}
fn default_backup_interval_secs() -> u64 {
    3_600
}
fn default_drain_timeout_secs() -> u64 {
    30
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            watch_dir: None,
            extension: default_extension(),
            debounce_ms: default_debounce_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            quarantine: true,
            workers: default_workers(),
        }
    }
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            backpressure: default_backpressure(),
            dedup_window_secs: default_dedup_window_secs(),
            max_attempts: default_job_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            endpoint: default_endpoint(),
            dataset: default_dataset(),
            username: None,
            password: None,
            embedded_path: None,
            batch_max_triples: default_batch_max_triples(),
            batch_max_bytes: default_batch_max_bytes(),
            flush_interval_ms: default_flush_interval_ms(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_sync_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            dir: default_backup_dir(),
            keep: default_keep(),
            interval_secs: default_backup_interval_secs(),
        }
    }
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl PipelineConfig {
    /// Parse a TOML document.
    pub fn from_toml(content: &str, origin: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })
    }

    /// Load from a TOML file.
    pub fn load_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml(&content, &path.display().to_string())
    }

    /// Load the file if given (defaults otherwise), apply environment
    /// overrides, and validate.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(p) => Self::load_file(p)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup. Empty values are ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get(ENV_TRIPLESTORE_URL) {
            self.sync.endpoint = v;
        }
        if let Some(v) = get(ENV_DATASET) {
            self.sync.dataset = v;
        }
        if let Some(v) = get(ENV_TRIPLESTORE_USER) {
            self.sync.username = Some(v);
        }
        if let Some(v) = get(ENV_TRIPLESTORE_PASSWORD) {
            self.sync.password = Some(v);
        }
        if let Some(v) = get(ENV_WATCH_DIR) {
            self.ingest.watch_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get(ENV_BACKUP_DIR) {
            self.backup.dir = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |message: &str| {
            Err(ConfigError::Invalid {
                message: message.to_string(),
            })
        };
        if self.queue.capacity == 0 {
            return invalid("queue.capacity must be at least 1");
        }
        if self.ingest.workers == 0 {
            return invalid("ingest.workers must be at least 1");
        }
        if self.ingest.extension.trim_start_matches('.').is_empty() {
            return invalid("ingest.extension must not be empty");
        }
        if self.ingest.poll_interval_ms == 0 {
            return invalid("ingest.poll_interval_ms must be at least 1");
        }
        if self.sync.batch_max_triples == 0 || self.sync.batch_max_bytes == 0 {
            return invalid("sync.batch_max_triples and sync.batch_max_bytes must be at least 1");
        }
        if self.sync.flush_interval_ms == 0 {
            return invalid("sync.flush_interval_ms must be at least 1");
        }
        if self.queue.max_attempts == 0 || self.sync.max_attempts == 0 {
            return invalid("max_attempts counts the first try and must be at least 1");
        }
        if self.backup.keep == 0 {
            return invalid("backup.keep must be at least 1");
        }
        if self.sync.backend == SinkBackend::Http && self.sync.endpoint.trim().is_empty() {
            return invalid("sync.endpoint is required for the http backend");
        }
        Ok(())
    }

    pub fn workers(&self) -> usize {
        self.ingest.workers
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            capacity: self.queue.capacity,
            backpressure: self.queue.backpressure,
            dedup_window: Duration::from_secs(self.queue.dedup_window_secs),
            retry: RetryPolicy::new(
                self.queue.max_attempts,
                Duration::from_millis(self.queue.retry_base_ms),
                Duration::from_millis(self.queue.retry_max_ms),
            ),
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            batch_max_triples: self.sync.batch_max_triples,
            batch_max_bytes: self.sync.batch_max_bytes,
            flush_interval: Duration::from_millis(self.sync.flush_interval_ms),
            retry: RetryPolicy::new(
                self.sync.max_attempts,
                Duration::from_millis(self.sync.retry_base_ms),
                Duration::from_millis(self.sync.retry_max_ms),
            ),
        }
    }

    /// Watcher settings, if a watch directory is configured.
    pub fn watcher_config(&self) -> Option<WatcherConfig> {
        self.ingest.watch_dir.as_ref().map(|dir| WatcherConfig {
            dir: dir.clone(),
            extension: self.ingest.extension.trim_start_matches('.').to_string(),
            debounce: Duration::from_millis(self.ingest.debounce_ms),
            poll_interval: Duration::from_millis(self.ingest.poll_interval_ms),
        })
    }

    pub fn backup_config(&self) -> BackupConfig {
        BackupConfig {
            dir: self.backup.dir.clone(),
            keep: self.backup.keep,
            interval: Duration::from_secs(self.backup.interval_secs),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown.drain_timeout_secs)
    }

    pub fn http_store_config(&self) -> HttpStoreConfig {
        HttpStoreConfig {
            endpoint: self.sync.endpoint.clone(),
            dataset: self.sync.dataset.clone(),
            username: self.sync.username.clone(),
            password: self.sync.password.clone(),
            timeout: Duration::from_secs(self.sync.timeout_secs),
        }
    }

    /// Construct the configured triplestore backend.
    pub fn build_sink(&self) -> SyncResult<Arc<dyn TripleSink>> {
        let sink: Arc<dyn TripleSink> = match self.sync.backend {
            SinkBackend::Http => Arc::new(HttpTripleStore::new(self.http_store_config())),
            SinkBackend::Embedded => {
                let store = match &self.sync.embedded_path {
                    Some(path) => EmbeddedTripleStore::open(path)?,
                    None => EmbeddedTripleStore::in_memory()?,
                };
                Arc::new(store)
            }
        };
        Ok(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_document_gives_defaults() {
        let config = PipelineConfig::from_toml("", "inline").unwrap();
        assert_eq!(config.queue.capacity, 256);
        assert_eq!(config.sync.dataset, "matic_papers_kg");
        assert_eq!(config.backup.keep, 5);
        assert!(config.ingest.quarantine);
        assert!(config.watcher_config().is_none());
        config.validate().unwrap();
    }

    #[test]
    fn sections_override_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
            [ingest]
            watch_dir = "/data/incoming"
            debounce_ms = 250

            [queue]
            capacity = 8
            backpressure = "reject"

            [sync]
            backend = "embedded"
            batch_max_triples = 50
            "#,
            "inline",
        )
        .unwrap();
        assert_eq!(config.queue.backpressure, BackpressureMode::Reject);
        assert_eq!(config.sync.backend, SinkBackend::Embedded);
        let watcher = config.watcher_config().unwrap();
        assert_eq!(watcher.dir, PathBuf::from("/data/incoming"));
        assert_eq!(watcher.debounce, Duration::from_millis(250));
        assert_eq!(config.sync_config().batch_max_triples, 50);
        // Untouched fields keep their defaults.
        assert_eq!(config.sync.dataset, "matic_papers_kg");
    }

    #[test]
    fn unknown_backpressure_is_a_parse_error() {
        let err = PipelineConfig::from_toml("[queue]\nbackpressure = \"drop\"\n", "inline")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            (ENV_TRIPLESTORE_URL, "http://fuseki:3030"),
            (ENV_DATASET, "papers"),
            (ENV_TRIPLESTORE_USER, "admin"),
            (ENV_TRIPLESTORE_PASSWORD, "pw"),
            (ENV_WATCH_DIR, "/app/data"),
            (ENV_BACKUP_DIR, ""),
        ]
        .into_iter()
        .collect();
        let mut config = PipelineConfig::default();
        config.apply_env_from(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.sync.endpoint, "http://fuseki:3030");
        assert_eq!(config.sync.dataset, "papers");
        assert_eq!(config.sync.username.as_deref(), Some("admin"));
        assert_eq!(config.ingest.watch_dir, Some(PathBuf::from("/app/data")));
        // Empty values do not clobber.
        assert_eq!(config.backup.dir, PathBuf::from("backups"));
    }

    #[test]
    fn zero_bounds_are_rejected() {
        let mut config = PipelineConfig::default();
        config.queue.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.backup.keep = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.sync.batch_max_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_file_reports_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = PipelineConfig::load_file(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
