//! Rich diagnostic error types for the papergraph pipeline.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains so operators know exactly
//! which record, file, batch, or snapshot failed and what to do about it.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the pipeline.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain through to the caller.
#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Watch(#[from] WatchError),
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// A raw record could not be turned into a canonical record.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
#[error("invalid record: field `{field}` {reason}")]
#[diagnostic(
    code(papergraph::normalize::invalid_record),
    help(
        "Every paper record needs a non-empty source URL (`sourceUrl`, `url` or `pdfUrl`) \
         and a non-empty `title`. Fix the record and resubmit it."
    )
)]
pub struct ValidationError {
    /// Canonical name of the offending field.
    pub field: String,
    /// Why the field was rejected.
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Ingestion (job-level) errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    #[error("no valid records in {origin}: {rejected} rejected, first failure: {first}")]
    #[diagnostic(
        code(papergraph::ingest::no_valid_records),
        help("Every record in the payload failed validation. Inspect the failure reports for the offending fields.")
    )]
    NoValidRecords {
        origin: String,
        rejected: usize,
        first: ValidationError,
    },

    #[error("malformed JSON in {origin}: {message}")]
    #[diagnostic(
        code(papergraph::ingest::parse),
        help("Input must be a JSON array of paper objects (a single object is also accepted).")
    )]
    Parse { origin: String, message: String },

    #[error("empty payload: no records in {origin}")]
    #[diagnostic(
        code(papergraph::ingest::empty),
        help("The file or request contained no paper records.")
    )]
    EmptyPayload { origin: String },

    #[error("I/O error reading {}: {source}", .path.display())]
    #[diagnostic(
        code(papergraph::ingest::io),
        help("The input file could not be read. Transient failures are retried automatically.")
    )]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl IngestError {
    /// Whether retrying the job could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io { source, .. } => !matches!(
                source.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::InvalidData
                    | std::io::ErrorKind::IsADirectory
            ),
            Self::NoValidRecords { .. } | Self::Parse { .. } | Self::EmptyPayload { .. } => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Queue errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum QueueError {
    #[error("ingestion queue is full (capacity {capacity})")]
    #[diagnostic(
        code(papergraph::queue::full),
        help(
            "The queue is configured to reject work under backpressure. \
             Retry later, raise `queue.capacity`, or switch `queue.backpressure` to \"block\"."
        )
    )]
    Full { capacity: usize },

    #[error("ingestion queue is shutting down")]
    #[diagnostic(
        code(papergraph::queue::shutting_down),
        help("The pipeline is draining. New work is not accepted during shutdown.")
    )]
    ShuttingDown,

    #[error("cannot read {}: {source}", .path.display())]
    #[diagnostic(
        code(papergraph::queue::unreadable),
        help("The referenced file must exist and be readable when it is enqueued.")
    )]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Sync errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, Diagnostic)]
pub enum SyncError {
    #[error("transient triplestore failure: {message}")]
    #[diagnostic(
        code(papergraph::sync::transient),
        help("The triplestore is unreachable, timed out, or returned a 5xx. The batch will be retried.")
    )]
    Transient {
        status: Option<u16>,
        message: String,
    },

    #[error("triplestore rejected the request: {message}")]
    #[diagnostic(
        code(papergraph::sync::permanent),
        help(
            "The request was malformed or not authorized. Check `sync.username`/`sync.password` \
             and the dataset name. The batch will not be retried."
        )
    )]
    Permanent {
        status: Option<u16>,
        message: String,
    },

    #[error("sync failed after {attempts} attempt(s): {message}")]
    #[diagnostic(
        code(papergraph::sync::exhausted),
        help(
            "The batch is parked locally and re-sent once the triplestore answers a ping again."
        )
    )]
    Exhausted { attempts: u32, message: String },
}

impl SyncError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

// ---------------------------------------------------------------------------
// Snapshot errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum SnapshotError {
    #[error("failed to write snapshot {}: {source}", .path.display())]
    #[diagnostic(
        code(papergraph::backup::write),
        help(
            "Check that the backup directory exists, is writable, and the disk is not full. \
             Existing snapshots were left untouched and retention was skipped."
        )
    )]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to list backup directory {}: {source}", .path.display())]
    #[diagnostic(code(papergraph::backup::list))]
    List {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to prune snapshot {}: {source}", .path.display())]
    #[diagnostic(
        code(papergraph::backup::prune),
        help("An old snapshot could not be deleted. It will be retried on the next backup cycle.")
    )]
    Prune {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("backup task failed: {message}")]
    #[diagnostic(code(papergraph::backup::task))]
    Task { message: String },
}

// ---------------------------------------------------------------------------
// Watcher errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum WatchError {
    #[error("cannot watch {}: {source}", .path.display())]
    #[diagnostic(
        code(papergraph::watch::dir),
        help("The watched directory must exist (or be creatable) and be readable.")
    )]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no watch directory configured")]
    #[diagnostic(
        code(papergraph::watch::unconfigured),
        help("Set `ingest.watch_dir` in the config file or PAPERGRAPH_WATCH_DIR in the environment.")
    )]
    Unconfigured,
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config file: {path}")]
    #[diagnostic(
        code(papergraph::config::read),
        help("Ensure the config file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    #[diagnostic(
        code(papergraph::config::parse),
        help("Check the TOML syntax and field names in the config file.")
    )]
    Parse { path: String, message: String },

    #[error("invalid configuration: {message}")]
    #[diagnostic(code(papergraph::config::invalid), help("{message}"))]
    Invalid { message: String },
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
pub type QueueResult<T> = std::result::Result<T, QueueError>;
pub type SyncResult<T> = std::result::Result<T, SyncError>;
pub type SnapshotResult<T> = std::result::Result<T, SnapshotError>;
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
