//! Job processing: payload → records → canonical records → triples → merge.
//!
//! Each worker pulls jobs from the shared queue and runs them to a terminal
//! state. Invalid records are skipped and reported individually; a job only
//! fails outright when nothing in it is usable. Transient I/O failures go
//! back to the queue with backoff.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use oxigraph::model::Triple;
use serde_json::Value;

use crate::backup::BackupManager;
use crate::error::{IngestError, ValidationError};
use crate::graph::{GraphAccumulator, GraphMapper};
use crate::metrics::{Counter, FailureKind, Metrics, Stage};
use crate::normalize::{CanonicalRecord, normalize_value};
use crate::queue::{IngestQueue, IngestionJob, JobOrigin, JobOutcome, JobPayload};
use crate::sync::SyncClient;
use crate::watcher::quarantine_file;

/// Decode a JSON payload. An array is a batch; a lone object is a batch of one.
pub fn parse_payload(bytes: &[u8], origin: &str) -> Result<Vec<Value>, IngestError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| IngestError::Parse {
        origin: origin.to_string(),
        message: e.to_string(),
    })?;
    let records = match value {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        other => {
            return Err(IngestError::Parse {
                origin: origin.to_string(),
                message: format!("expected an array or object, found {}", json_kind(&other)),
            });
        }
    };
    if records.is_empty() {
        return Err(IngestError::EmptyPayload {
            origin: origin.to_string(),
        });
    }
    Ok(records)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Records that normalized, and the position and reason of those that did not.
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub accepted: Vec<CanonicalRecord>,
    pub rejected: Vec<(usize, ValidationError)>,
}

/// Normalize every record independently.
pub fn normalize_batch(records: &[Value], metrics: Option<&Metrics>) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for (index, record) in records.iter().enumerate() {
        let started = Instant::now();
        let result = normalize_value(record);
        if let Some(m) = metrics {
            m.record_timing(Stage::Normalize, started.elapsed());
        }
        match result {
            Ok(canonical) => batch.accepted.push(canonical),
            Err(e) => batch.rejected.push((index, e)),
        }
    }
    batch
}

/// Map canonical records to triples, in input order.
pub fn map_records(mapper: &GraphMapper, records: &[CanonicalRecord]) -> Vec<Triple> {
    records.iter().flat_map(|r| mapper.map_record(r)).collect()
}

/// Shared state handed to every worker task.
pub(crate) struct WorkerContext {
    pub queue: Arc<IngestQueue>,
    pub graph: Arc<GraphAccumulator>,
    pub mapper: GraphMapper,
    pub sync: Arc<SyncClient>,
    pub backup: Arc<BackupManager>,
    pub metrics: Arc<Metrics>,
    /// Watched directory, when failed watcher files are quarantined.
    pub quarantine_root: Option<PathBuf>,
}

impl WorkerContext {
    pub async fn run(self: Arc<Self>, worker: usize) {
        tracing::debug!(worker, "worker started");
        while let Some(job) = self.queue.pull().await {
            self.handle(job).await;
        }
        tracing::debug!(worker, "worker stopped");
    }

    async fn handle(&self, job: IngestionJob) {
        let started = Instant::now();
        let origin = job.payload.describe();
        tracing::debug!(job_id = job.id, attempt = job.attempt, %origin, "job started");

        match self.process(&job, &origin).await {
            Ok(outcome) => {
                let elapsed = started.elapsed();
                self.metrics.record_timing(Stage::Job, elapsed);
                tracing::info!(
                    job_id = job.id,
                    records = outcome.records_accepted,
                    rejected = outcome.records_rejected,
                    triples = outcome.triples_added,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "job succeeded"
                );
                self.queue.complete(&job, outcome);
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(job_id = job.id, attempt = job.attempt, error = %e, "job hit a transient failure");
                let failed = job.clone();
                if !self.queue.retry_later(job) {
                    self.give_up(&failed, &origin, &e).await;
                }
            }
            Err(e) => self.give_up(&job, &origin, &e).await,
        }
    }

    async fn give_up(&self, job: &IngestionJob, origin: &str, error: &IngestError) {
        tracing::error!(job_id = job.id, attempts = job.attempt, %origin, error = %error, "job failed");
        self.metrics
            .record_failure(FailureKind::Ingest, origin.to_string(), error.to_string());
        self.queue.fail(job, error.to_string());

        if job.origin != JobOrigin::Watcher {
            return;
        }
        if let (Some(root), JobPayload::File(path)) = (&self.quarantine_root, &job.payload) {
            self.quarantine(root, path, error).await;
        }
    }

    async fn quarantine(&self, root: &Path, path: &Path, error: &IngestError) {
        let (root, path_buf, reason) = (root.to_path_buf(), path.to_path_buf(), error.to_string());
        let moved = tokio::task::spawn_blocking(move || {
            if !path_buf.exists() {
                return Ok(None);
            }
            quarantine_file(&root, &path_buf, &reason).map(Some)
        })
        .await
        .unwrap_or_else(|e| Err(std::io::Error::other(e)));
        match moved {
            Ok(None) => {}
            Ok(Some(dest)) => {
                self.metrics.incr(Counter::FilesQuarantined);
                tracing::warn!(path = %path.display(), to = %dest.display(), "file quarantined");
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "could not quarantine file");
            }
        }
    }

    async fn process(&self, job: &IngestionJob, origin: &str) -> Result<JobOutcome, IngestError> {
        let records = match &job.payload {
            JobPayload::Records(records) if records.is_empty() => {
                return Err(IngestError::EmptyPayload {
                    origin: origin.to_string(),
                });
            }
            JobPayload::Records(records) => records.clone(),
            JobPayload::File(path) => {
                let bytes = tokio::fs::read(path).await.map_err(|source| IngestError::Io {
                    path: path.clone(),
                    source,
                })?;
                parse_payload(&bytes, origin)?
            }
        };

        let NormalizedBatch { accepted, rejected } = normalize_batch(&records, Some(&self.metrics));
        for (index, e) in &rejected {
            tracing::warn!(job_id = job.id, record = index, field = %e.field, reason = %e.reason, "record rejected");
            self.metrics.record_failure(
                FailureKind::Validation,
                format!("{origin} record #{index}"),
                e.to_string(),
            );
        }
        self.metrics.add(Counter::RecordsRejected, rejected.len() as u64);

        if accepted.is_empty() {
            let rejected_count = rejected.len();
            let first = rejected
                .into_iter()
                .next()
                .map(|(_, e)| e)
                .unwrap_or_else(|| ValidationError::new("record", "missing"));
            return Err(IngestError::NoValidRecords {
                origin: origin.to_string(),
                rejected: rejected_count,
                first,
            });
        }
        self.metrics.add(Counter::RecordsAccepted, accepted.len() as u64);

        let started = Instant::now();
        let triples = map_records(&self.mapper, &accepted);
        self.metrics.record_timing(Stage::Map, started.elapsed());

        let started = Instant::now();
        let delta = self.graph.merge(triples);
        self.metrics.record_timing(Stage::Merge, started.elapsed());

        let triples_added = delta.len();
        if triples_added > 0 {
            self.metrics.add(Counter::TriplesAdded, triples_added as u64);
            self.sync.enqueue(delta);
            self.backup.mark_dirty();
        }

        Ok(JobOutcome {
            records_accepted: accepted.len(),
            records_rejected: rejected.len(),
            triples_added,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn array_payload_is_a_batch() {
        let records = parse_payload(br#"[{"title":"a"},{"title":"b"}]"#, "t").unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn object_payload_is_a_batch_of_one() {
        let records = parse_payload(br#"{"title":"a"}"#, "t").unwrap();
        assert_eq!(records, vec![json!({"title": "a"})]);
    }

    #[test]
    fn scalars_and_garbage_are_parse_errors() {
        assert!(matches!(
            parse_payload(b"42", "t"),
            Err(IngestError::Parse { .. })
        ));
        assert!(matches!(
            parse_payload(b"[{", "t"),
            Err(IngestError::Parse { .. })
        ));
    }

    #[test]
    fn empty_array_is_empty_payload() {
        let err = parse_payload(b"[]", "t").unwrap_err();
        assert!(matches!(err, IngestError::EmptyPayload { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn invalid_records_are_isolated() {
        let records = vec![
            json!({"url": "https://arxiv.org/pdf/2103.14030v2.pdf", "title": "Swin"}),
            json!({"title": "no url"}),
            json!({"url": "https://example.org/b.pdf", "title": ""}),
        ];
        let batch = normalize_batch(&records, None);
        assert_eq!(batch.accepted.len(), 1);
        let positions: Vec<usize> = batch.rejected.iter().map(|(i, _)| *i).collect();
        assert_eq!(positions, vec![1, 2]);
        assert_eq!(batch.rejected[1].1.field, "title");
    }

    #[test]
    fn mapping_is_independent_of_input_order() {
        let a = json!({"url": "https://example.org/a.pdf", "title": "A", "tasks": ["X", "Y"]});
        let b = json!({"url": "https://example.org/b.pdf", "title": "B", "datasets": ["D"]});
        let mapper = GraphMapper::new();

        let forward = GraphAccumulator::new();
        forward.merge(map_records(&mapper, &normalize_batch(&[a.clone(), b.clone()], None).accepted));
        let backward = GraphAccumulator::new();
        backward.merge(map_records(&mapper, &normalize_batch(&[b, a], None).accepted));

        assert_eq!(forward.ntriples_lines(), backward.ntriples_lines());
    }
}
