//! Triplestore backends.
//!
//! The sync client talks to a [`TripleSink`]: an idempotent batch insert, a
//! triple count, a reachability probe, and a full clear. Two backends:
//!
//! - [`http::HttpTripleStore`]: SPARQL 1.1 update/query over HTTP (Fuseki layout)
//! - [`embedded::EmbeddedTripleStore`]: an in-process oxigraph store
//!
//! All methods block; async callers go through `spawn_blocking`.

pub mod embedded;
pub mod http;

use std::time::Duration;

use oxigraph::model::Triple;

use crate::error::SyncResult;
use crate::graph::ntriples_line;

pub use embedded::EmbeddedTripleStore;
pub use http::{HttpStoreConfig, HttpTripleStore};

/// A group of triples sent to the triplestore in one request.
#[derive(Debug, Clone)]
pub struct SyncBatch {
    pub id: u64,
    pub triples: Vec<Triple>,
    /// Size of the N-Triples payload, newlines included.
    pub payload_bytes: usize,
}

impl SyncBatch {
    pub fn new(id: u64, triples: Vec<Triple>) -> Self {
        let payload_bytes = triples.iter().map(|t| ntriples_line(t).len() + 1).sum();
        Self {
            id,
            triples,
            payload_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.triples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    /// The batch as an N-Triples document.
    pub fn to_ntriples(&self) -> String {
        let mut out = String::with_capacity(self.payload_bytes);
        for triple in &self.triples {
            out.push_str(&ntriples_line(triple));
            out.push('\n');
        }
        out
    }
}

/// Destination of synchronized triples.
///
/// Inserting a triple that already exists must be a no-op, so a batch that
/// is delivered twice leaves the store unchanged.
pub trait TripleSink: Send + Sync {
    /// Short backend name for logs and stats.
    fn name(&self) -> &str;

    fn insert(&self, batch: &SyncBatch) -> SyncResult<()>;

    fn triple_count(&self) -> SyncResult<u64>;

    /// Succeeds when the store is reachable.
    fn ping(&self) -> SyncResult<()>;

    /// Remove every triple from the store.
    fn clear(&self) -> SyncResult<()>;
}

/// Ping `sink` until it answers, up to `max_attempts` times.
pub fn wait_until_ready(
    sink: &dyn TripleSink,
    max_attempts: u32,
    delay: Duration,
) -> SyncResult<()> {
    let mut attempt = 1;
    loop {
        match sink.ping() {
            Ok(()) => {
                tracing::info!(store = sink.name(), attempt, "triplestore is ready");
                return Ok(());
            }
            Err(e) if attempt >= max_attempts => {
                tracing::error!(store = sink.name(), attempt, error = %e, "triplestore not ready");
                return Err(crate::error::SyncError::Exhausted {
                    attempts: attempt,
                    message: e.to_string(),
                });
            }
            Err(e) => {
                tracing::info!(
                    store = sink.name(),
                    attempt,
                    max_attempts,
                    error = %e,
                    "waiting for triplestore"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use oxigraph::model::{Literal, NamedNode};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakySink {
        pings: AtomicU32,
        ready_after: u32,
    }

    impl TripleSink for FlakySink {
        fn name(&self) -> &str {
            "flaky"
        }
        fn insert(&self, _batch: &SyncBatch) -> SyncResult<()> {
            Ok(())
        }
        fn triple_count(&self) -> SyncResult<u64> {
            Ok(0)
        }
        fn ping(&self) -> SyncResult<()> {
            let n = self.pings.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.ready_after {
                Ok(())
            } else {
                Err(SyncError::Transient {
                    status: None,
                    message: "connection refused".into(),
                })
            }
        }
        fn clear(&self) -> SyncResult<()> {
            Ok(())
        }
    }

    #[test]
    fn wait_until_ready_retries_then_succeeds() {
        let sink = FlakySink {
            pings: AtomicU32::new(0),
            ready_after: 3,
        };
        wait_until_ready(&sink, 5, Duration::ZERO).unwrap();
        assert_eq!(sink.pings.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn wait_until_ready_gives_up() {
        let sink = FlakySink {
            pings: AtomicU32::new(0),
            ready_after: 10,
        };
        let err = wait_until_ready(&sink, 2, Duration::ZERO).unwrap_err();
        assert!(matches!(err, SyncError::Exhausted { attempts: 2, .. }));
    }

    #[test]
    fn batch_payload_counts_newlines() {
        let t = Triple::new(
            NamedNode::new_unchecked("http://x.org/s"),
            NamedNode::new_unchecked("http://x.org/p"),
            Literal::new_simple_literal("o"),
        );
        let batch = SyncBatch::new(1, vec![t]);
        let doc = batch.to_ntriples();
        assert_eq!(doc, "<http://x.org/s> <http://x.org/p> \"o\" .\n");
        assert_eq!(batch.payload_bytes, doc.len());
    }
}
