// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # papergraph
//!
//! Ingests machine-learning paper metadata (JSON records from an API call or
//! a watched directory), maps it onto a small paper/task/dataset/method/result
//! ontology and keeps an RDF triplestore in sync with the resulting graph.
//!
//! ## Architecture
//!
//! - **Normalizer** (`normalize`): alias resolution, year extraction, validation
//! - **Graph builder** (`graph`): content-addressed IRIs, record → triples, set-union accumulator
//! - **Ingestion queue** (`queue`): bounded, deduplicating, retrying job queue
//! - **File watcher** (`watcher`): startup sweep, debounced polling, quarantine
//! - **Sync client** (`sync`, `store`): batched, retried SPARQL updates with parking
//! - **Backups** (`backup`): atomic N-Triples snapshots with retention
//! - **Metrics** (`metrics`): counters, stage timings, failure reports, health
//!
//! ## Library usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use papergraph::config::PipelineConfig;
//! use papergraph::pipeline::Pipeline;
//! use papergraph::store::EmbeddedTripleStore;
//!
//! # async fn demo() -> miette::Result<()> {
//! let sink = Arc::new(EmbeddedTripleStore::in_memory()?);
//! let pipeline = Pipeline::start(PipelineConfig::default(), sink)?;
//! let mut job = pipeline
//!     .submit_records(vec![serde_json::json!({
//!         "url": "https://arxiv.org/pdf/2103.14030v2.pdf",
//!         "title": "Swin Transformer",
//!     })])
//!     .await?;
//! job.wait().await;
//! println!("{:?}", pipeline.get_stats().await);
//! pipeline.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod config;
pub mod error;
pub mod graph;
pub mod metrics;
pub mod normalize;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod store;
pub mod sync;
pub mod watcher;
