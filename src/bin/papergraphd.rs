//! papergraphd: the papergraph ingestion daemon.
//!
//! Runs the pipeline (watcher, workers, sync, backups) and exposes it over
//! HTTP:
//!
//! **Health:**
//! - `GET  /health`: status, triplestore reachability, failure rate
//! - `GET  /health/detailed`: plus metrics snapshot and recent failures
//! - `GET  /metrics`: counters, stage timings, gauges
//!
//! **Ingestion:**
//! - `POST /process/papers`: JSON array (or object) of paper records
//! - `POST /upload`: `{"path": "..."}` of a JSON file readable by the daemon
//! - `POST /scan`: re-enqueue every file in the watched directory
//! - `GET  /jobs/{id}`: job status
//!
//! **Graph:**
//! - `GET    /stats`: local and triplestore counts
//! - `POST   /backup`: write a snapshot now
//! - `DELETE /graph`: clear triplestore and local state
//!
//! Configuration: `PAPERGRAPH_CONFIG` (TOML path), `PAPERGRAPH_BIND`,
//! `PAPERGRAPH_PORT`, plus the pipeline's own environment overrides.
//!
//! Build and run: `cargo run --features server --bin papergraphd`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use miette::{IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::CorsLayer;

use papergraph::backup::SnapshotInfo;
use papergraph::config::PipelineConfig;
use papergraph::error::{PipelineError, QueueError, WatchError};
use papergraph::metrics::{HealthReport, HealthStatus, MetricsSnapshot};
use papergraph::pipeline::{GraphStats, Pipeline, ScanResult};
use papergraph::queue::{JobStatus, JobTicket};
use papergraph::store::wait_until_ready;

type ApiError = (StatusCode, String);

#[derive(Deserialize)]
struct UploadRequest {
    path: PathBuf,
}

#[derive(Serialize)]
struct JobStatusResponse {
    job_id: u64,
    status: JobStatus,
}

fn queue_error(e: QueueError) -> ApiError {
    let status = match e {
        QueueError::Full { .. } => StatusCode::TOO_MANY_REQUESTS,
        QueueError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        QueueError::Unreadable { .. } => StatusCode::BAD_REQUEST,
    };
    (status, e.to_string())
}

fn health_code(report: &HealthReport) -> StatusCode {
    match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn health(State(pipeline): State<Arc<Pipeline>>) -> (StatusCode, Json<HealthReport>) {
    let report = pipeline.get_health(false).await;
    (health_code(&report), Json(report))
}

async fn health_detailed(State(pipeline): State<Arc<Pipeline>>) -> (StatusCode, Json<HealthReport>) {
    let report = pipeline.get_health(true).await;
    (health_code(&report), Json(report))
}

async fn metrics(State(pipeline): State<Arc<Pipeline>>) -> Json<MetricsSnapshot> {
    Json(pipeline.metrics().snapshot())
}

async fn process_papers(
    State(pipeline): State<Arc<Pipeline>>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<JobTicket>), ApiError> {
    let records = match body {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                "expected a JSON array of paper records or a single record".into(),
            ));
        }
    };
    if records.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "no records in request".into()));
    }
    let handle = pipeline.submit_records(records).await.map_err(queue_error)?;
    Ok((StatusCode::ACCEPTED, Json(handle.ticket())))
}

async fn upload(
    State(pipeline): State<Arc<Pipeline>>,
    Json(req): Json<UploadRequest>,
) -> Result<(StatusCode, Json<JobTicket>), ApiError> {
    let handle = pipeline.upload_file(req.path).await.map_err(queue_error)?;
    Ok((StatusCode::ACCEPTED, Json(handle.ticket())))
}

async fn scan(State(pipeline): State<Arc<Pipeline>>) -> Result<Json<ScanResult>, ApiError> {
    pipeline.trigger_scan().await.map(Json).map_err(|e| {
        let status = match &e {
            PipelineError::Watch(WatchError::Unconfigured) => StatusCode::BAD_REQUEST,
            PipelineError::Queue(QueueError::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, e.to_string())
    })
}

async fn job_status(
    State(pipeline): State<Arc<Pipeline>>,
    Path(id): Path<u64>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    pipeline
        .job_status(id)
        .map(|status| Json(JobStatusResponse { job_id: id, status }))
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown job {id}")))
}

async fn stats(State(pipeline): State<Arc<Pipeline>>) -> Json<GraphStats> {
    Json(pipeline.get_stats().await)
}

async fn backup(State(pipeline): State<Arc<Pipeline>>) -> Result<Json<SnapshotInfo>, ApiError> {
    pipeline
        .create_backup()
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn clear_graph(State(pipeline): State<Arc<Pipeline>>) -> Result<Json<Value>, ApiError> {
    pipeline
        .clear_graph()
        .await
        .map(|()| Json(serde_json::json!({ "cleared": true })))
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))
}

// ── Main ──────────────────────────────────────────────────────────────────

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    tracing::info!("papergraphd shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::var("PAPERGRAPH_CONFIG").ok().map(PathBuf::from);
    let config = PipelineConfig::load(config_path.as_deref())?;

    let bind = std::env::var("PAPERGRAPH_BIND").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("PAPERGRAPH_PORT").unwrap_or_else(|_| "8000".to_string());
    let addr = format!("{bind}:{port}");

    let sink = config.build_sink()?;
    {
        let sink = Arc::clone(&sink);
        tokio::task::spawn_blocking(move || {
            wait_until_ready(sink.as_ref(), 30, Duration::from_secs(2))
        })
        .await
        .into_diagnostic()??;
    }

    let pipeline = Arc::new(Pipeline::start(config, sink)?);

    let app = Router::new()
        // Health.
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/metrics", get(metrics))
        // Ingestion.
        .route("/process/papers", post(process_papers))
        .route("/upload", post(upload))
        .route("/scan", post(scan))
        .route("/jobs/{id}", get(job_status))
        // Graph.
        .route("/stats", get(stats))
        .route("/backup", post(backup))
        .route("/graph", delete(clear_graph))
        .layer(CorsLayer::permissive())
        .with_state(Arc::clone(&pipeline));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .into_diagnostic()?;
    tracing::info!("papergraphd listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .into_diagnostic()?;

    match Arc::try_unwrap(pipeline) {
        Ok(pipeline) => {
            let report = pipeline.shutdown().await;
            if !report.drained {
                tracing::warn!(jobs = ?report.incomplete_jobs, "jobs left incomplete");
            }
        }
        Err(_) => tracing::warn!("pipeline still referenced; skipping drain"),
    }
    Ok(())
}
