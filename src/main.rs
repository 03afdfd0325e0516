//! papergraph CLI: paper-metadata ingestion into an RDF triplestore.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use papergraph::backup::{list_snapshots, prune_snapshots};
use papergraph::config::PipelineConfig;
use papergraph::graph::{GraphAccumulator, GraphMapper};
use papergraph::pipeline::{Pipeline, map_records, normalize_batch, parse_payload};
use papergraph::queue::JobStatus;
use papergraph::store::{TripleSink, wait_until_ready};

#[derive(Parser)]
#[command(name = "papergraph", version, about = "Paper metadata → knowledge graph pipeline")]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline until interrupted (watcher, workers, sync, backups).
    Run {
        /// Ping attempts before giving up on the triplestore.
        #[arg(long, default_value = "30")]
        ready_attempts: u32,

        /// Seconds between readiness pings.
        #[arg(long, default_value = "2")]
        ready_delay: u64,
    },

    /// Convert a JSON file to N-Triples without a triplestore.
    Convert {
        /// JSON file: an array of paper records or a single record.
        input: PathBuf,

        /// Output file. Writes to stdout when omitted.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Ingest files once, sync them, and exit.
    Push {
        /// JSON files to ingest.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Show the triplestore's triple count.
    Stats,

    /// Wait until the triplestore answers a ping.
    Ping {
        #[arg(long, default_value = "1")]
        attempts: u32,

        /// Seconds between pings.
        #[arg(long, default_value = "2")]
        delay: u64,
    },

    /// Remove every triple from the triplestore.
    Clear {
        /// Required confirmation.
        #[arg(long)]
        yes: bool,
    },

    /// Delete all but the newest snapshots in the backup directory.
    PruneBackups {
        #[arg(long, default_value = "5")]
        keep: usize,

        /// Backup directory. Defaults to `backup.dir` from the config.
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML.
    Config,
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            ready_attempts,
            ready_delay,
        } => {
            let sink = config.build_sink()?;
            wait_until_ready(sink.as_ref(), ready_attempts, Duration::from_secs(ready_delay))?;
            runtime()?.block_on(run(config, sink))?;
        }

        Commands::Convert { input, output } => convert(&input, output.as_deref())?,

        Commands::Push { files } => {
            let sink = config.build_sink()?;
            runtime()?.block_on(push(config, sink, files))?;
        }

        Commands::Stats => {
            let sink = config.build_sink()?;
            let count = sink.triple_count()?;
            println!("{}: {count} triples", sink.name());
        }

        Commands::Ping { attempts, delay } => {
            let sink = config.build_sink()?;
            wait_until_ready(sink.as_ref(), attempts, Duration::from_secs(delay))?;
            println!("{} is reachable", sink.name());
        }

        Commands::Clear { yes } => {
            if !yes {
                miette::bail!("refusing to clear the triplestore without --yes");
            }
            let sink = config.build_sink()?;
            sink.clear()?;
            println!("Cleared {}", sink.name());
        }

        Commands::PruneBackups { keep, dir } => {
            if keep == 0 {
                miette::bail!("--keep must be at least 1");
            }
            let dir = dir.unwrap_or_else(|| config.backup.dir.clone());
            let pruned = prune_snapshots(&dir, keep)?;
            for path in &pruned {
                println!("removed {}", path.display());
            }
            let remaining = list_snapshots(&dir)?;
            println!(
                "Pruned {} snapshot(s); {} remain in {}",
                pruned.len(),
                remaining.len(),
                dir.display()
            );
        }

        Commands::Config => {
            let rendered = toml::to_string_pretty(&config).into_diagnostic()?;
            print!("{rendered}");
        }
    }

    Ok(())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()
}

async fn run(config: PipelineConfig, sink: Arc<dyn TripleSink>) -> Result<()> {
    let pipeline = Pipeline::start(config, sink)?;
    tokio::signal::ctrl_c().await.into_diagnostic()?;

    let report = pipeline.shutdown().await;
    if !report.drained {
        eprintln!(
            "warning: {} job(s) left incomplete: {:?}",
            report.incomplete_jobs.len(),
            report.incomplete_jobs
        );
    }
    if report.parked_batches > 0 {
        eprintln!(
            "warning: {} batch(es) were never delivered to the triplestore",
            report.parked_batches
        );
    }
    Ok(())
}

async fn push(config: PipelineConfig, sink: Arc<dyn TripleSink>, files: Vec<PathBuf>) -> Result<()> {
    let pipeline = Pipeline::start(config, sink)?;

    let mut handles = Vec::with_capacity(files.len());
    for file in &files {
        handles.push((file, pipeline.upload_file(file).await?));
    }

    let mut failed = 0;
    for (file, handle) in &mut handles {
        match handle.wait().await {
            JobStatus::Succeeded(outcome) => println!(
                "{}: {} record(s), {} rejected, {} new triple(s)",
                file.display(),
                outcome.records_accepted,
                outcome.records_rejected,
                outcome.triples_added
            ),
            JobStatus::Failed { message } => {
                failed += 1;
                eprintln!("{}: failed: {message}", file.display());
            }
            other => eprintln!("{}: {other:?}", file.display()),
        }
    }

    let summary = pipeline.flush().await;
    let stats = pipeline.get_stats().await;
    let report = pipeline.shutdown().await;
    println!(
        "Synced {} triple(s) in {} batch(es); local graph has {} triples ({} papers)",
        summary.triples_sent + report.sync.triples_sent,
        summary.batches_sent + report.sync.batches_sent,
        stats.triple_count,
        stats.entities.papers
    );

    if report.parked_batches > 0 {
        miette::bail!(
            "{} batch(es) could not be delivered to the triplestore",
            report.parked_batches
        );
    }
    if failed > 0 {
        miette::bail!("{failed} of {} file(s) failed", files.len());
    }
    Ok(())
}

fn convert(input: &Path, output: Option<&Path>) -> Result<()> {
    let origin = input.display().to_string();
    let bytes = std::fs::read(input).into_diagnostic()?;
    let records = parse_payload(&bytes, &origin)?;

    let batch = normalize_batch(&records, None);
    for (index, e) in &batch.rejected {
        eprintln!("skipped record #{index}: {e}");
    }

    let graph = GraphAccumulator::new();
    graph.merge(map_records(&GraphMapper::new(), &batch.accepted));
    let lines = graph.ntriples_lines();

    let mut out: Box<dyn Write> = match output {
        Some(path) => Box::new(std::io::BufWriter::new(
            std::fs::File::create(path).into_diagnostic()?,
        )),
        None => Box::new(std::io::stdout().lock()),
    };
    for line in &lines {
        writeln!(out, "{line}").into_diagnostic()?;
    }
    out.flush().into_diagnostic()?;

    let counts = graph.entity_counts();
    eprintln!(
        "Converted {} of {} record(s): {} triples, {} papers, {} tasks, {} datasets, {} methods, {} results",
        batch.accepted.len(),
        records.len(),
        lines.len(),
        counts.papers,
        counts.tasks,
        counts.datasets,
        counts.methods,
        counts.results
    );
    Ok(())
}
