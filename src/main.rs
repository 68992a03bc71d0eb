//! # Report Ingest CLI (`ingest`)
//!
//! The `ingest` binary drives the report ingestion pipeline: it initializes
//! the data directories, shows what a run would do, runs batches, and
//! inspects the registry.
//!
//! ## Usage
//!
//! ```bash
//! ingest --config ./config/ingest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ingest init` | Create data directories, an empty registry, and the vector schema |
//! | `ingest plan` | List the documents a run would process, with reasons |
//! | `ingest run` | Process every document that is not up to date |
//! | `ingest run --file <path>` | Reprocess exactly the given files |
//! | `ingest status [id]` | Registry summary, or one document's full record |
//! | `ingest segment <file.md>` | Preview how a parsed report is chunked |
//!
//! Without a config file, `init`, `plan`, `status` and `segment` use the
//! built-in defaults (`data/metadata.json`, `data/raw_pdfs`, ...).

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use report_ingest::config::{self, Config};
use report_ingest::embedding::create_embedder;
use report_ingest::memory_store::MemoryVectorStore;
use report_ingest::metadata::ReportMetadataExtractor;
use report_ingest::models::{FieldMap, PipelineResult};
use report_ingest::parser::HttpDocumentParser;
use report_ingest::plan::PlanComputer;
use report_ingest::progress::ProgressMode;
use report_ingest::registry::Registry;
use report_ingest::runner::PipelineRunner;
use report_ingest::segment::ContentSegmenter;
use report_ingest::sqlite_store::SqliteVectorStore;
use report_ingest::status;
use report_ingest::vector_store::{Indexer, VectorStore};

/// Report Ingest CLI: idempotent, rollback-safe ingestion of analyst
/// report PDFs.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ingest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ingest",
    about = "Report Ingest: idempotent, rollback-safe ingestion of analyst report PDFs",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ingest.toml")]
    config: PathBuf,

    /// Log level for the library (`error`, `warn`, `info`, `debug`, `trace`).
    ///
    /// Overrides `RUST_LOG`. Logs are written to stderr.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Progress output on stderr: `human`, `json`, or `off`.
    ///
    /// Defaults to `human` when stderr is a terminal, otherwise `off`.
    #[arg(long, global = true)]
    progress: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create data directories, an empty registry, and the vector schema.
    ///
    /// Idempotent: an existing registry is validated and left untouched.
    Init,

    /// Show which documents a run would process, and why.
    ///
    /// Reads the registry and hashes candidate files; writes nothing.
    Plan,

    /// Run a batch.
    ///
    /// Without `--file`, scans the raw directory and processes every document
    /// that is new, changed, or did not reach `indexed`. With `--file`,
    /// processes exactly those files regardless of their state.
    Run {
        /// Source file to process (repeatable).
        #[arg(long = "file")]
        files: Vec<PathBuf>,

        /// Print the batch result as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Show the registry: counts per status, or one document in full.
    Status {
        /// Document id (the source file name without extension).
        document_id: Option<String>,
    },

    /// Preview segmentation of a parsed markdown file.
    Segment {
        /// Markdown file, as written to the parse cache.
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let progress = match cli.progress.as_deref() {
        Some(value) => ProgressMode::parse(value).with_context(|| {
            format!("invalid --progress '{}': expected human, json, or off", value)
        })?,
        None => ProgressMode::default_for_tty(),
    };

    let cfg = load_or_minimal(&cli.config)?;

    match cli.command {
        Commands::Init => run_init(&cfg).await?,
        Commands::Plan => run_plan(&cfg)?,
        Commands::Run { files, json } => {
            let result = run_batch(&cfg, files, json, progress).await?;
            if !result.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Status { document_id } => run_status(&cfg, document_id.as_deref())?,
        Commands::Segment { path } => run_segment(&cfg, &path)?,
    }

    Ok(ExitCode::SUCCESS)
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(format!("report_ingest={}", level)),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("report_ingest=info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Load the config file when it exists; otherwise fall back to defaults.
/// A file that exists but does not parse or validate is an error.
fn load_or_minimal(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        Ok(Config::minimal())
    }
}

async fn open_vector_store(cfg: &Config) -> anyhow::Result<Arc<dyn VectorStore>> {
    let store: Arc<dyn VectorStore> = match cfg.vector_store.backend.as_str() {
        "memory" => Arc::new(MemoryVectorStore::new()),
        _ => Arc::new(
            SqliteVectorStore::open(&cfg.vector_store.path, &cfg.vector_store.collection)
                .await
                .with_context(|| {
                    format!(
                        "Failed to open vector store: {}",
                        cfg.vector_store.path.display()
                    )
                })?,
        ),
    };
    Ok(store)
}

async fn run_init(cfg: &Config) -> anyhow::Result<()> {
    for dir in [&cfg.paths.raw_dir, &cfg.paths.parsed_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    let registry = Registry::new(&cfg.paths.registry);
    if registry.init()? {
        println!("Created registry at {}", registry.path().display());
    } else {
        println!("Registry already exists at {}", registry.path().display());
    }

    let store = open_vector_store(cfg).await?;
    store.init().await?;
    println!("Vector store ready ({}).", cfg.vector_store.backend);
    Ok(())
}

fn run_plan(cfg: &Config) -> anyhow::Result<()> {
    let registry = Registry::new(&cfg.paths.registry);
    let data = registry.load()?;
    let batch = PlanComputer::new(&data)
        .plan_directory(&cfg.paths.raw_dir, &cfg.paths.include_globs)?;

    for (path, error) in &batch.rejected {
        println!("  ✗ {}: {}", path.display(), error);
    }
    let plans = batch.plans;
    if plans.is_empty() {
        println!("Nothing to do: all documents are up to date.");
        return Ok(());
    }

    println!("{:<40} {:<18} {}", "DOCUMENT", "REASON", "FILE");
    for plan in &plans {
        println!(
            "{:<40} {:<18} {}",
            plan.document_id,
            plan.reason.to_string(),
            plan.source_path.display()
        );
    }
    println!();
    println!("{} document(s) to process.", plans.len());
    Ok(())
}

async fn run_batch(
    cfg: &Config,
    files: Vec<PathBuf>,
    json: bool,
    progress: ProgressMode,
) -> anyhow::Result<PipelineResult> {
    let parser = Arc::new(HttpDocumentParser::new(&cfg.parser)?);
    let embedder = create_embedder(&cfg.embedding)?;
    let store = open_vector_store(cfg).await?;
    let indexer = Indexer::new(store, embedder, cfg.embedding.batch_size);

    let runner = PipelineRunner::new(cfg, parser, Arc::new(ReportMetadataExtractor::new()), indexer)
        .with_progress(progress.reporter());

    let cancel = runner.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted: finishing the current document, then stopping.");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let paths = if files.is_empty() {
        None
    } else {
        Some(files.as_slice())
    };
    let result = runner.run(paths).await.context("Batch aborted")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(result)
}

fn print_result(result: &PipelineResult) {
    println!("Processed {} document(s)", result.total);
    println!("  indexed: {}", result.success_count);
    println!("  failed:  {}", result.failed_count);
    if result.skipped_count > 0 {
        println!("  skipped: {} (cancelled)", result.skipped_count);
    }
    for failed in &result.failed_files {
        println!("  ✗ {}: {}", failed.file, failed.error);
    }
}

fn run_status(cfg: &Config, document_id: Option<&str>) -> anyhow::Result<()> {
    let registry = Registry::new(&cfg.paths.registry);
    let data = registry.load()?;

    match document_id {
        Some(id) => match data.documents.get(id) {
            Some(doc) => print!("{}", status::render_document(doc)),
            None => bail!("Unknown document: {}", id),
        },
        None => print!("{}", status::render_summary(&data, registry.path())),
    }
    Ok(())
}

fn run_segment(cfg: &Config, path: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut metadata = FieldMap::new();
    metadata.insert("source_file".into(), Value::from(file_name));

    let chunks = ContentSegmenter::from_config(&cfg.chunking).segment(&text, &metadata);
    for chunk in &chunks {
        println!(
            "--- chunk {} [{}] {} chars",
            chunk.chunk_index,
            chunk.chunk_type.as_str(),
            chunk.text.chars().count()
        );
        println!("{}", chunk.text);
    }
    println!("--- {} chunk(s)", chunks.len());
    Ok(())
}
