use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;

use demeter_client::{ChromiumRenderer, ReqwestFetcher};
use demeter_core::drivers::DriverRegistry;
use demeter_core::engine::{EngineConfig, HarvestEngine, RunSummary, SiteMapOutcome};
use demeter_core::error::AppError;
use demeter_core::records::{ExtractedRecord, RelationshipRecord};
use demeter_core::store::MemoryStore;
use demeter_core::traits::{NullRenderer, NullSink, PersistenceSink};

#[derive(Parser)]
#[command(name = "demeter", version, about = "Competency-registry harvester")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Map a portal's structure breadth-first from one root URL
    Map {
        /// Root URL to crawl from
        #[arg(short, long, env = "DEMETER_ROOT_URL")]
        root: String,

        /// Maximum link depth to follow
        #[arg(long, default_value_t = 3)]
        max_depth: u32,

        /// Maximum concurrent fetches
        #[arg(long, default_value_t = 8)]
        concurrency: usize,

        /// Render pages in a headless browser to capture the network
        /// trace (surfaces undocumented API endpoints)
        #[arg(long, default_value_t = false)]
        render: bool,

        /// Write the site map JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Harvest structured records from every registered driver
    Harvest {
        /// Portal base URL the drivers root their entry points at
        #[arg(short, long, env = "DEMETER_BASE_URL")]
        base: String,

        /// Maximum concurrent fetches
        #[arg(long, default_value_t = 8)]
        concurrency: usize,

        /// Append harvested records/relationships to this JSONL file;
        /// without it the run is a dry run (summary only)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Setup tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("demeter=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Map {
            root,
            max_depth,
            concurrency,
            render,
            output,
        } => cmd_map(&root, max_depth, concurrency, render, output.as_deref()).await?,
        Commands::Harvest {
            base,
            concurrency,
            output,
        } => cmd_harvest(&base, concurrency, output.as_deref()).await?,
    }

    Ok(())
}

/// Cancellation on Ctrl-C: admission stops, in-flight fetches drain.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, draining in-flight fetches");
            signal_token.cancel();
        }
    });
    token
}

async fn cmd_map(
    root: &str,
    max_depth: u32,
    concurrency: usize,
    render: bool,
    output: Option<&Path>,
) -> Result<()> {
    let root_url = Url::parse(root).with_context(|| format!("Invalid root URL: {root}"))?;
    let fetcher = ReqwestFetcher::new().map_err(|e| anyhow::anyhow!(e))?;
    let registry = DriverRegistry::standard_set(&root_url);
    let config = EngineConfig {
        concurrency,
        max_depth,
        ..Default::default()
    };
    let cancel = cancel_on_ctrl_c();

    let outcome: SiteMapOutcome = if render {
        let renderer = ChromiumRenderer::new().await.map_err(|e| anyhow::anyhow!(e))?;
        HarvestEngine::new(fetcher, NullSink, registry, MemoryStore::new(), config)
            .with_renderer(renderer)
            .run_site_map(root_url, cancel)
            .await
    } else {
        HarvestEngine::<_, NullRenderer, _, _>::new(
            fetcher,
            NullSink,
            registry,
            MemoryStore::new(),
            config,
        )
        .run_site_map(root_url, cancel)
        .await
    };

    tracing::info!(
        pages = outcome.entries.len(),
        api_endpoints = outcome.api_endpoints.len(),
        "Site map complete"
    );

    let json = serde_json::to_string_pretty(&outcome)?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!("Site map written to {}", path.display());
        }
        None => println!("{json}"),
    }

    Ok(())
}

async fn cmd_harvest(base: &str, concurrency: usize, output: Option<&Path>) -> Result<()> {
    let base_url = Url::parse(base).with_context(|| format!("Invalid base URL: {base}"))?;
    let fetcher = ReqwestFetcher::new().map_err(|e| anyhow::anyhow!(e))?;
    let registry = DriverRegistry::standard_set(&base_url);
    let config = EngineConfig {
        concurrency,
        ..Default::default()
    };
    let cancel = cancel_on_ctrl_c();

    let summary: RunSummary = match output {
        Some(path) => {
            let sink = JsonlSink::create(path)?;
            HarvestEngine::<_, NullRenderer, _, _>::new(
                fetcher,
                sink,
                registry,
                MemoryStore::new(),
                config,
            )
            .run_targeted(cancel)
            .await
        }
        None => {
            tracing::info!("No output file given, dry run (records are discarded)");
            HarvestEngine::<_, NullRenderer, _, _>::new(
                fetcher,
                NullSink,
                registry,
                MemoryStore::new(),
                config,
            )
            .run_targeted(cancel)
            .await
        }
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Persistence sink appending one JSON object per line. Idempotence is
/// the downstream loader's concern; re-deliveries of a natural key are
/// duplicate lines with identical content hashes.
#[derive(Clone)]
struct JsonlSink {
    file: Arc<Mutex<std::fs::File>>,
}

impl JsonlSink {
    fn create(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    fn write_line(&self, line: &str) -> Result<(), AppError> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| AppError::SinkError("sink lock poisoned".to_string()))?;
        writeln!(file, "{line}").map_err(|e| AppError::SinkError(e.to_string()))
    }
}

impl PersistenceSink for JsonlSink {
    async fn upsert(&self, record: &ExtractedRecord) -> Result<(), AppError> {
        let line = serde_json::to_string(&serde_json::json!({
            "kind": "record",
            "data": record,
        }))?;
        self.write_line(&line)
    }

    async fn upsert_relationship(
        &self,
        relationship: &RelationshipRecord,
    ) -> Result<(), AppError> {
        let line = serde_json::to_string(&serde_json::json!({
            "kind": "relationship",
            "data": relationship,
        }))?;
        self.write_line(&line)
    }
}
