//! # nugget CLI
//!
//! Thin command-line surface over the retrieval core.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `nugget init` | Create the brain skeleton (`brain.yaml`, `domains/`) |
//! | `nugget index` | Rebuild the index and report what was indexed |
//! | `nugget query "<task>"` | Retrieve context fragments for a task |
//! | `nugget watch` | Keep the index fresh while documents change |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use nugget_core::Config;
use nugget_retrieval::paths::init_brain;
use nugget_retrieval::{RetrievalEngine, RetrievalRequest, RetrievalSettings, run_watcher};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "nugget", about = "Retrieval over a personal knowledge brain", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new brain directory. Existing files are left alone.
    Init {
        /// Where to create the brain; defaults to the configured root.
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Rebuild the index from every document in the brain.
    Index {
        #[arg(long)]
        brain: Option<PathBuf>,
    },

    /// Retrieve context fragments for a task.
    Query {
        /// Task description to retrieve context for.
        task: String,

        /// Boost documents in this domain (and its subdomains).
        #[arg(long)]
        domain: Option<String>,

        /// Maximum number of fragments.
        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        brain: Option<PathBuf>,

        /// Print fragments and the retrieval trace as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Index, then reindex documents as they change until Ctrl-C.
    Watch {
        #[arg(long)]
        brain: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Config::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.settings.logging.level.as_str().into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init { path } => {
            let root = config.brain_root(path)?;
            init_brain(&root)?;
            println!("Brain initialized at {}", root.display());
        }
        Commands::Index { brain } => {
            let settings = settings_for(&config, brain)?;
            let engine = RetrievalEngine::open(&settings, config.ranker_api_key()).await?;
            let stats = engine.rebuild().await?;
            println!(
                "Indexed {} documents into {} chunks ({} embedded, {} rejected)",
                stats.documents, stats.chunks, stats.embedded, stats.rejected
            );
            for rejected in engine.store().snapshot().rejected() {
                println!("  skipped {}: {}", rejected.origin, rejected.reason);
            }
        }
        Commands::Query {
            task,
            domain,
            limit,
            brain,
            json,
        } => {
            let settings = settings_for(&config, brain)?;
            let engine = RetrievalEngine::open(&settings, config.ranker_api_key()).await?;
            engine.rebuild().await?;

            let mut request = RetrievalRequest::new(task);
            request.domain_hint = domain;
            request.max_results = limit;
            let outcome = engine.retrieve(&request).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else if outcome.fragments.is_empty() {
                println!("No relevant context found.");
            } else {
                for (rank, fragment) in outcome.fragments.iter().enumerate() {
                    println!(
                        "{}. [{:.4}] {} ({})",
                        rank + 1,
                        fragment.score,
                        fragment.chunk_id,
                        fragment.breadcrumb.join(" > ")
                    );
                    println!("   {}", fragment.justification);
                }
                if outcome.trace.degraded {
                    println!("(ranker unavailable, showing fused order)");
                }
            }
        }
        Commands::Watch { brain } => {
            let settings = settings_for(&config, brain)?;
            let root = config.brain_root(settings.brain_root.clone())?;
            let engine = RetrievalEngine::open(&settings, config.ranker_api_key()).await?;
            let stats = engine.rebuild().await?;
            info!(documents = stats.documents, chunks = stats.chunks, "initial index ready");

            let shutdown = CancellationToken::new();
            let watcher = tokio::spawn(run_watcher(
                Arc::clone(engine.store()),
                root,
                Duration::from_millis(settings.watch_debounce_ms),
                shutdown.clone(),
            ));
            tokio::signal::ctrl_c().await?;
            shutdown.cancel();
            watcher.await??;
        }
    }

    Ok(())
}

/// Resolved retrieval settings, with `--brain` taking precedence.
fn settings_for(
    config: &Config,
    brain: Option<PathBuf>,
) -> Result<RetrievalSettings, Box<dyn std::error::Error>> {
    let mut settings = config.retrieval_settings();
    settings.brain_root = Some(config.brain_root(brain)?);
    Ok(settings)
}
