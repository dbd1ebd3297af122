//! `guidedb`: build and query the local guide index.
//!
//! ```bash
//! guidedb index                              # every guide under data.guides_dir
//! guidedb index --game "Chrono Trigger"
//! guidedb query zelda "where is the hookshot"
//! guidedb status zelda
//! guidedb delete snes/zelda/guide_walkthrough
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use guidedb_core::config::Config;
use guidedb_core::traits::GuideStore;
use guidedb_core::types::{normalize_game_id, IndexStatus};
use guidedb_core::FileSystemGuideStore;
use guidedb_embed::DefaultModelLoader;
use guidedb_retrieval::RetrievalService;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "guidedb")]
#[command(about = "Local semantic index over game guides")]
#[command(version)]
struct Cli {
    /// Guide root laid out as <platform>/<game>/guide_*.md (overrides data.guides_dir)
    #[arg(long, env = "GUIDEDB_GUIDES_DIR", global = true)]
    guides_dir: Option<PathBuf>,

    /// LanceDB directory (overrides data.db_dir)
    #[arg(long, env = "GUIDEDB_DB_DIR", global = true)]
    db_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index every guide, or only the guides of one game
    Index {
        #[arg(short, long)]
        game: Option<String>,

        /// Guides indexed concurrently
        #[arg(short, long, default_value = "4")]
        jobs: usize,
    },

    /// Retrieve the best passages for a question
    Query {
        game: String,

        query: String,

        /// Number of passages (defaults to retrieval.top_k)
        #[arg(short, long)]
        k: Option<usize>,

        /// Token budget (defaults to retrieval.token_budget)
        #[arg(long)]
        token_budget: Option<usize>,

        /// Print the formatted chat context instead of a ranked list
        #[arg(long)]
        context: bool,
    },

    /// Show indexing status per guide
    Status { game: Option<String> },

    /// Drop a guide's index entries
    Delete { guide_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("loading configuration")?;
    let mut settings = config.settings()?;
    let cwd = std::env::current_dir()?;
    let guides_dir = cli.guides_dir.unwrap_or_else(|| settings.data.guides_path(&cwd));
    let db_dir = cli.db_dir.unwrap_or_else(|| settings.data.db_path(&cwd));
    settings.data.db_dir = db_dir.to_string_lossy().into_owned();

    let store = Arc::new(FileSystemGuideStore::new(guides_dir));
    let loader = Arc::new(DefaultModelLoader::new(settings.embedding.clone()));
    let service = RetrievalService::init(settings, store.clone(), loader).await?;

    let outcome = run(cli.command, &service, store.as_ref()).await;
    service.shutdown().await?;
    outcome
}

async fn run(command: Commands, service: &RetrievalService, store: &dyn GuideStore) -> Result<()> {
    match command {
        Commands::Index { game, jobs } => index(service, store, game.as_deref(), jobs).await,
        Commands::Query { game, query, k, token_budget, context } => {
            let defaults = &service.settings().retrieval;
            let k = k.unwrap_or(defaults.top_k);
            let budget = token_budget.unwrap_or(defaults.token_budget);
            if context {
                println!("{}", service.context_for_query(&game, &query, k, budget).await?);
                return Ok(());
            }
            let result = service.retrieve(&game, &query, k, budget).await?;
            if let Some(reason) = result.degraded {
                println!("⚠️  Degraded result ({reason:?}); indexing may still be running");
            }
            if result.is_empty() {
                println!("No passages found.");
            }
            for (rank, p) in result.passages.iter().enumerate() {
                println!("\n#{} score={:.3} {} ({})", rank + 1, p.score, p.chunk_id, p.source);
                println!("{}", p.text);
            }
            Ok(())
        }
        Commands::Status { game } => {
            let games: Vec<String> = match game {
                Some(g) => vec![normalize_game_id(&g)],
                None => {
                    let mut ids: Vec<String> = store.games()?.into_iter().map(|g| g.game_id).collect();
                    ids.dedup();
                    ids
                }
            };
            for game in games {
                println!("{game}: {}", service.game_status(&game)?);
                for (guide, status) in service.game_statuses(&game)? {
                    println!("  {:<12} {guide}", status.to_string());
                }
            }
            Ok(())
        }
        Commands::Delete { guide_id } => {
            service.delete_guide_index(&guide_id).await?;
            println!("🗑️  Deleted index entries for {guide_id}");
            Ok(())
        }
    }
}

async fn index(service: &RetrievalService, store: &dyn GuideStore, game: Option<&str>, jobs: usize) -> Result<()> {
    let mut guides = match game {
        Some(g) => store.guides_for_game(&normalize_game_id(g))?,
        None => {
            let mut all = Vec::new();
            for g in store.games()? {
                all.extend(store.guides_for_game(&g.game_id)?);
            }
            all
        }
    };
    guides.sort();
    guides.dedup();
    println!("Indexing {} guides", guides.len());

    let pb = ProgressBar::new(guides.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} guides ({percent}%) {msg}")?
            .progress_chars("#>-"),
    );
    let outcomes: Vec<(String, guidedb_core::Result<IndexStatus>)> = stream::iter(guides)
        .map(|guide| async move {
            let outcome = service.index_guide(&guide).await;
            (guide, outcome)
        })
        .buffer_unordered(jobs.max(1))
        .inspect(|(guide, _)| {
            pb.set_message(guide.clone());
            pb.inc(1);
        })
        .collect()
        .await;
    pb.finish_with_message("done");

    let mut indexed = 0;
    for (guide, outcome) in &outcomes {
        match outcome {
            Ok(IndexStatus::Indexed) => indexed += 1,
            Ok(status) => println!("  ❌ {guide}: {status}"),
            Err(e) => {
                warn!(guide = %guide, error = %e, "guide not indexed");
                println!("  ❌ {guide}: {e}");
            }
        }
    }
    println!("\n✅ Indexed {indexed}/{} guides", outcomes.len());
    Ok(())
}
