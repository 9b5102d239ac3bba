use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use placegrid_common::{Config, PlannerInput};
use placegrid_planner::cache::PlaceCache;
use placegrid_planner::geo::{Geocoder, NominatimGeocoder, StaticGeocoder};
use placegrid_planner::pipeline::{load_or_plan, PlannedCrawl};
use placegrid_planner::scheduling::BudgetSnapshot;
use placegrid_planner::store::{load_json, FileStateStore, StateKeys, StateStore};

#[derive(Parser)]
#[command(name = "placegrid", about = "Plan tiled map searches for a geographic area")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve the area, tile it and persist the request list for the run.
    Plan {
        /// Run input JSON.
        #[arg(long)]
        input: PathBuf,
        /// Offline gazetteer JSON used instead of Nominatim.
        #[arg(long)]
        gazetteer: Option<PathBuf>,
    },
    /// Print persisted plan and budget counts for the run.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("placegrid=info".parse()?);
    if std::env::var("PLACEGRID_LOG_FORMAT").is_ok_and(|f| f == "json") {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let cli = Cli::parse();
    let config = Config::from_env();
    config.log_summary();

    let store = FileStateStore::open(&config.state_dir)
        .await
        .with_context(|| format!("opening state dir {}", config.state_dir.display()))?;

    match cli.command {
        Command::Plan { input, gazetteer } => plan(&config, &store, input, gazetteer).await,
        Command::Status => status(&config, &store).await,
    }
}

async fn plan(config: &Config, store: &FileStateStore, input: PathBuf, gazetteer: Option<PathBuf>) -> Result<()> {
    let raw = tokio::fs::read_to_string(&input)
        .await
        .with_context(|| format!("reading input {}", input.display()))?;
    let input = PlannerInput::from_json(&raw)?;

    let geocoder: Box<dyn Geocoder> = match gazetteer {
        Some(path) => Box::new(StaticGeocoder::from_json_file(&path).await?),
        None => Box::new(NominatimGeocoder::new(&config.nominatim_url, &config.user_agent)),
    };

    let shared: Arc<dyn StateStore> = Arc::new(store.clone());
    let cache = PlaceCache::open(input.use_cache, shared, &input.effective_cache_key()).await;
    let planned = load_or_plan(store, &config.run_id, &input, geocoder.as_ref(), &cache).await?;

    let summary = json!({
        "runId": config.run_id,
        "zoom": planned.zoom,
        "tiles": planned.tile_count,
        "requests": planned.requests.len(),
        "searches": planned.search_ids(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn status(config: &Config, store: &FileStateStore) -> Result<()> {
    let planned: Option<PlannedCrawl> = load_json(store, &StateKeys::plan(&config.run_id)).await?;
    let budget: Option<BudgetSnapshot> = load_json(store, &StateKeys::budget(&config.run_id)).await?;
    let cursor: Option<usize> = load_json(store, &StateKeys::cursor(&config.run_id)).await?;

    let summary = json!({
        "runId": config.run_id,
        "planned": planned.as_ref().map(|p| p.requests.len()),
        "searches": planned.as_ref().map(|p| p.search_ids()),
        "enqueued": cursor,
        "accepted": budget.as_ref().map(|b| &b.accepted),
        "totalAccepted": budget.as_ref().map(|b| b.global),
        "savedAt": budget.as_ref().map(|b| b.saved_at),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
