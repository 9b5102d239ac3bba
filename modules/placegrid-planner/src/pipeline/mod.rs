//! End-to-end run: plan, resume state, enqueue in the background, drain the
//! queue with workers, persist on the way out.

pub mod persister;
pub mod plan;
pub mod session;
pub mod sink;
pub mod workers;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use placegrid_common::{PlannerInput, Result};

use crate::cache::PlaceCache;
use crate::dedup::ResultDeduper;
use crate::geo::Geocoder;
use crate::queue::RequestQueue;
use crate::scheduling::{BackgroundEnqueuer, BudgetTracker, EnqueueCursor, EnqueueOptions, EnqueueStats};
use crate::store::StateStore;
use crate::traits::{PageCrawler, ResultSink};

pub use persister::{PersisterHandle, StatePersister};
pub use plan::{load_or_plan, plan, PlannedCrawl};
pub use session::{CrawlSession, OutputStats};
pub use sink::{DatasetSink, MemorySink};
pub use workers::{run_workers, WorkerOptions, WorkerStats};

/// Collaborators a run needs.
pub struct CrawlDeps {
    pub store: Arc<dyn StateStore>,
    pub geocoder: Arc<dyn Geocoder>,
    pub queue: Arc<dyn RequestQueue>,
    pub crawler: Arc<dyn PageCrawler>,
    pub sink: Arc<dyn ResultSink>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlReport {
    pub run_id: String,
    pub zoom: Option<u8>,
    pub tile_count: usize,
    pub planned_requests: usize,
    pub enqueue: EnqueueStats,
    pub workers: WorkerStats,
    pub total_accepted: u64,
}

/// Run a crawl to completion (or cancellation).
///
/// Only invalid input and planning errors abort the run. Everything after planning recovers
/// locally and shows up in the report instead.
pub async fn run_crawl(
    input: &PlannerInput,
    run_id: &str,
    deps: CrawlDeps,
    cancelled: Arc<AtomicBool>,
) -> Result<CrawlReport> {
    input.validate()?;
    let store = deps.store;

    let cache = Arc::new(PlaceCache::open(input.use_cache, store.clone(), &input.effective_cache_key()).await);
    let planned = load_or_plan(store.as_ref(), run_id, input, deps.geocoder.as_ref(), &cache).await?;
    info!(
        run_id,
        requests = planned.requests.len(),
        tiles = planned.tile_count,
        zoom = ?planned.zoom,
        "Crawl planned"
    );

    let tracker = Arc::new(
        BudgetTracker::load(
            store.clone(),
            run_id,
            &planned.search_ids(),
            input.max_places_per_search,
            input.max_places_total,
        )
        .await,
    );
    let deduper = Arc::new(ResultDeduper::open(input.dedupe_results, store.clone(), run_id).await);
    let cursor = Arc::new(EnqueueCursor::load(store.clone(), run_id).await);

    let mut persister = StatePersister::new(Duration::from_secs(input.persist_interval_secs.max(1)));
    persister.register(tracker.clone());
    persister.register(cache.clone());
    persister.register(deduper.clone());
    persister.register(cursor.clone());
    let persister = persister.spawn();

    let enqueue = BackgroundEnqueuer::new(
        deps.queue.clone(),
        tracker.clone(),
        cursor,
        cancelled.clone(),
        EnqueueOptions::from_input(input),
    )
    .start(planned.requests.clone())
    .await;

    let session = Arc::new(CrawlSession::new(
        tracker.clone(),
        cache,
        deduper,
        deps.queue,
        deps.sink,
    ));
    let workers = run_workers(
        session,
        deps.crawler,
        enqueue.done_flag(),
        cancelled,
        WorkerOptions {
            concurrency: input.max_concurrency,
            ..WorkerOptions::default()
        },
    )
    .await;

    let enqueue = enqueue.wait().await;
    persister.shutdown().await;
    tracker.log_status();

    Ok(CrawlReport {
        run_id: run_id.to_string(),
        zoom: planned.zoom,
        tile_count: planned.tile_count,
        planned_requests: planned.requests.len(),
        enqueue,
        workers,
        total_accepted: tracker.total_accepted(),
    })
}
