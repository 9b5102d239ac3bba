use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::session::{CrawlSession, OutputStats};
use crate::traits::PageCrawler;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    /// Sleep between polls of an empty queue while more work may arrive.
    pub idle_poll: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            idle_poll: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub crawled: usize,
    pub skipped_finished: usize,
    pub crawl_failures: usize,
    pub output: OutputStats,
}

impl WorkerStats {
    fn merge(&mut self, other: WorkerStats) {
        self.crawled += other.crawled;
        self.skipped_finished += other.skipped_finished;
        self.crawl_failures += other.crawl_failures;
        self.output.merge(other.output);
    }
}

struct WorkerContext {
    session: Arc<CrawlSession>,
    crawler: Arc<dyn PageCrawler>,
    enqueue_done: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    /// Workers holding a request, counted from just before the fetch.
    in_flight: AtomicUsize,
    idle_poll: Duration,
}

/// Drain the queue with `concurrency` workers.
///
/// Workers stop when cancelled, when every search is finished, or when the
/// queue is empty, the enqueuer is done and nobody is still crawling (and so
/// could still queue follow-ups). A request already being crawled is always
/// handled to the end.
pub async fn run_workers(
    session: Arc<CrawlSession>,
    crawler: Arc<dyn PageCrawler>,
    enqueue_done: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    options: WorkerOptions,
) -> WorkerStats {
    let ctx = Arc::new(WorkerContext {
        session,
        crawler,
        enqueue_done,
        cancelled,
        in_flight: AtomicUsize::new(0),
        idle_poll: options.idle_poll,
    });

    let concurrency = options.concurrency.max(1);
    info!(concurrency, "Starting crawl workers");

    let mut set = JoinSet::new();
    for worker in 0..concurrency {
        let ctx = ctx.clone();
        set.spawn(async move { worker_loop(worker, ctx).await });
    }

    let mut stats = WorkerStats::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(worker_stats) => stats.merge(worker_stats),
            Err(e) => warn!(error = %e, "Crawl worker panicked"),
        }
    }

    info!(
        crawled = stats.crawled,
        accepted = stats.output.accepted,
        skipped_finished = stats.skipped_finished,
        crawl_failures = stats.crawl_failures,
        "Crawl workers finished"
    );
    stats
}

async fn worker_loop(worker: usize, ctx: Arc<WorkerContext>) -> WorkerStats {
    let mut stats = WorkerStats::default();
    let tracker = ctx.session.tracker();

    loop {
        if ctx.cancelled.load(Ordering::Relaxed) {
            debug!(worker, "Cancelled");
            break;
        }
        if tracker.is_globally_finished() {
            debug!(worker, "All searches finished");
            break;
        }

        ctx.in_flight.fetch_add(1, Ordering::SeqCst);
        let next = match ctx.session.queue().fetch_next().await {
            Ok(next) => next,
            Err(e) => {
                warn!(worker, error = %e, "Queue fetch failed");
                None
            }
        };

        let Some(request) = next else {
            let others = ctx.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
            if others == 0 && ctx.enqueue_done.load(Ordering::SeqCst) {
                let drained = ctx.session.queue().pending().await.map(|n| n == 0).unwrap_or(true);
                if drained {
                    break;
                }
                continue;
            }
            tokio::time::sleep(ctx.idle_poll).await;
            continue;
        };

        if tracker.is_finished(request.search_id()) {
            stats.skipped_finished += 1;
        } else {
            match ctx.crawler.crawl(&request).await {
                Ok(output) => {
                    stats.crawled += 1;
                    let output_stats = ctx.session.handle_output(&request, output).await;
                    stats.output.merge(output_stats);
                }
                Err(e) => {
                    stats.crawl_failures += 1;
                    warn!(worker, url = request.url.as_str(), error = %e, "Crawl failed");
                }
            }
        }
        ctx.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    stats
}
