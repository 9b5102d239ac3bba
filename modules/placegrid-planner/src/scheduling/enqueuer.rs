use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use placegrid_common::{CrawlRequest, PlannerError, PlannerInput, Result};

use super::budget::BudgetTracker;
use crate::queue::{EnqueueOutcome, RequestQueue};
use crate::store::{load_json, save_json, Persist, StateKeys, StateStore};

#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Requests pushed before `start` returns.
    pub initial_batch: usize,
    /// Retries per request after the first failed push.
    pub max_retries: u32,
    /// Wait before retry `n` is `retry_backoff * n`.
    pub retry_backoff: Duration,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            initial_batch: 25,
            max_retries: 3,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

impl EnqueueOptions {
    pub fn from_input(input: &PlannerInput) -> Self {
        Self {
            initial_batch: input.initial_enqueue_batch,
            max_retries: input.enqueue_max_retries,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnqueueStats {
    pub pushed: usize,
    pub duplicates: usize,
    pub skipped_finished: usize,
    pub failed: usize,
    /// Left behind when the run finished or was cancelled early.
    pub unpushed: usize,
}

impl EnqueueStats {
    fn merge(&mut self, other: EnqueueStats) {
        self.pushed += other.pushed;
        self.duplicates += other.duplicates;
        self.skipped_finished += other.skipped_finished;
        self.failed += other.failed;
        self.unpushed += other.unpushed;
    }
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Index of the next request to push. Persisted so a restarted run resumes
/// where it stopped; overlap with already-queued keys is harmless.
pub struct EnqueueCursor {
    position: AtomicUsize,
    store: Option<(Arc<dyn StateStore>, String)>,
}

impl EnqueueCursor {
    pub fn in_memory() -> Self {
        Self {
            position: AtomicUsize::new(0),
            store: None,
        }
    }

    pub async fn load(store: Arc<dyn StateStore>, run_id: &str) -> Self {
        let key = StateKeys::cursor(run_id);
        let position = match load_json::<usize>(store.as_ref(), &key).await {
            Ok(Some(position)) => {
                info!(run_id, position, "Resuming enqueue cursor");
                position
            }
            Ok(None) => 0,
            Err(e) => {
                let err = PlannerError::Storage(e.to_string());
                warn!(run_id, error = %err, "Enqueue cursor unreadable, starting from the top");
                0
            }
        };
        Self {
            position: AtomicUsize::new(position),
            store: Some((store, key)),
        }
    }

    pub fn position(&self) -> usize {
        self.position.load(Ordering::SeqCst)
    }

    fn advance_to(&self, position: usize) {
        self.position.fetch_max(position, Ordering::SeqCst);
    }
}

#[async_trait]
impl Persist for EnqueueCursor {
    fn name(&self) -> &'static str {
        "enqueue_cursor"
    }

    async fn persist(&self) -> Result<()> {
        let Some((store, key)) = &self.store else {
            return Ok(());
        };
        save_json(store.as_ref(), key, &self.position()).await
    }
}

// ---------------------------------------------------------------------------
// Enqueuer
// ---------------------------------------------------------------------------

/// Pushes the planned request list into the queue: a small batch up front,
/// the rest from a background task running alongside the workers.
pub struct BackgroundEnqueuer {
    queue: Arc<dyn RequestQueue>,
    tracker: Arc<BudgetTracker>,
    cursor: Arc<EnqueueCursor>,
    cancelled: Arc<AtomicBool>,
    options: EnqueueOptions,
}

enum Step {
    Continue,
    Stop,
}

impl BackgroundEnqueuer {
    pub fn new(
        queue: Arc<dyn RequestQueue>,
        tracker: Arc<BudgetTracker>,
        cursor: Arc<EnqueueCursor>,
        cancelled: Arc<AtomicBool>,
        options: EnqueueOptions,
    ) -> Self {
        Self {
            queue,
            tracker,
            cursor,
            cancelled,
            options,
        }
    }

    /// Push the initial batch, then hand the remainder to a background task.
    /// Returns once the initial batch is queued.
    pub async fn start(self, requests: Vec<CrawlRequest>) -> EnqueueHandle {
        let done = Arc::new(AtomicBool::new(false));
        let total = requests.len();
        let begin = self.cursor.position().min(total);
        let split = begin.saturating_add(self.options.initial_batch).min(total);
        info!(
            total,
            resume_from = begin,
            initial_batch = split - begin,
            "Starting background enqueue"
        );

        let mut initial = EnqueueStats::default();
        let stopped = matches!(self.push_range(&requests, begin, split, &mut initial).await, Step::Stop);

        if stopped || split == total {
            done.store(true, Ordering::SeqCst);
            log_finished(&initial);
            return EnqueueHandle {
                initial,
                task: None,
                done,
            };
        }

        let done_guard = DoneOnDrop(done.clone());
        let task = tokio::spawn(async move {
            let _done = done_guard;
            let mut stats = EnqueueStats::default();
            self.push_range(&requests, split, total, &mut stats).await;
            stats
        });

        EnqueueHandle {
            initial,
            task: Some(task),
            done,
        }
    }

    async fn push_range(&self, requests: &[CrawlRequest], from: usize, to: usize, stats: &mut EnqueueStats) -> Step {
        for i in from..to {
            if self.cancelled.load(Ordering::Relaxed) {
                info!(position = i, "Enqueue cancelled");
                stats.unpushed += requests.len() - i;
                return Step::Stop;
            }
            if self.tracker.is_globally_finished() {
                info!(position = i, "All searches finished, stopping enqueue");
                stats.unpushed += requests.len() - i;
                return Step::Stop;
            }

            let request = &requests[i];
            if self.tracker.is_finished(request.search_id()) {
                debug!(search = request.search_id(), "Search finished, skipping request");
                stats.skipped_finished += 1;
            } else {
                self.push_with_retry(request, stats).await;
            }
            self.cursor.advance_to(i + 1);
        }
        Step::Continue
    }

    async fn push_with_retry(&self, request: &CrawlRequest, stats: &mut EnqueueStats) {
        let mut attempt = 0;
        loop {
            match self.queue.enqueue(request).await {
                Ok(EnqueueOutcome::Added) => {
                    stats.pushed += 1;
                    return;
                }
                Ok(EnqueueOutcome::AlreadyPresent) => {
                    stats.duplicates += 1;
                    return;
                }
                Err(e) if attempt < self.options.max_retries => {
                    attempt += 1;
                    debug!(key = request.unique_key.as_str(), attempt, error = %e, "Enqueue failed, retrying");
                    tokio::time::sleep(self.options.retry_backoff * attempt).await;
                }
                Err(e) => {
                    let err = PlannerError::Queue(e.to_string());
                    warn!(
                        key = request.unique_key.as_str(),
                        attempts = attempt + 1,
                        error = %err,
                        "Dropping request after repeated enqueue failures"
                    );
                    stats.failed += 1;
                    return;
                }
            }
        }
    }
}

/// Sets the done flag when the background task ends, including by panic.
struct DoneOnDrop(Arc<AtomicBool>);

impl Drop for DoneOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn log_finished(stats: &EnqueueStats) {
    info!(
        pushed = stats.pushed,
        duplicates = stats.duplicates,
        skipped_finished = stats.skipped_finished,
        failed = stats.failed,
        unpushed = stats.unpushed,
        "Background enqueue finished"
    );
}

/// Handle to a running enqueue.
pub struct EnqueueHandle {
    initial: EnqueueStats,
    task: Option<JoinHandle<EnqueueStats>>,
    done: Arc<AtomicBool>,
}

impl EnqueueHandle {
    /// Stats for the synchronously pushed batch.
    pub fn initial_stats(&self) -> EnqueueStats {
        self.initial
    }

    /// Set once no more requests will be pushed.
    pub fn done_flag(&self) -> Arc<AtomicBool> {
        self.done.clone()
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Wait for the background task and return the combined stats.
    pub async fn wait(self) -> EnqueueStats {
        let mut stats = self.initial;
        if let Some(task) = self.task {
            match task.await {
                Ok(background) => {
                    stats.merge(background);
                    log_finished(&stats);
                }
                Err(e) => warn!(error = %e, "Background enqueue task failed"),
            }
        }
        stats
    }
}
