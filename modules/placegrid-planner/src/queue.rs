//! The shared request queue the enqueuer fills and workers drain.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use placegrid_common::{CrawlRequest, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Added,
    /// The key was already queued (or already handled) this run.
    AlreadyPresent,
}

/// Queue of crawl requests, idempotent on `unique_key`.
#[async_trait]
pub trait RequestQueue: Send + Sync {
    async fn enqueue(&self, request: &CrawlRequest) -> Result<EnqueueOutcome>;

    /// Next request, or `None` when the queue is currently empty.
    async fn fetch_next(&self) -> Result<Option<CrawlRequest>>;

    async fn pending(&self) -> Result<usize>;
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<CrawlRequest>,
    seen: HashSet<String>,
}

/// In-process queue. Keys stay remembered after a request is fetched, so a
/// handled request can never be queued twice.
#[derive(Default)]
pub struct MemoryRequestQueue {
    state: Mutex<QueueState>,
}

impl MemoryRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen_count(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).seen.len()
    }
}

#[async_trait]
impl RequestQueue for MemoryRequestQueue {
    async fn enqueue(&self, request: &CrawlRequest) -> Result<EnqueueOutcome> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.seen.insert(request.unique_key.clone()) {
            return Ok(EnqueueOutcome::AlreadyPresent);
        }
        state.pending.push_back(request.clone());
        Ok(EnqueueOutcome::Added)
    }

    async fn fetch_next(&self) -> Result<Option<CrawlRequest>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.pending.pop_front())
    }

    async fn pending(&self) -> Result<usize> {
        Ok(self.state.lock().unwrap_or_else(|e| e.into_inner()).pending.len())
    }
}
