use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use placegrid_common::{CrawlRequest, PlaceResult, PlannerError};

use crate::cache::PlaceCache;
use crate::dedup::ResultDeduper;
use crate::queue::{EnqueueOutcome, RequestQueue};
use crate::scheduling::BudgetTracker;
use crate::traits::{PageOutput, ResultSink};

/// Per-page admission counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OutputStats {
    pub accepted: usize,
    pub over_budget: usize,
    pub duplicates: usize,
    pub sink_failures: usize,
    pub follow_ups_queued: usize,
    pub follow_ups_skipped: usize,
}

impl OutputStats {
    pub fn merge(&mut self, other: OutputStats) {
        self.accepted += other.accepted;
        self.over_budget += other.over_budget;
        self.duplicates += other.duplicates;
        self.sink_failures += other.sink_failures;
        self.follow_ups_queued += other.follow_ups_queued;
        self.follow_ups_skipped += other.follow_ups_skipped;
    }
}

enum Admission {
    Accepted,
    OverBudget,
    Duplicate,
    SinkFailed,
}

/// The shared state every worker reports into.
pub struct CrawlSession {
    tracker: Arc<BudgetTracker>,
    cache: Arc<PlaceCache>,
    deduper: Arc<ResultDeduper>,
    queue: Arc<dyn RequestQueue>,
    sink: Arc<dyn ResultSink>,
}

impl CrawlSession {
    pub fn new(
        tracker: Arc<BudgetTracker>,
        cache: Arc<PlaceCache>,
        deduper: Arc<ResultDeduper>,
        queue: Arc<dyn RequestQueue>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            tracker,
            cache,
            deduper,
            queue,
            sink,
        }
    }

    pub fn tracker(&self) -> &BudgetTracker {
        &self.tracker
    }

    pub fn queue(&self) -> &dyn RequestQueue {
        self.queue.as_ref()
    }

    /// Admit the places a page produced and queue its follow-ups.
    ///
    /// Per place: record in the cache, reserve a budget slot, claim the
    /// emitted key (releasing the slot on a duplicate), write to the sink
    /// (releasing the slot and the key if the write fails), then commit.
    pub async fn handle_output(&self, request: &CrawlRequest, output: PageOutput) -> OutputStats {
        let mut stats = OutputStats::default();
        let search_id = request.search_id();

        for place in &output.places {
            match self.admit(search_id, request, place).await {
                Admission::Accepted => stats.accepted += 1,
                Admission::OverBudget => stats.over_budget += 1,
                Admission::Duplicate => stats.duplicates += 1,
                Admission::SinkFailed => stats.sink_failures += 1,
            }
        }

        for mut follow_up in output.follow_ups {
            if follow_up.search_term.is_none() {
                follow_up.search_term = request.search_term.clone();
            }
            if self.tracker.is_finished(follow_up.search_id()) {
                stats.follow_ups_skipped += 1;
                continue;
            }
            match self.queue.enqueue(&follow_up).await {
                Ok(EnqueueOutcome::Added) => stats.follow_ups_queued += 1,
                Ok(EnqueueOutcome::AlreadyPresent) => stats.follow_ups_skipped += 1,
                Err(e) => {
                    stats.follow_ups_skipped += 1;
                    warn!(key = follow_up.unique_key.as_str(), error = %e, "Failed to queue follow-up");
                }
            }
        }

        stats
    }

    async fn admit(&self, search_id: &str, request: &CrawlRequest, place: &PlaceResult) -> Admission {
        if let Some(location) = place.location {
            self.cache
                .record(&place.place_id, location, request.search_term.as_deref());
        }

        if !self.tracker.try_reserve(search_id) {
            debug!(search = search_id, place = place.place_id.as_str(), "Over budget, discarding");
            return Admission::OverBudget;
        }

        if !self.deduper.try_emit(&place.place_id) {
            self.tracker.release(search_id);
            debug!(place = place.place_id.as_str(), "Already emitted");
            return Admission::Duplicate;
        }

        if let Err(e) = self.sink.push(place).await {
            self.tracker.release(search_id);
            self.deduper.forget(&place.place_id);
            let err = PlannerError::Anyhow(e);
            warn!(place = place.place_id.as_str(), error = %err, "Failed to write result");
            return Admission::SinkFailed;
        }

        self.tracker.commit(search_id);
        Admission::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::sink::MemorySink;
    use crate::queue::MemoryRequestQueue;
    use crate::store::MemoryStateStore;
    use crate::scheduling::{BackgroundEnqueuer, EnqueueCursor, EnqueueOptions};
    use crate::testing::{FailingSink, FlakySink};
    use placegrid_common::RequestLabel;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn pizza_request() -> CrawlRequest {
        CrawlRequest::new("https://example.com/pizza", "pizza-0", RequestLabel::Search)
            .with_search_term(Some("pizza".into()))
    }

    async fn build_session(cap: Option<u64>, dedupe: bool, sink: Arc<dyn ResultSink>) -> (CrawlSession, Arc<MemoryRequestQueue>) {
        let store = Arc::new(MemoryStateStore::new());
        let queue = Arc::new(MemoryRequestQueue::new());
        let session = CrawlSession::new(
            Arc::new(BudgetTracker::new(&["pizza".to_string()], cap, None)),
            Arc::new(PlaceCache::open(true, store.clone(), "k").await),
            Arc::new(ResultDeduper::open(dedupe, store, "run").await),
            queue.clone(),
            sink,
        );
        (session, queue)
    }

    fn places(ids: &[&str]) -> Vec<PlaceResult> {
        ids.iter().map(|id| PlaceResult::new(*id).at(39.8, -89.6)).collect()
    }

    #[tokio::test]
    async fn accepts_up_to_the_cap() {
        let sink = Arc::new(MemorySink::new());
        let (session, _) = build_session(Some(2), false, sink.clone()).await;
        let stats = session
            .handle_output(&pizza_request(), PageOutput::with_places(places(&["a", "b", "c"])))
            .await;
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.over_budget, 1);
        assert_eq!(sink.results().len(), 2);
        assert!(session.tracker().is_finished("pizza"));
    }

    #[tokio::test]
    async fn duplicates_give_their_slot_back() {
        let sink = Arc::new(MemorySink::new());
        let (session, _) = build_session(Some(2), true, sink.clone()).await;
        let stats = session
            .handle_output(&pizza_request(), PageOutput::with_places(places(&["a", "a", "b"])))
            .await;
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(session.tracker().accepted("pizza"), 2);
    }

    #[tokio::test]
    async fn sink_failure_refunds_and_releases_key() {
        let (session, _) = build_session(Some(2), true, Arc::new(FailingSink)).await;
        let stats = session
            .handle_output(&pizza_request(), PageOutput::with_places(places(&["a"])))
            .await;
        assert_eq!(stats.sink_failures, 1);
        assert_eq!(session.tracker().accepted("pizza"), 0);
        assert!(session.deduper.try_emit("a"));
    }

    #[tokio::test]
    async fn discovered_places_are_cached_even_over_budget() {
        let (session, _) = build_session(Some(0), false, Arc::new(MemorySink::new())).await;
        session
            .handle_output(&pizza_request(), PageOutput::with_places(places(&["a"])))
            .await;
        assert_eq!(session.cache.len(), 1);
    }

    #[tokio::test]
    async fn follow_ups_inherit_search_and_respect_budget() {
        let (session, queue) = build_session(Some(1), false, Arc::new(MemorySink::new())).await;
        let detail = CrawlRequest::new("https://example.com/detail/a", "detail-a", RequestLabel::Detail);
        let output = PageOutput {
            places: Vec::new(),
            follow_ups: vec![detail.clone(), detail.clone()],
        };
        let stats = session.handle_output(&pizza_request(), output).await;
        assert_eq!(stats.follow_ups_queued, 1);
        assert_eq!(stats.follow_ups_skipped, 1);
        let queued = queue.fetch_next().await.unwrap().unwrap();
        assert_eq!(queued.search_id(), "pizza");

        assert!(session.tracker().try_accept("pizza"));
        let output = PageOutput {
            places: Vec::new(),
            follow_ups: vec![CrawlRequest::new("https://example.com/detail/b", "detail-b", RequestLabel::Detail)],
        };
        let stats = session.handle_output(&pizza_request(), output).await;
        assert_eq!(stats.follow_ups_queued, 0);
        assert_eq!(stats.follow_ups_skipped, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pending_write_keeps_search_open_for_enqueue() {
        let sink = Arc::new(FlakySink::failing_first(1).with_delay(Duration::from_millis(200)));
        let (session, queue) = build_session(Some(1), false, sink.clone()).await;
        let session = Arc::new(session);

        let writer = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .handle_output(&pizza_request(), PageOutput::with_places(places(&["a"])))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.tracker().reserved("pizza"), 1);
        assert!(!session.tracker().is_finished("pizza"));

        let requests: Vec<CrawlRequest> = (0..20)
            .map(|i| {
                CrawlRequest::new(format!("https://example.com/pizza/{i}"), format!("pizza-{i}"), RequestLabel::Search)
                    .with_search_term(Some("pizza".into()))
            })
            .collect();
        let enqueue = BackgroundEnqueuer::new(
            queue.clone(),
            session.tracker.clone(),
            Arc::new(EnqueueCursor::in_memory()),
            Arc::new(AtomicBool::new(false)),
            EnqueueOptions::default(),
        )
        .start(requests)
        .await
        .wait()
        .await;

        let stats = writer.await.unwrap();
        assert_eq!(stats.sink_failures, 1);
        assert_eq!(enqueue.pushed, 20);
        assert_eq!(enqueue.unpushed, 0);
        assert_eq!(queue.pending().await.unwrap(), 20);
        assert_eq!(session.tracker().accepted("pizza"), 0);
        assert_eq!(session.tracker().reserved("pizza"), 0);
        assert!(!session.tracker().is_finished("pizza"));
        assert!(sink.results().is_empty());
    }

    #[tokio::test]
    async fn duplicate_releases_its_reservation() {
        let (session, _) = build_session(Some(1), true, Arc::new(MemorySink::new())).await;
        assert!(session.deduper.try_emit("a"));
        let stats = session
            .handle_output(&pizza_request(), PageOutput::with_places(places(&["a", "b"])))
            .await;
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.accepted, 1);
        assert_eq!(session.tracker().reserved("pizza"), 0);
        assert!(session.tracker().is_finished("pizza"));
    }
}
