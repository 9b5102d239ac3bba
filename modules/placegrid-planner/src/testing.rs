// Test mocks for the crawl pipeline.
//
// - MockPageCrawler (PageCrawler): URL → PageOutput, or generated places
// - FlakyQueue (RequestQueue): MemoryRequestQueue that fails on demand
// - FlakySink (ResultSink): MemorySink whose first N writes fail, optionally slow
// - FailingSink (ResultSink) / FailingPersist (Persist): always error
//
// Plus fixtures for the Springfield, IL test area.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use placegrid_common::{CrawlRequest, GeoPoint, PlaceResult, PlannerError};

use crate::geo::{Geometry, StaticGeocoder};
use crate::pipeline::MemorySink;
use crate::queue::{EnqueueOutcome, MemoryRequestQueue, RequestQueue};
use crate::store::Persist;
use crate::traits::{PageCrawler, PageOutput, ResultSink};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Springfield, IL city center.
pub const SPRINGFIELD: (f64, f64) = (39.7817, -89.6501);

/// Rough city boundary of Springfield, IL (about 18 x 19 km).
pub fn springfield_ring() -> Vec<GeoPoint> {
    vec![
        GeoPoint::new(39.70, -89.75),
        GeoPoint::new(39.70, -89.55),
        GeoPoint::new(39.87, -89.55),
        GeoPoint::new(39.87, -89.75),
    ]
}

/// Gazetteer knowing only Springfield.
pub fn springfield_geocoder() -> StaticGeocoder {
    StaticGeocoder::new().with_place(
        "springfield",
        Geometry::Polygon {
            ring: springfield_ring(),
        },
    )
}

// ---------------------------------------------------------------------------
// MockPageCrawler
// ---------------------------------------------------------------------------

/// Page crawler with canned outputs per URL. Unregistered URLs either fail
/// or, when `generating` is set, yield that many places derived from the
/// request key. Records every URL it was asked for.
pub struct MockPageCrawler {
    pages: HashMap<String, PageOutput>,
    generate: Option<usize>,
    delay: Option<Duration>,
    crawled: Mutex<Vec<String>>,
}

impl Default for MockPageCrawler {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPageCrawler {
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
            generate: None,
            delay: None,
            crawled: Mutex::new(Vec::new()),
        }
    }

    /// Every unregistered page yields `per_page` places inside Springfield.
    pub fn generating(per_page: usize) -> Self {
        Self {
            generate: Some(per_page),
            ..Self::new()
        }
    }

    pub fn on_url(mut self, url: &str, output: PageOutput) -> Self {
        self.pages.insert(url.to_string(), output);
        self
    }

    /// Sleep this long inside every crawl.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn crawled(&self) -> Vec<String> {
        self.crawled.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl PageCrawler for MockPageCrawler {
    async fn crawl(&self, request: &CrawlRequest) -> Result<PageOutput> {
        self.crawled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.url.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(output) = self.pages.get(&request.url) {
            return Ok(output.clone());
        }
        match self.generate {
            Some(per_page) => {
                let (lat, lng) = SPRINGFIELD;
                let places = (0..per_page)
                    .map(|i| {
                        PlaceResult::new(format!("{}#{i}", request.unique_key))
                            .at(lat + i as f64 * 0.001, lng)
                    })
                    .collect();
                Ok(PageOutput::with_places(places))
            }
            None => bail!("MockPageCrawler: no page for {}", request.url),
        }
    }
}

// ---------------------------------------------------------------------------
// FlakyQueue
// ---------------------------------------------------------------------------

/// In-memory queue whose `enqueue` fails for the first N calls, always for
/// one key, or panics on one key.
pub struct FlakyQueue {
    inner: MemoryRequestQueue,
    failures_left: AtomicUsize,
    rejected_key: Option<String>,
    panic_key: Option<String>,
    attempts: AtomicUsize,
}

impl FlakyQueue {
    pub fn failing_first(n: usize) -> Self {
        Self {
            inner: MemoryRequestQueue::new(),
            failures_left: AtomicUsize::new(n),
            rejected_key: None,
            panic_key: None,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn rejecting_key(key: &str) -> Self {
        Self {
            rejected_key: Some(key.to_string()),
            ..Self::failing_first(0)
        }
    }

    pub fn panicking_on_key(key: &str) -> Self {
        Self {
            panic_key: Some(key.to_string()),
            ..Self::failing_first(0)
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestQueue for FlakyQueue {
    async fn enqueue(&self, request: &CrawlRequest) -> placegrid_common::Result<EnqueueOutcome> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.panic_key.as_deref() == Some(request.unique_key.as_str()) {
            panic!("queue crashed on {}", request.unique_key);
        }
        if self.rejected_key.as_deref() == Some(request.unique_key.as_str()) {
            return Err(PlannerError::Queue(format!("rejected {}", request.unique_key)));
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PlannerError::Queue("queue temporarily unavailable".to_string()));
        }
        self.inner.enqueue(request).await
    }

    async fn fetch_next(&self) -> placegrid_common::Result<Option<CrawlRequest>> {
        self.inner.fetch_next().await
    }

    async fn pending(&self) -> placegrid_common::Result<usize> {
        self.inner.pending().await
    }
}

// ---------------------------------------------------------------------------
// FlakySink
// ---------------------------------------------------------------------------

/// Memory sink whose first N writes fail. Every write, failed or not, waits
/// `delay` first.
pub struct FlakySink {
    inner: MemorySink,
    failures_left: AtomicUsize,
    delay: Option<Duration>,
}

impl FlakySink {
    pub fn failing_first(n: usize) -> Self {
        Self {
            inner: MemorySink::new(),
            failures_left: AtomicUsize::new(n),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn results(&self) -> Vec<PlaceResult> {
        self.inner.results()
    }
}

#[async_trait]
impl ResultSink for FlakySink {
    async fn push(&self, result: &PlaceResult) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            bail!("sink temporarily unavailable for {}", result.place_id);
        }
        self.inner.push(result).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }
}

// ---------------------------------------------------------------------------
// Failing collaborators
// ---------------------------------------------------------------------------

pub struct FailingSink;

#[async_trait]
impl ResultSink for FailingSink {
    async fn push(&self, result: &PlaceResult) -> Result<()> {
        bail!("sink rejected {}", result.place_id)
    }

    async fn count(&self) -> Result<usize> {
        Ok(0)
    }
}

pub struct FailingPersist;

#[async_trait]
impl Persist for FailingPersist {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn persist(&self) -> placegrid_common::Result<()> {
        Err(PlannerError::Storage("disk full".to_string()))
    }
}
