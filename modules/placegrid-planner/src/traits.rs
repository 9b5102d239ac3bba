// Seams to the collaborators that live outside the planner.
//
// PageCrawler is whatever actually loads a map page; ResultSink is where
// accepted places end up. Both are mocked in `testing` so the whole crawl
// loop runs in tests without network or disk.

use anyhow::Result;
use async_trait::async_trait;

use placegrid_common::{CrawlRequest, PlaceResult};

/// What one crawled page produced.
#[derive(Debug, Clone, Default)]
pub struct PageOutput {
    pub places: Vec<PlaceResult>,
    /// Further requests to queue (detail pages, next result pages).
    pub follow_ups: Vec<CrawlRequest>,
}

impl PageOutput {
    pub fn with_places(places: Vec<PlaceResult>) -> Self {
        Self {
            places,
            follow_ups: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// PageCrawler
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PageCrawler: Send + Sync {
    /// Load the page behind `request` and extract its places.
    /// May retry internally; must not hold any planner lock while doing so.
    async fn crawl(&self, request: &CrawlRequest) -> Result<PageOutput>;
}

// ---------------------------------------------------------------------------
// ResultSink
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn push(&self, result: &PlaceResult) -> Result<()>;

    async fn count(&self) -> Result<usize>;
}
