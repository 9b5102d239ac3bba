//! Search request builder: start URLs, search terms, tiles and cache hits in,
//! an ordered, key-deduplicated request list out.
//!
//! Order is part of the contract: start-URL or tile requests first in
//! generation order, cache-derived place requests last.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{info, warn};
use url::Url;

use placegrid_common::{CrawlRequest, GeoPoint, PlannerError, RequestLabel};

use crate::cache::PlaceCache;
use crate::geo::tiling::make_tile;
use crate::geo::{ResolvedArea, SearchTile};

pub const MAPS_BASE_URL: &str = "https://www.google.com/maps";

/// Search terms with this prefix address one place directly.
pub const PLACE_ID_PREFIX: &str = "place_id:";

/// Query parameters that identify what a start URL points at. Everything
/// else is tracking or view state.
const START_URL_KEPT_PARAMS: &[&str] = &["api", "query", "query_place_id", "cid"];

static MAP_ANCHOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@(-?\d+(?:\.\d+)?),(-?\d+(?:\.\d+)?),(\d+(?:\.\d+)?)z").unwrap()
});

/// Requests in insertion order, first occurrence of each key wins.
#[derive(Default)]
struct RequestList {
    requests: Vec<CrawlRequest>,
    seen: HashSet<String>,
}

impl RequestList {
    fn push(&mut self, request: CrawlRequest) {
        if self.seen.insert(request.unique_key.clone()) {
            self.requests.push(request);
        }
    }
}

fn encode_term(term: &str) -> String {
    url::form_urlencoded::byte_serialize(term.as_bytes()).collect()
}

pub struct RequestBuilder {
    language: Option<String>,
    cache_limit: usize,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            language: None,
            cache_limit: usize::MAX,
        }
    }

    /// Adds `hl=<language>` to every generated URL.
    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language.map(|l| l.trim().to_string()).filter(|l| !l.is_empty());
        self
    }

    /// Upper bound on cache-derived requests.
    pub fn with_cache_limit(mut self, limit: usize) -> Self {
        self.cache_limit = limit;
        self
    }

    fn localized(&self, url: String) -> String {
        match &self.language {
            Some(lang) => {
                let sep = if url.contains('?') { '&' } else { '?' };
                format!("{url}{sep}hl={}", encode_term(lang))
            }
            None => url,
        }
    }

    pub fn build(
        &self,
        start_urls: &[String],
        search_terms: &[String],
        area: Option<&ResolvedArea>,
        tiles: &[SearchTile],
        cache: &PlaceCache,
    ) -> Vec<CrawlRequest> {
        let mut list = RequestList::default();

        if start_urls.iter().any(|u| !u.trim().is_empty()) {
            if !search_terms.is_empty() {
                warn!(
                    ignored_terms = search_terms.len(),
                    "Start URLs given; search terms are ignored"
                );
            }
            for raw in start_urls {
                if let Some(request) = start_url_request(raw) {
                    list.push(request);
                }
            }
            return list.requests;
        }

        let mut searchable: Vec<String> = Vec::new();
        for term in search_terms {
            let trimmed = term.trim();
            if trimmed.is_empty() {
                let err = PlannerError::InvalidSearchTerm(term.clone());
                warn!(error = %err, "Skipping blank search term");
                continue;
            }

            if let Some(place_id) = trimmed.strip_prefix(PLACE_ID_PREFIX) {
                let place_id = place_id.trim();
                if place_id.is_empty() {
                    let err = PlannerError::InvalidSearchTerm(term.clone());
                    warn!(error = %err, "Skipping place_id term with no identifier");
                    continue;
                }
                list.push(self.place_id_request(place_id, trimmed));
                continue;
            }

            if tiles.is_empty() {
                let url = format!("{MAPS_BASE_URL}/search/{}", encode_term(trimmed));
                list.push(self.search_request(url, Some(trimmed), None));
            } else {
                for (rank, tile) in (1u32..).zip(tiles) {
                    let url = format!(
                        "{MAPS_BASE_URL}/search/{}/{}",
                        encode_term(trimmed),
                        tile.anchor()
                    );
                    list.push(
                        self.search_request(url, Some(trimmed), Some(tile.cell.clone()))
                            .with_rank(rank),
                    );
                }
            }
            searchable.push(trimmed.to_string());
        }

        // No terms at all: browse every tile under the no-search budget.
        if search_terms.is_empty() {
            for (rank, tile) in (1u32..).zip(tiles) {
                list.push(
                    self.search_request(tile.base_url(), None, Some(tile.cell.clone()))
                        .with_rank(rank),
                );
            }
        }

        if let Some(area) = area {
            let hits = cache.places_in_polygon(area, self.cache_limit, &searchable);
            if !hits.is_empty() {
                info!(cached = hits.len(), "Adding requests for cached places");
            }
            for hit in hits {
                let url = self.localized(format!(
                    "{MAPS_BASE_URL}/search/?api=1&query={}&query_place_id={}",
                    encode_term(&hit.term),
                    encode_term(&hit.place_id)
                ));
                let key = format!("{}#{}", hit.place_id, hit.term.to_lowercase());
                list.push(
                    CrawlRequest::new(url, key, RequestLabel::Place).with_search_term(Some(hit.term)),
                );
            }
        }

        list.requests
    }

    fn search_request(&self, url: String, term: Option<&str>, tile: Option<String>) -> CrawlRequest {
        let url = self.localized(url);
        CrawlRequest::new(url.clone(), url, RequestLabel::Search)
            .with_search_term(term.map(str::to_string))
            .with_tile(tile)
    }

    fn place_id_request(&self, place_id: &str, term: &str) -> CrawlRequest {
        let url = self.localized(format!(
            "{MAPS_BASE_URL}/search/?api=1&query={}&query_place_id={}",
            encode_term(place_id),
            encode_term(place_id)
        ));
        CrawlRequest::new(url, place_id, RequestLabel::Place).with_search_term(Some(term.to_string()))
    }
}

/// One request for a user-supplied map URL, or `None` if it is not a URL.
pub fn start_url_request(raw: &str) -> Option<CrawlRequest> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let parsed = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(e) => {
            warn!(url = trimmed, error = %e, "Skipping start URL that does not parse");
            return None;
        }
    };

    let label = start_url_label(&parsed);
    let term = search_term_from_path(parsed.path());
    let tile = MAP_ANCHOR.captures(trimmed).and_then(|c| {
        let lat: f64 = c.get(1)?.as_str().parse().ok()?;
        let lng: f64 = c.get(2)?.as_str().parse().ok()?;
        let zoom: f64 = c.get(3)?.as_str().parse().ok()?;
        let point = GeoPoint::new(lat, lng);
        point
            .is_valid()
            .then(|| make_tile(point, zoom.round().clamp(1.0, 21.0) as u8).cell)
    });

    Some(
        CrawlRequest::new(trimmed, normalize_start_url(&parsed), label)
            .with_search_term(term)
            .with_tile(tile),
    )
}

fn start_url_label(url: &Url) -> RequestLabel {
    let has_param = |name: &str| url.query_pairs().any(|(k, _)| k == name);
    if url.path().contains("/maps/place/") || has_param("cid") || has_param("query_place_id") {
        RequestLabel::Place
    } else {
        RequestLabel::Search
    }
}

/// The dedup key for a start URL: fragment, tracking parameters and the
/// trailing `/data=...` blob removed.
pub fn normalize_start_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| START_URL_KEPT_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let path = url.path().to_string();
    let path = match path.find("/data=") {
        Some(i) => &path[..i],
        None => path.as_str(),
    };
    let path = path.trim_end_matches('/').to_string();
    url.set_path(&path);

    url.to_string()
}

/// `/maps/search/<term>/...` carries its search term in the path.
fn search_term_from_path(path: &str) -> Option<String> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    segments.find(|s| *s == "search")?;
    let segment = segments.next()?;
    if segment.starts_with('@') {
        return None;
    }
    let (term, _) = url::form_urlencoded::parse(segment.as_bytes()).next()?;
    let term = term.trim().to_string();
    (!term.is_empty()).then_some(term)
}

/// Log the first `count` requests so a user can check the plan.
pub fn log_preview(requests: &[CrawlRequest], count: usize) {
    info!(total = requests.len(), "Generated crawl requests");
    for (i, request) in requests.iter().take(count).enumerate() {
        info!(
            n = i + 1,
            label = %request.label,
            search = request.search_id(),
            url = request.url.as_str(),
            "Request preview"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{tile, TilingOptions};
    use crate::store::MemoryStateStore;
    use std::sync::Arc;

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn small_area() -> ResolvedArea {
        ResolvedArea::polygon(
            &[
                GeoPoint::new(39.70, -89.75),
                GeoPoint::new(39.70, -89.55),
                GeoPoint::new(39.87, -89.55),
                GeoPoint::new(39.87, -89.75),
            ],
            None,
        )
        .unwrap()
    }

    fn tiles_for(area: &ResolvedArea, zoom: u8) -> Vec<SearchTile> {
        tile(area, zoom, &TilingOptions::default()).collect()
    }

    #[test]
    fn start_urls_disable_search_terms() {
        let requests = RequestBuilder::new().build(
            &strings(&["https://www.google.com/maps/@1,2,3z"]),
            &strings(&["pizza"]),
            None,
            &[],
            &PlaceCache::Disabled,
        );
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].label, RequestLabel::Search);
        assert_eq!(requests[0].unique_key, "https://www.google.com/maps/@1,2,3z");
        assert!(requests[0].search_term.is_none());
        assert!(requests[0].tile.is_some());
    }

    #[test]
    fn place_id_term_bypasses_tiling() {
        let area = small_area();
        let tiles = tiles_for(&area, 14);
        let requests = RequestBuilder::new().build(
            &[],
            &strings(&["place_id:ChIJabc123"]),
            Some(&area),
            &tiles,
            &PlaceCache::Disabled,
        );
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].label, RequestLabel::Place);
        assert_eq!(requests[0].unique_key, "ChIJabc123");
        assert!(requests[0].url.contains("query_place_id=ChIJabc123"));
    }

    #[test]
    fn one_search_per_tile_per_term_in_term_order() {
        let area = small_area();
        let tiles = tiles_for(&area, 14);
        let requests = RequestBuilder::new().build(
            &[],
            &strings(&["pizza", "coffee shop"]),
            Some(&area),
            &tiles,
            &PlaceCache::Disabled,
        );
        assert_eq!(requests.len(), tiles.len() * 2);
        assert!(requests.iter().all(|r| r.label == RequestLabel::Search));
        assert!(requests[..tiles.len()]
            .iter()
            .all(|r| r.search_id() == "pizza"));
        let last = requests.last().unwrap();
        assert_eq!(last.search_id(), "coffee shop");
        assert!(last.url.starts_with("https://www.google.com/maps/search/coffee+shop/@"));
        assert_eq!(last.url, last.unique_key);
        assert_eq!(last.tile.as_deref(), Some(tiles.last().unwrap().cell.as_str()));
    }

    #[test]
    fn tile_searches_are_ranked_in_grid_order() {
        let area = small_area();
        let tiles = tiles_for(&area, 14);
        let requests = RequestBuilder::new().build(
            &[],
            &strings(&["pizza", "place_id:X1"]),
            Some(&area),
            &tiles,
            &PlaceCache::Disabled,
        );
        let ranks: Vec<Option<u32>> = requests[..tiles.len()].iter().map(|r| r.rank).collect();
        let expected: Vec<Option<u32>> = (1..=tiles.len() as u32).map(Some).collect();
        assert_eq!(ranks, expected);
        let place = requests.iter().find(|r| r.label == RequestLabel::Place).unwrap();
        assert_eq!(place.rank, None);
    }

    #[test]
    fn identical_terms_collapse_and_blank_terms_are_skipped() {
        let area = small_area();
        let tiles = tiles_for(&area, 14);
        let requests = RequestBuilder::new().build(
            &[],
            &strings(&["pizza", "  ", " pizza ", ""]),
            Some(&area),
            &tiles,
            &PlaceCache::Disabled,
        );
        assert_eq!(requests.len(), tiles.len());
    }

    #[test]
    fn no_area_means_one_unanchored_search_per_term() {
        let requests = RequestBuilder::new().build(
            &[],
            &strings(&["pizza"]),
            None,
            &[],
            &PlaceCache::Disabled,
        );
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "https://www.google.com/maps/search/pizza");
    }

    #[test]
    fn no_terms_browses_each_tile_without_a_search() {
        let area = small_area();
        let tiles = tiles_for(&area, 14);
        let requests = RequestBuilder::new().build(&[], &[], Some(&area), &tiles, &PlaceCache::Disabled);
        assert_eq!(requests.len(), tiles.len());
        assert!(requests.iter().all(|r| r.search_id() == placegrid_common::NO_SEARCH));
        assert_eq!(requests[0].url, tiles[0].base_url());
    }

    #[tokio::test]
    async fn cached_places_come_after_tile_requests() {
        let area = small_area();
        let tiles = tiles_for(&area, 14);
        let cache = PlaceCache::open(true, Arc::new(MemoryStateStore::new()), "k").await;
        cache.record("P", GeoPoint::new(39.78, -89.65), Some("pizza"));
        cache.record("Q", GeoPoint::new(39.78, -89.65), Some("sushi"));

        let requests = RequestBuilder::new().build(
            &[],
            &strings(&["pizza"]),
            Some(&area),
            &tiles,
            &cache,
        );
        assert_eq!(requests.len(), tiles.len() + 1);
        let last = requests.last().unwrap();
        assert_eq!(last.label, RequestLabel::Place);
        assert_eq!(last.search_id(), "pizza");
        assert!(last.url.contains("query_place_id=P"));
        assert!(requests[..tiles.len()]
            .iter()
            .all(|r| r.label == RequestLabel::Search));
    }

    #[tokio::test]
    async fn cache_limit_bounds_cached_requests() {
        let area = small_area();
        let cache = PlaceCache::open(true, Arc::new(MemoryStateStore::new()), "k").await;
        for i in 0..10 {
            cache.record(&format!("P{i}"), GeoPoint::new(39.78, -89.65), Some("pizza"));
        }
        let requests = RequestBuilder::new().with_cache_limit(4).build(
            &[],
            &strings(&["pizza"]),
            Some(&area),
            &[],
            &cache,
        );
        let cached = requests.iter().filter(|r| r.label == RequestLabel::Place).count();
        assert_eq!(cached, 4);
    }

    #[test]
    fn language_is_appended() {
        let requests = RequestBuilder::new()
            .with_language(Some("de".into()))
            .build(&[], &strings(&["pizza", "place_id:X1"]), None, &[], &PlaceCache::Disabled);
        assert_eq!(requests[0].url, "https://www.google.com/maps/search/pizza?hl=de");
        assert!(requests[1].url.ends_with("&hl=de"));
    }

    #[test]
    fn start_url_noise_is_stripped_from_key() {
        let a = "https://www.google.com/maps/place/Joe's+Pizza/@40.7,-73.9,17z/data=!3m1!4b1?utm_source=x#frag";
        let b = "https://www.google.com/maps/place/Joe's+Pizza/@40.7,-73.9,17z";
        let requests = RequestBuilder::new().build(
            &strings(&[a, b]),
            &[],
            None,
            &[],
            &PlaceCache::Disabled,
        );
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].label, RequestLabel::Place);
        assert_eq!(requests[0].url, a);
    }

    #[test]
    fn search_start_url_carries_its_term() {
        let request =
            start_url_request("https://www.google.com/maps/search/pizza+near+me/@39.8,-89.6,14z").unwrap();
        assert_eq!(request.search_term.as_deref(), Some("pizza near me"));
        assert_eq!(request.label, RequestLabel::Search);
    }

    #[test]
    fn cid_start_url_is_a_place() {
        let request = start_url_request("https://maps.google.com/?cid=12345&hl=en").unwrap();
        assert_eq!(request.label, RequestLabel::Place);
        assert_eq!(request.unique_key, "https://maps.google.com/?cid=12345");
    }

    #[test]
    fn non_url_start_entries_are_skipped() {
        assert!(start_url_request("not a url").is_none());
        assert!(start_url_request("   ").is_none());
    }
}
