//! Turn a run's input into its persisted request list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use placegrid_common::{CrawlRequest, PlannerInput, Result};

use crate::cache::PlaceCache;
use crate::geo::{choose_zoom, resolve, tile, Geocoder, ResolvedArea, SearchTile, TilingOptions};
use crate::requests::{log_preview, RequestBuilder};
use crate::store::{load_json, save_json, StateKeys, StateStore};

/// Everything computed before crawling starts. Persisted so a restarted run
/// picks up the same list instead of regenerating it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedCrawl {
    pub area: Option<ResolvedArea>,
    pub zoom: Option<u8>,
    pub tile_count: usize,
    pub requests: Vec<CrawlRequest>,
    pub created_at: DateTime<Utc>,
}

impl PlannedCrawl {
    /// Distinct logical searches in request order.
    pub fn search_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for request in &self.requests {
            let id = request.search_id();
            if !ids.iter().any(|known| known == id) {
                ids.push(id.to_string());
            }
        }
        ids
    }
}

/// How many cache-derived requests a run may add.
fn cache_limit(input: &PlannerInput) -> usize {
    if let Some(limit) = input.cache_place_limit {
        return limit;
    }
    match input.max_places_per_search {
        Some(cap) => {
            let terms = input.search_terms.len().max(1) as u64;
            usize::try_from(cap.saturating_mul(terms)).unwrap_or(usize::MAX)
        }
        None => usize::MAX,
    }
}

/// Resolve, tile and build. Fails only on an invalid area or a geocoder
/// failure; everything else is logged and skipped.
pub async fn plan(input: &PlannerInput, geocoder: &dyn Geocoder, cache: &PlaceCache) -> Result<PlannedCrawl> {
    let area = match input.area_descriptor()? {
        Some(descriptor) => Some(resolve(&descriptor, geocoder).await?),
        None => None,
    };

    let has_start_urls = input.start_urls.iter().any(|u| !u.trim().is_empty());
    let opts = TilingOptions::from_input(input);
    let (zoom, tiles): (Option<u8>, Vec<SearchTile>) = match &area {
        Some(area) if !has_start_urls => {
            let zoom = choose_zoom(area, input.max_places_per_search, &opts);
            let tiles: Vec<SearchTile> = tile(area, zoom, &opts).collect();
            info!(zoom, tiles = tiles.len(), kind = ?area.kind, "Tiled search area");
            (Some(zoom), tiles)
        }
        _ => (None, Vec::new()),
    };

    let requests = RequestBuilder::new()
        .with_language(input.language.clone())
        .with_cache_limit(cache_limit(input))
        .build(&input.start_urls, &input.search_terms, area.as_ref(), &tiles, cache);

    if requests.is_empty() {
        warn!("Plan produced no requests; check searchTerms, startUrls and the area");
    }

    Ok(PlannedCrawl {
        area,
        zoom,
        tile_count: tiles.len(),
        requests,
        created_at: Utc::now(),
    })
}

/// Reuse the persisted plan for `run_id` if there is one, otherwise plan and
/// persist. An unreadable stored plan is regenerated.
pub async fn load_or_plan(
    store: &dyn StateStore,
    run_id: &str,
    input: &PlannerInput,
    geocoder: &dyn Geocoder,
    cache: &PlaceCache,
) -> Result<PlannedCrawl> {
    let key = StateKeys::plan(run_id);
    match load_json::<PlannedCrawl>(store, &key).await {
        Ok(Some(planned)) => {
            warn!(
                run_id,
                requests = planned.requests.len(),
                created_at = %planned.created_at,
                "Request list found from previous run, skipping generation"
            );
            return Ok(planned);
        }
        Ok(None) => {}
        Err(e) => {
            warn!(run_id, error = %e, "Stored plan unreadable, generating a new one");
        }
    }

    let planned = plan(input, geocoder, cache).await?;
    log_preview(&planned.requests, input.preview_count);
    save_json(store, &key, &planned).await?;
    Ok(planned)
}
