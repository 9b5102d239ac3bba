//! Cross-run cache of discovered places, queried by area and keyword overlap.
//!
//! A warm cache lets a run revisit already-known places inside its area
//! instead of re-searching the whole grid for them.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use placegrid_common::{GeoPoint, PlannerError, Result};

use crate::geo::ResolvedArea;
use crate::store::{load_json, save_json, Persist, StateKeys, StateStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedPlace {
    pub place_id: String,
    pub location: GeoPoint,
    /// Normalized (trimmed, lowercase) search terms the place was found under.
    pub keywords: BTreeSet<String>,
    pub first_seen: DateTime<Utc>,
}

/// A cached place paired with the active search term it matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMatch {
    pub place_id: String,
    pub term: String,
}

fn normalize_keyword(term: &str) -> String {
    term.trim().to_lowercase()
}

/// The result cache. Chosen once at construction; a disabled cache records
/// nothing and never returns hits, so callers never check the flag.
pub enum PlaceCache {
    Enabled(StoredPlaceCache),
    Disabled,
}

impl PlaceCache {
    pub async fn open(enabled: bool, store: Arc<dyn StateStore>, cache_key: &str) -> Self {
        if enabled {
            PlaceCache::Enabled(StoredPlaceCache::load(store, cache_key).await)
        } else {
            PlaceCache::Disabled
        }
    }

    /// Add a discovery, or union `term` into an existing entry's keywords.
    pub fn record(&self, place_id: &str, location: GeoPoint, term: Option<&str>) {
        if let PlaceCache::Enabled(cache) = self {
            cache.record(place_id, location, term);
        }
    }

    /// Cached places inside `area` whose keywords intersect `terms`: one
    /// entry per (place, matching term) pair, in discovery order, at most
    /// `limit` entries.
    pub fn places_in_polygon(&self, area: &ResolvedArea, limit: usize, terms: &[String]) -> Vec<CachedMatch> {
        match self {
            PlaceCache::Enabled(cache) => cache.places_in_polygon(area, limit, terms),
            PlaceCache::Disabled => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PlaceCache::Enabled(cache) => cache.len(),
            PlaceCache::Disabled => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Persist for PlaceCache {
    fn name(&self) -> &'static str {
        "place_cache"
    }

    async fn persist(&self) -> Result<()> {
        match self {
            PlaceCache::Enabled(cache) => cache.persist().await,
            PlaceCache::Disabled => Ok(()),
        }
    }
}

#[derive(Default)]
struct CacheState {
    places: Vec<CachedPlace>,
    index: HashMap<String, usize>,
}

impl CacheState {
    fn from_places(places: Vec<CachedPlace>) -> Self {
        let index = places
            .iter()
            .enumerate()
            .map(|(i, p)| (p.place_id.clone(), i))
            .collect();
        Self { places, index }
    }
}

pub struct StoredPlaceCache {
    store: Arc<dyn StateStore>,
    key: String,
    state: Mutex<CacheState>,
}

impl StoredPlaceCache {
    /// Load the cache. An unreadable blob is a cold start, never an error.
    pub async fn load(store: Arc<dyn StateStore>, cache_key: &str) -> Self {
        let key = StateKeys::cache(cache_key);
        let state = match load_json::<Vec<CachedPlace>>(store.as_ref(), &key).await {
            Ok(Some(places)) => {
                info!(cache_key, places = places.len(), "Loaded place cache");
                CacheState::from_places(places)
            }
            Ok(None) => CacheState::default(),
            Err(e) => {
                let err = PlannerError::CacheUnavailable(e.to_string());
                warn!(cache_key, error = %err, "Starting with an empty place cache");
                CacheState::default()
            }
        };
        Self {
            store,
            key,
            state: Mutex::new(state),
        }
    }

    fn record(&self, place_id: &str, location: GeoPoint, term: Option<&str>) {
        let place_id = place_id.trim();
        if place_id.is_empty() || !location.is_valid() {
            return;
        }
        let keyword = term.map(normalize_keyword).filter(|k| !k.is_empty());

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let existing = state.index.get(place_id).copied();
        if let Some(i) = existing {
            if let Some(keyword) = keyword {
                state.places[i].keywords.insert(keyword);
            }
            return;
        }
        let i = state.places.len();
        state.places.push(CachedPlace {
            place_id: place_id.to_string(),
            location,
            keywords: keyword.into_iter().collect(),
            first_seen: Utc::now(),
        });
        state.index.insert(place_id.to_string(), i);
    }

    fn places_in_polygon(&self, area: &ResolvedArea, limit: usize, terms: &[String]) -> Vec<CachedMatch> {
        let mut wanted: Vec<(String, &str)> = Vec::new();
        for term in terms {
            let key = normalize_keyword(term);
            if !key.is_empty() && !wanted.iter().any(|(k, _)| *k == key) {
                wanted.push((key, term.trim()));
            }
        }

        let mut matches = Vec::new();
        if limit == 0 || wanted.is_empty() {
            return matches;
        }

        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for place in &state.places {
            if !area.contains(place.location) {
                continue;
            }
            for (key, term) in &wanted {
                if place.keywords.contains(key) {
                    matches.push(CachedMatch {
                        place_id: place.place_id.clone(),
                        term: term.to_string(),
                    });
                    if matches.len() >= limit {
                        return matches;
                    }
                }
            }
        }
        matches
    }

    fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).places.len()
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.places.clone()
        };
        save_json(self.store.as_ref(), &self.key, &snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;

    fn square() -> ResolvedArea {
        ResolvedArea::polygon(
            &[
                GeoPoint::new(0.0, 0.0),
                GeoPoint::new(0.0, 1.0),
                GeoPoint::new(1.0, 1.0),
                GeoPoint::new(1.0, 0.0),
            ],
            None,
        )
        .unwrap()
    }

    fn terms(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn enabled(store: &MemoryStateStore) -> PlaceCache {
        PlaceCache::open(true, Arc::new(store.clone()), "test").await
    }

    #[tokio::test]
    async fn filters_by_area_and_keyword() {
        let cache = enabled(&MemoryStateStore::new()).await;
        cache.record("inside-pizza", GeoPoint::new(0.5, 0.5), Some("Pizza"));
        cache.record("inside-coffee", GeoPoint::new(0.2, 0.2), Some("coffee"));
        cache.record("outside-pizza", GeoPoint::new(5.0, 5.0), Some("pizza"));

        let hits = cache.places_in_polygon(&square(), 10, &terms(&["pizza"]));
        assert_eq!(
            hits,
            vec![CachedMatch {
                place_id: "inside-pizza".into(),
                term: "pizza".into()
            }]
        );
    }

    #[tokio::test]
    async fn repeated_discovery_unions_keywords() {
        let cache = enabled(&MemoryStateStore::new()).await;
        cache.record("p1", GeoPoint::new(0.5, 0.5), Some("pizza"));
        cache.record("p1", GeoPoint::new(0.5, 0.5), Some("coffee"));
        assert_eq!(cache.len(), 1);

        let hits = cache.places_in_polygon(&square(), 10, &terms(&["pizza", "coffee"]));
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].term, "pizza");
        assert_eq!(hits[1].term, "coffee");
    }

    #[tokio::test]
    async fn limit_caps_pairs_not_places() {
        let cache = enabled(&MemoryStateStore::new()).await;
        for i in 0..5 {
            cache.record(&format!("p{i}"), GeoPoint::new(0.5, 0.5), Some("pizza"));
            cache.record(&format!("p{i}"), GeoPoint::new(0.5, 0.5), Some("coffee"));
        }
        let hits = cache.places_in_polygon(&square(), 3, &terms(&["pizza", "coffee"]));
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].place_id, "p0");
        assert_eq!(hits[2].place_id, "p1");
        assert!(cache.places_in_polygon(&square(), 0, &terms(&["pizza"])).is_empty());
    }

    #[tokio::test]
    async fn disabled_cache_is_always_empty() {
        let cache = PlaceCache::open(false, Arc::new(MemoryStateStore::new()), "test").await;
        cache.record("p1", GeoPoint::new(0.5, 0.5), Some("pizza"));
        assert!(cache.is_empty());
        assert!(cache.places_in_polygon(&square(), 10, &terms(&["pizza"])).is_empty());
        cache.persist().await.unwrap();
    }

    #[tokio::test]
    async fn persisted_cache_survives_reload() {
        let store = MemoryStateStore::new();
        let cache = enabled(&store).await;
        cache.record("p1", GeoPoint::new(0.5, 0.5), Some("pizza"));
        cache.persist().await.unwrap();
        drop(cache);

        let reloaded = enabled(&store).await;
        let hits = reloaded.places_in_polygon(&square(), 10, &terms(&["pizza"]));
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_cache_falls_back_to_cold_start() {
        let store = MemoryStateStore::new();
        store
            .set(&StateKeys::cache("test"), b"garbage".to_vec())
            .await
            .unwrap();
        let cache = enabled(&store).await;
        assert!(cache.is_empty());
        cache.record("p1", GeoPoint::new(0.5, 0.5), Some("pizza"));
        assert_eq!(cache.len(), 1);
    }
}
