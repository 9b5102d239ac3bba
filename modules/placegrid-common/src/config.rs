use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PlannerError, Result};
use crate::types::{AreaDescriptor, GeoPoint, PlaceQuery};

const DEFAULT_NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org/search";

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding persisted run state (plan, budget, cache, emitted keys).
    pub state_dir: PathBuf,
    /// Identity of this run. A restarted process with the same id resumes.
    pub run_id: String,
    pub nominatim_url: String,
    pub user_agent: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            state_dir: env::var("PLACEGRID_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./storage")),
            run_id: env::var("PLACEGRID_RUN_ID").unwrap_or_else(|_| "default".to_string()),
            nominatim_url: env::var("NOMINATIM_URL")
                .unwrap_or_else(|_| DEFAULT_NOMINATIM_URL.to_string()),
            user_agent: env::var("PLACEGRID_USER_AGENT")
                .unwrap_or_else(|_| format!("placegrid/{}", env!("CARGO_PKG_VERSION"))),
        }
    }

    pub fn log_summary(&self) {
        info!(
            state_dir = %self.state_dir.display(),
            run_id = self.run_id.as_str(),
            nominatim_url = self.nominatim_url.as_str(),
            "Config loaded"
        );
    }
}

fn default_concurrency() -> usize {
    10
}
fn default_tile_overlap() -> f64 {
    0.1
}
fn default_viewport_px() -> f64 {
    800.0
}
fn default_tiles_per_result_cap() -> f64 {
    2.0
}
fn default_min_zoom() -> u8 {
    8
}
fn default_max_zoom() -> u8 {
    18
}
fn default_initial_enqueue_batch() -> usize {
    25
}
fn default_enqueue_max_retries() -> u32 {
    3
}
fn default_persist_interval_secs() -> u64 {
    60
}
fn default_preview_count() -> usize {
    10
}

/// Run input, read once at start. Mirrors the JSON a user submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerInput {
    #[serde(default)]
    pub search_terms: Vec<String>,
    #[serde(default)]
    pub start_urls: Vec<String>,

    // Area: at most one of {lat/lng, named place, custom polygon}.
    #[serde(default)]
    pub location_query: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub county: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    /// Ring of `[lng, lat]` pairs, GeoJSON order.
    #[serde(default)]
    pub custom_polygon: Option<Vec<[f64; 2]>>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub radius_km: Option<f64>,
    #[serde(default)]
    pub zoom: Option<u8>,

    // Budget
    #[serde(default)]
    pub max_places_per_search: Option<u64>,
    #[serde(default)]
    pub max_places_total: Option<u64>,

    #[serde(default)]
    pub language: Option<String>,

    // Cache / dedup
    #[serde(default)]
    pub use_cache: bool,
    #[serde(default)]
    pub cache_key: Option<String>,
    #[serde(default)]
    pub cache_place_limit: Option<usize>,
    #[serde(default)]
    pub dedupe_results: bool,

    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,

    // Tuning
    #[serde(default = "default_tile_overlap")]
    pub tile_overlap: f64,
    #[serde(default = "default_viewport_px")]
    pub viewport_px: f64,
    #[serde(default = "default_tiles_per_result_cap")]
    pub tiles_per_result_cap: f64,
    #[serde(default = "default_min_zoom")]
    pub min_zoom: u8,
    #[serde(default = "default_max_zoom")]
    pub max_zoom: u8,
    #[serde(default = "default_initial_enqueue_batch")]
    pub initial_enqueue_batch: usize,
    #[serde(default = "default_enqueue_max_retries")]
    pub enqueue_max_retries: u32,
    #[serde(default = "default_persist_interval_secs")]
    pub persist_interval_secs: u64,
    #[serde(default = "default_preview_count")]
    pub preview_count: usize,
}

impl Default for PlannerInput {
    fn default() -> Self {
        Self {
            search_terms: Vec::new(),
            start_urls: Vec::new(),
            location_query: None,
            country: None,
            state: None,
            county: None,
            city: None,
            postal_code: None,
            custom_polygon: None,
            lat: None,
            lng: None,
            radius_km: None,
            zoom: None,
            max_places_per_search: None,
            max_places_total: None,
            language: None,
            use_cache: false,
            cache_key: None,
            cache_place_limit: None,
            dedupe_results: false,
            max_concurrency: default_concurrency(),
            tile_overlap: default_tile_overlap(),
            viewport_px: default_viewport_px(),
            tiles_per_result_cap: default_tiles_per_result_cap(),
            min_zoom: default_min_zoom(),
            max_zoom: default_max_zoom(),
            initial_enqueue_batch: default_initial_enqueue_batch(),
            enqueue_max_retries: default_enqueue_max_retries(),
            persist_interval_secs: default_persist_interval_secs(),
            preview_count: default_preview_count(),
        }
    }
}

impl PlannerInput {
    pub fn from_json(raw: &str) -> Result<Self> {
        let input: Self = serde_json::from_str(raw)?;
        input.validate()?;
        Ok(input)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..0.9).contains(&self.tile_overlap) {
            return Err(PlannerError::Config(format!(
                "tileOverlap must be in [0, 0.9), got {}",
                self.tile_overlap
            )));
        }
        if self.min_zoom == 0 || self.min_zoom > self.max_zoom || self.max_zoom > 21 {
            return Err(PlannerError::Config(format!(
                "zoom range {}..={} is invalid",
                self.min_zoom, self.max_zoom
            )));
        }
        if self.viewport_px <= 0.0 || self.tiles_per_result_cap <= 0.0 {
            return Err(PlannerError::Config(
                "viewportPx and tilesPerResultCap must be positive".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(PlannerError::Config("maxConcurrency must be at least 1".to_string()));
        }
        Ok(())
    }

    fn place_query(&self) -> PlaceQuery {
        PlaceQuery {
            country: self.country.clone(),
            state: self.state.clone(),
            county: self.county.clone(),
            city: self.city.clone(),
            postal_code: self.postal_code.clone(),
            text: self.location_query.clone(),
        }
    }

    /// Collapse the flat area fields into one descriptor. `Ok(None)` means the
    /// run has no geographic scope.
    pub fn area_descriptor(&self) -> Result<Option<AreaDescriptor>> {
        let query = self.place_query();
        let has_named = !query.is_empty();
        let has_polygon = self.custom_polygon.is_some();
        let has_point = match (self.lat, self.lng) {
            (Some(_), Some(_)) => true,
            (None, None) => false,
            _ => {
                return Err(PlannerError::InvalidArea(
                    "lat and lng must be given together".to_string(),
                ))
            }
        };

        let given = [has_named, has_polygon, has_point].iter().filter(|b| **b).count();
        if given > 1 {
            return Err(PlannerError::InvalidArea(
                "give only one of: coordinates, a named place, or a custom polygon".to_string(),
            ));
        }
        if self.radius_km.is_some() && !has_point {
            return Err(PlannerError::InvalidArea(
                "radiusKm requires lat and lng".to_string(),
            ));
        }

        if has_named {
            return Ok(Some(AreaDescriptor::Named {
                query,
                zoom: self.zoom,
            }));
        }
        if let Some(ring) = &self.custom_polygon {
            return Ok(Some(AreaDescriptor::Polygon {
                vertices: ring.iter().map(|[lng, lat]| GeoPoint::new(*lat, *lng)).collect(),
                zoom: self.zoom,
            }));
        }
        if let (Some(lat), Some(lng)) = (self.lat, self.lng) {
            return Ok(Some(AreaDescriptor::Point {
                center: GeoPoint::new(lat, lng),
                radius_km: self.radius_km,
                zoom: self.zoom,
            }));
        }
        Ok(None)
    }

    /// Key the result cache is stored under. Shared across runs.
    pub fn effective_cache_key(&self) -> String {
        self.cache_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .unwrap_or("default")
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_gets_defaults() {
        let input = PlannerInput::from_json(r#"{"searchTerms": ["pizza"]}"#).unwrap();
        assert_eq!(input.search_terms, vec!["pizza"]);
        assert_eq!(input.max_concurrency, 10);
        assert_eq!(input.preview_count, 10);
        assert!(!input.use_cache);
        assert!(input.area_descriptor().unwrap().is_none());
    }

    #[test]
    fn named_place_and_polygon_conflict() {
        let input = PlannerInput {
            city: Some("Springfield".into()),
            custom_polygon: Some(vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]]),
            ..Default::default()
        };
        let err = input.area_descriptor().unwrap_err();
        assert!(matches!(err, PlannerError::InvalidArea(_)));
    }

    #[test]
    fn polygon_ring_is_read_as_lng_lat() {
        let input = PlannerInput {
            custom_polygon: Some(vec![[-89.7, 39.7], [-89.5, 39.7], [-89.5, 39.9]]),
            ..Default::default()
        };
        match input.area_descriptor().unwrap() {
            Some(AreaDescriptor::Polygon { vertices, .. }) => {
                assert_eq!(vertices[0], GeoPoint::new(39.7, -89.7));
            }
            other => panic!("expected polygon, got {other:?}"),
        }
    }

    #[test]
    fn lone_latitude_is_rejected() {
        let input = PlannerInput {
            lat: Some(40.0),
            ..Default::default()
        };
        assert!(input.area_descriptor().is_err());
    }

    #[test]
    fn bad_tuning_fails_validation() {
        let err = PlannerInput::from_json(r#"{"tileOverlap": 0.95}"#).unwrap_err();
        assert!(matches!(err, PlannerError::Config(_)));
    }

    #[test]
    fn blank_cache_key_falls_back_to_default() {
        let input = PlannerInput {
            cache_key: Some("  ".into()),
            ..Default::default()
        };
        assert_eq!(input.effective_cache_key(), "default");
    }
}
