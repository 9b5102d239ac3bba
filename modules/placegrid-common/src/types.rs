use serde::{Deserialize, Serialize};

// --- Geography ---

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// True when the coordinates are inside the valid WGS84 range.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Haversine great-circle distance between two lat/lng points in kilometers.
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let lat1_r = lat1.to_radians();
    let lat2_r = lat2.to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1_r.cos() * lat2_r.cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_KM * c
}

/// Named-place lookup. Every field is optional; the most specific one wins
/// when a gazetteer needs a single key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceQuery {
    pub country: Option<String>,
    pub state: Option<String>,
    pub county: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    /// Free-text location ("Springfield, IL").
    pub text: Option<String>,
}

impl PlaceQuery {
    pub fn free_text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Default::default()
        }
    }

    pub fn city(city: &str) -> Self {
        Self {
            city: Some(city.to_string()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        [
            &self.country,
            &self.state,
            &self.county,
            &self.city,
            &self.postal_code,
            &self.text,
        ]
        .iter()
        .all(|f| f.as_deref().map(str::trim).unwrap_or("").is_empty())
    }

    /// Kind of the most specific field that is set.
    pub fn kind(&self) -> AreaKind {
        let set = |f: &Option<String>| f.as_deref().is_some_and(|s| !s.trim().is_empty());
        if set(&self.postal_code) {
            AreaKind::PostalCode
        } else if set(&self.city) {
            AreaKind::City
        } else if set(&self.county) {
            AreaKind::County
        } else if set(&self.state) {
            AreaKind::State
        } else if set(&self.country) {
            AreaKind::Country
        } else {
            AreaKind::FreeText
        }
    }

    /// The most specific non-empty field, trimmed.
    pub fn most_specific(&self) -> Option<&str> {
        [
            &self.postal_code,
            &self.city,
            &self.county,
            &self.state,
            &self.country,
            &self.text,
        ]
        .into_iter()
        .filter_map(|f| f.as_deref().map(str::trim))
        .find(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AreaKind {
    Country,
    State,
    County,
    City,
    PostalCode,
    FreeText,
    Polygon,
    Point,
}

impl AreaKind {
    /// Zoom used when neither the user nor a result cap picks one.
    pub fn default_zoom(&self) -> u8 {
        match self {
            AreaKind::Country => 10,
            AreaKind::State => 11,
            AreaKind::County => 12,
            AreaKind::City => 14,
            AreaKind::PostalCode => 15,
            AreaKind::FreeText | AreaKind::Polygon | AreaKind::Point => 14,
        }
    }
}

/// User-supplied description of the region to search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AreaDescriptor {
    /// Explicit center, optionally with a radius. No radius means a single
    /// search anchored at the center.
    Point {
        center: GeoPoint,
        radius_km: Option<f64>,
        zoom: Option<u8>,
    },
    Named {
        query: PlaceQuery,
        zoom: Option<u8>,
    },
    Polygon {
        vertices: Vec<GeoPoint>,
        zoom: Option<u8>,
    },
}

// --- Crawl requests ---

/// Logical search id for requests that carry no search term (all-places mode).
pub const NO_SEARCH: &str = "__no_search__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestLabel {
    /// A map search results listing.
    Search,
    /// A place page addressed directly (place id, place URL, cached place).
    Place,
    /// A place detail page discovered from a search listing.
    Detail,
}

impl std::fmt::Display for RequestLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestLabel::Search => write!(f, "SEARCH"),
            RequestLabel::Place => write!(f, "PLACE"),
            RequestLabel::Detail => write!(f, "DETAIL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlRequest {
    pub url: String,
    /// Two requests with the same key are the same unit of work.
    pub unique_key: String,
    pub label: RequestLabel,
    pub search_term: Option<String>,
    /// 1-based position of the anchoring tile in grid order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
    /// Geohash cell of the search tile this request is anchored on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile: Option<String>,
}

impl CrawlRequest {
    pub fn new(url: impl Into<String>, unique_key: impl Into<String>, label: RequestLabel) -> Self {
        Self {
            url: url.into(),
            unique_key: unique_key.into(),
            label,
            search_term: None,
            rank: None,
            tile: None,
        }
    }

    pub fn with_search_term(mut self, term: Option<String>) -> Self {
        self.search_term = term;
        self
    }

    pub fn with_rank(mut self, rank: u32) -> Self {
        self.rank = Some(rank);
        self
    }

    pub fn with_tile(mut self, tile: Option<String>) -> Self {
        self.tile = tile;
        self
    }

    /// The logical search this request is budgeted under.
    pub fn search_id(&self) -> &str {
        self.search_term.as_deref().unwrap_or(NO_SEARCH)
    }
}

/// A place extracted by the page crawler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceResult {
    pub place_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

impl PlaceResult {
    pub fn new(place_id: impl Into<String>) -> Self {
        Self {
            place_id: place_id.into(),
            title: None,
            location: None,
            url: None,
            extra: serde_json::Value::Null,
        }
    }

    pub fn at(mut self, lat: f64, lng: f64) -> Self {
        self.location = Some(GeoPoint::new(lat, lng));
        self
    }

    pub fn titled(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }
}
