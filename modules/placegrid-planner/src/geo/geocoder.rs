use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use placegrid_common::{haversine_km, GeoPoint, PlaceQuery, PlannerError, Result};

use super::area::{ring_area, Geometry};

/// Resolves a named place to its geometry. `Ok(None)` means "no such place".
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn locate(&self, query: &PlaceQuery) -> Result<Option<Geometry>>;
}

// ---------------------------------------------------------------------------
// StaticGeocoder (in-memory gazetteer)
// ---------------------------------------------------------------------------

/// One gazetteer row. Either `polygon` (`[[lng, lat], ...]`) or `lat`/`lng`
/// with an optional `radiusKm`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GazetteerEntry {
    pub name: String,
    #[serde(default)]
    pub polygon: Option<Vec<[f64; 2]>>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub radius_km: Option<f64>,
}

/// Case-insensitive lookup on the query's most specific field, then on its
/// free text.
#[derive(Debug, Default, Clone)]
pub struct StaticGeocoder {
    places: HashMap<String, Geometry>,
}

impl StaticGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_place(mut self, name: &str, geometry: Geometry) -> Self {
        self.places.insert(name.trim().to_lowercase(), geometry);
        self
    }

    pub fn from_entries(entries: Vec<GazetteerEntry>) -> Result<Self> {
        let mut geocoder = Self::new();
        for entry in entries {
            let geometry = match (entry.polygon, entry.lat, entry.lng) {
                (Some(ring), _, _) => Geometry::Polygon {
                    ring: ring.iter().map(|[lng, lat]| GeoPoint::new(*lat, *lng)).collect(),
                },
                (None, Some(lat), Some(lng)) => match entry.radius_km {
                    Some(radius_km) => Geometry::Circle {
                        center: GeoPoint::new(lat, lng),
                        radius_km,
                    },
                    None => Geometry::Point {
                        center: GeoPoint::new(lat, lng),
                    },
                },
                _ => {
                    return Err(PlannerError::Config(format!(
                        "gazetteer entry {:?} has neither polygon nor lat/lng",
                        entry.name
                    )))
                }
            };
            geocoder = geocoder.with_place(&entry.name, geometry);
        }
        Ok(geocoder)
    }

    pub async fn from_json_file(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let entries: Vec<GazetteerEntry> = serde_json::from_str(&raw)?;
        let geocoder = Self::from_entries(entries)?;
        info!(path = %path.display(), places = geocoder.places.len(), "Loaded gazetteer");
        Ok(geocoder)
    }
}

#[async_trait]
impl Geocoder for StaticGeocoder {
    async fn locate(&self, query: &PlaceQuery) -> Result<Option<Geometry>> {
        let candidates = [query.most_specific(), query.text.as_deref()];
        Ok(candidates
            .into_iter()
            .flatten()
            .find_map(|name| self.places.get(&name.trim().to_lowercase()))
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// NominatimGeocoder (OpenStreetMap search API)
// ---------------------------------------------------------------------------

/// The subset of a Nominatim search hit we read.
#[derive(Debug, Clone, Deserialize)]
pub struct NominatimPlace {
    pub lat: String,
    pub lon: String,
    /// `[min_lat, max_lat, min_lon, max_lon]` as strings.
    #[serde(default)]
    pub boundingbox: Option<Vec<String>>,
    #[serde(default)]
    pub geojson: Option<Value>,
    #[serde(default)]
    pub display_name: Option<String>,
}

pub struct NominatimGeocoder {
    client: reqwest::Client,
    base_url: String,
    user_agent: String,
}

impl NominatimGeocoder {
    pub fn new(base_url: &str, user_agent: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.to_string(),
            user_agent: user_agent.to_string(),
        }
    }

    fn params(query: &PlaceQuery) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("format", "json".to_string()),
            ("polygon_geojson", "1".to_string()),
            ("limit", "1".to_string()),
        ];
        // Nominatim rejects `q` combined with structured fields.
        if let Some(text) = query.text.as_deref().filter(|t| !t.trim().is_empty()) {
            params.push(("q", text.trim().to_string()));
            return params;
        }
        let structured = [
            ("country", &query.country),
            ("state", &query.state),
            ("county", &query.county),
            ("city", &query.city),
            ("postalcode", &query.postal_code),
        ];
        for (key, value) in structured {
            if let Some(v) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                params.push((key, v.to_string()));
            }
        }
        params
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn locate(&self, query: &PlaceQuery) -> Result<Option<Geometry>> {
        let resp = self
            .client
            .get(&self.base_url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .query(&Self::params(query))
            .send()
            .await
            .map_err(|e| PlannerError::Geocoding(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PlannerError::Geocoding(format!("HTTP {status}: {body}")));
        }

        let places: Vec<NominatimPlace> = resp
            .json()
            .await
            .map_err(|e| PlannerError::Geocoding(e.to_string()))?;
        let Some(place) = places.first() else {
            return Ok(None);
        };
        debug!(name = place.display_name.as_deref().unwrap_or(""), "Nominatim hit");
        Ok(geometry_from_nominatim(place))
    }
}

fn ring_from_json(value: &Value) -> Option<Vec<GeoPoint>> {
    value
        .as_array()?
        .iter()
        .map(|pair| {
            let pair = pair.as_array()?;
            Some(GeoPoint::new(pair.get(1)?.as_f64()?, pair.first()?.as_f64()?))
        })
        .collect()
}

/// Convert a Nominatim hit to a geometry. Polygons use their outer ring,
/// multipolygons their largest outer ring, and points get a radius reaching
/// the bounding box corner.
pub fn geometry_from_nominatim(place: &NominatimPlace) -> Option<Geometry> {
    if let Some(geojson) = &place.geojson {
        let coords = geojson.get("coordinates");
        match geojson.get("type").and_then(Value::as_str) {
            Some("Polygon") => {
                let ring = ring_from_json(coords?.as_array()?.first()?)?;
                return Some(Geometry::Polygon { ring });
            }
            Some("MultiPolygon") => {
                let ring = coords?
                    .as_array()?
                    .iter()
                    .filter_map(|poly| ring_from_json(poly.as_array()?.first()?))
                    .max_by(|a, b| ring_area(a).total_cmp(&ring_area(b)))?;
                return Some(Geometry::Polygon { ring });
            }
            _ => {}
        }
    }

    let center = GeoPoint::new(place.lat.parse().ok()?, place.lon.parse().ok()?);
    let corner = place.boundingbox.as_ref().and_then(|bb| {
        let nums: Vec<f64> = bb.iter().filter_map(|s| s.parse().ok()).collect();
        (nums.len() == 4).then(|| GeoPoint::new(nums[1], nums[3]))
    });
    match corner {
        Some(corner) => {
            let radius_km = haversine_km(center.lat, center.lng, corner.lat, corner.lng);
            if radius_km > 0.0 {
                Some(Geometry::Circle { center, radius_km })
            } else {
                Some(Geometry::Point { center })
            }
        }
        None => Some(Geometry::Point { center }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hit(geojson: Option<Value>, bbox: Option<[&str; 4]>) -> NominatimPlace {
        NominatimPlace {
            lat: "39.8".to_string(),
            lon: "-89.65".to_string(),
            boundingbox: bbox.map(|b| b.iter().map(|s| s.to_string()).collect()),
            geojson,
            display_name: Some("Springfield".to_string()),
        }
    }

    #[test]
    fn polygon_hit_uses_outer_ring() {
        let place = hit(
            Some(json!({
                "type": "Polygon",
                "coordinates": [[[-89.7, 39.7], [-89.6, 39.7], [-89.6, 39.9], [-89.7, 39.7]]]
            })),
            None,
        );
        let Some(Geometry::Polygon { ring }) = geometry_from_nominatim(&place) else {
            panic!("expected polygon");
        };
        assert_eq!(ring.len(), 4);
        assert_eq!(ring[0], GeoPoint::new(39.7, -89.7));
    }

    #[test]
    fn multipolygon_hit_uses_largest_ring() {
        let place = hit(
            Some(json!({
                "type": "MultiPolygon",
                "coordinates": [
                    [[[0.0, 0.0], [0.1, 0.0], [0.1, 0.1], [0.0, 0.0]]],
                    [[[5.0, 5.0], [7.0, 5.0], [7.0, 7.0], [5.0, 5.0]]]
                ]
            })),
            None,
        );
        let Some(Geometry::Polygon { ring }) = geometry_from_nominatim(&place) else {
            panic!("expected polygon");
        };
        assert_eq!(ring[0], GeoPoint::new(5.0, 5.0));
    }

    #[test]
    fn point_hit_gets_radius_from_bounding_box() {
        let place = hit(
            Some(json!({"type": "Point", "coordinates": [-89.65, 39.8]})),
            Some(["39.7", "39.9", "-89.75", "-89.55"]),
        );
        match geometry_from_nominatim(&place) {
            Some(Geometry::Circle { radius_km, .. }) => assert!(radius_km > 10.0 && radius_km < 20.0),
            other => panic!("expected circle, got {other:?}"),
        }
    }

    #[test]
    fn structured_query_params_skip_blank_fields() {
        let query = PlaceQuery {
            country: Some("US".into()),
            city: Some("Springfield".into()),
            state: Some(" ".into()),
            ..Default::default()
        };
        let params = NominatimGeocoder::params(&query);
        assert!(params.contains(&("city", "Springfield".to_string())));
        assert!(params.contains(&("country", "US".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "state"));
        assert!(!params.iter().any(|(k, _)| *k == "q"));
    }

    #[tokio::test]
    async fn static_geocoder_is_case_insensitive() {
        let geocoder = StaticGeocoder::from_entries(vec![GazetteerEntry {
            name: "Springfield".into(),
            polygon: None,
            lat: Some(39.8),
            lng: Some(-89.65),
            radius_km: Some(8.0),
        }])
        .unwrap();
        let found = geocoder.locate(&PlaceQuery::city("SPRINGFIELD")).await.unwrap();
        assert!(matches!(found, Some(Geometry::Circle { .. })));
        let missing = geocoder.locate(&PlaceQuery::city("Shelbyville")).await.unwrap();
        assert!(missing.is_none());
    }
}
