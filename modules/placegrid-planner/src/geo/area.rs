//! Area resolution: turns a user's area descriptor into a closed polygon (or a
//! point/circle) with a representative center.

use serde::{Deserialize, Serialize};
use tracing::info;

use placegrid_common::{haversine_km, AreaDescriptor, AreaKind, GeoPoint, PlannerError, Result};

use super::geocoder::Geocoder;

const KM_PER_DEG_LAT: f64 = 110.574;
const KM_PER_DEG_LNG_EQUATOR: f64 = 111.320;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Geometry {
    /// Closed ring: the first vertex is repeated at the end.
    Polygon { ring: Vec<GeoPoint> },
    Circle { center: GeoPoint, radius_km: f64 },
    /// A single search anchor with no extent.
    Point { center: GeoPoint },
}

/// Lat/lng bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    pub fn contains(&self, p: GeoPoint) -> bool {
        p.lat >= self.min_lat && p.lat <= self.max_lat && p.lng >= self.min_lng && p.lng <= self.max_lng
    }

    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    /// Point of the box closest to `p`.
    pub fn clamp(&self, p: GeoPoint) -> GeoPoint {
        GeoPoint::new(
            p.lat.clamp(self.min_lat, self.max_lat),
            p.lng.clamp(self.min_lng, self.max_lng),
        )
    }

    /// The four edges, counter-clockwise from the south-west corner.
    pub fn edges(&self) -> [(GeoPoint, GeoPoint); 4] {
        let sw = GeoPoint::new(self.min_lat, self.min_lng);
        let se = GeoPoint::new(self.min_lat, self.max_lng);
        let ne = GeoPoint::new(self.max_lat, self.max_lng);
        let nw = GeoPoint::new(self.max_lat, self.min_lng);
        [(sw, se), (se, ne), (ne, nw), (nw, sw)]
    }
}

/// A descriptor after geocoding and validation. Computed once per run and
/// persisted with the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedArea {
    pub geometry: Geometry,
    pub center: GeoPoint,
    pub kind: AreaKind,
    /// Zoom the user asked for, if any.
    pub zoom: Option<u8>,
}

impl ResolvedArea {
    pub fn polygon(vertices: &[GeoPoint], zoom: Option<u8>) -> Result<Self> {
        let (ring, center) = close_ring(vertices)?;
        Ok(Self {
            geometry: Geometry::Polygon { ring },
            center,
            kind: AreaKind::Polygon,
            zoom,
        })
    }

    /// Whether `p` lies inside the area. A bare point has no extent and
    /// contains nothing.
    pub fn contains(&self, p: GeoPoint) -> bool {
        match &self.geometry {
            Geometry::Polygon { ring } => ring_contains(ring, p),
            Geometry::Circle { center, radius_km } => {
                haversine_km(center.lat, center.lng, p.lat, p.lng) <= *radius_km
            }
            Geometry::Point { .. } => false,
        }
    }

    pub fn bounds(&self) -> Bounds {
        match &self.geometry {
            Geometry::Polygon { ring } => {
                let mut b = Bounds {
                    min_lat: f64::INFINITY,
                    max_lat: f64::NEG_INFINITY,
                    min_lng: f64::INFINITY,
                    max_lng: f64::NEG_INFINITY,
                };
                for p in ring {
                    b.min_lat = b.min_lat.min(p.lat);
                    b.max_lat = b.max_lat.max(p.lat);
                    b.min_lng = b.min_lng.min(p.lng);
                    b.max_lng = b.max_lng.max(p.lng);
                }
                b
            }
            Geometry::Circle { center, radius_km } => {
                let d_lat = radius_km / KM_PER_DEG_LAT;
                let d_lng = radius_km / (KM_PER_DEG_LNG_EQUATOR * center.lat.to_radians().cos().max(0.01));
                Bounds {
                    min_lat: (center.lat - d_lat).max(-90.0),
                    max_lat: (center.lat + d_lat).min(90.0),
                    min_lng: center.lng - d_lng,
                    max_lng: center.lng + d_lng,
                }
            }
            Geometry::Point { center } => Bounds {
                min_lat: center.lat,
                max_lat: center.lat,
                min_lng: center.lng,
                max_lng: center.lng,
            },
        }
    }

    /// Whether any part of the box overlaps the area.
    pub fn intersects(&self, cell: &Bounds) -> bool {
        match &self.geometry {
            Geometry::Polygon { ring } => {
                if ring_contains(ring, cell.center()) {
                    return true;
                }
                if ring.iter().any(|v| cell.contains(*v)) {
                    return true;
                }
                ring.windows(2).any(|edge| {
                    cell.edges()
                        .iter()
                        .any(|(a, b)| segments_intersect(edge[0], edge[1], *a, *b))
                })
            }
            Geometry::Circle { center, radius_km } => {
                let nearest = cell.clamp(*center);
                haversine_km(center.lat, center.lng, nearest.lat, nearest.lng) <= *radius_km
            }
            Geometry::Point { center } => cell.contains(*center),
        }
    }
}

/// Resolve a descriptor. Fails with `InvalidArea` for self-contradictory or
/// unknown areas; geocoder transport failures propagate as `Geocoding`.
pub async fn resolve(descriptor: &AreaDescriptor, geocoder: &dyn Geocoder) -> Result<ResolvedArea> {
    match descriptor {
        AreaDescriptor::Point {
            center,
            radius_km,
            zoom,
        } => resolve_point(*center, *radius_km, *zoom),
        AreaDescriptor::Polygon { vertices, zoom } => ResolvedArea::polygon(vertices, *zoom),
        AreaDescriptor::Named { query, zoom } => {
            if query.is_empty() {
                return Err(PlannerError::InvalidArea("empty place name".to_string()));
            }
            let Some(geometry) = geocoder.locate(query).await? else {
                return Err(PlannerError::InvalidArea(format!(
                    "place not found: {}",
                    query.most_specific().unwrap_or_default()
                )));
            };

            let mut area = match geometry {
                Geometry::Polygon { ring } => ResolvedArea::polygon(&ring, *zoom)?,
                Geometry::Circle { center, radius_km } => {
                    resolve_point(center, Some(radius_km), *zoom)?
                }
                Geometry::Point { center } => resolve_point(center, None, *zoom)?,
            };
            area.kind = query.kind();

            info!(
                place = query.most_specific().unwrap_or_default(),
                kind = ?area.kind,
                lat = area.center.lat,
                lng = area.center.lng,
                "Resolved named place"
            );
            Ok(area)
        }
    }
}

fn resolve_point(center: GeoPoint, radius_km: Option<f64>, zoom: Option<u8>) -> Result<ResolvedArea> {
    if !center.is_valid() {
        return Err(PlannerError::InvalidArea(format!(
            "coordinates out of range: {}, {}",
            center.lat, center.lng
        )));
    }
    let geometry = match radius_km {
        Some(r) if !(r.is_finite() && r > 0.0) => {
            return Err(PlannerError::InvalidArea(format!(
                "radius must be positive, got {r}"
            )))
        }
        Some(radius_km) => Geometry::Circle { center, radius_km },
        None => Geometry::Point { center },
    };
    Ok(ResolvedArea {
        geometry,
        center,
        kind: AreaKind::Point,
        zoom,
    })
}

/// Validate a vertex list and return the closed ring plus its centroid.
fn close_ring(vertices: &[GeoPoint]) -> Result<(Vec<GeoPoint>, GeoPoint)> {
    if let Some(bad) = vertices.iter().find(|v| !v.is_valid()) {
        return Err(PlannerError::InvalidArea(format!(
            "polygon vertex out of range: {}, {}",
            bad.lat, bad.lng
        )));
    }

    let mut ring: Vec<GeoPoint> = Vec::with_capacity(vertices.len() + 1);
    for v in vertices {
        if ring.last() != Some(v) {
            ring.push(*v);
        }
    }
    if ring.len() > 1 && ring.first() == ring.last() {
        ring.pop();
    }
    if ring.len() < 3 {
        return Err(PlannerError::InvalidArea(format!(
            "polygon needs at least 3 distinct vertices, got {}",
            ring.len()
        )));
    }
    ring.push(ring[0]);

    let (area2, cx, cy) = ring.windows(2).fold((0.0, 0.0, 0.0), |(a, cx, cy), w| {
        let cross = w[0].lng * w[1].lat - w[1].lng * w[0].lat;
        (
            a + cross,
            cx + (w[0].lng + w[1].lng) * cross,
            cy + (w[0].lat + w[1].lat) * cross,
        )
    });
    if area2.abs() < 1e-12 {
        return Err(PlannerError::InvalidArea(
            "polygon has zero area (collinear vertices)".to_string(),
        ));
    }
    let center = GeoPoint::new(cy / (3.0 * area2), cx / (3.0 * area2));
    Ok((ring, center))
}

/// Shoelace area in squared degrees. Used to pick the largest ring of a
/// multipolygon.
pub(crate) fn ring_area(ring: &[GeoPoint]) -> f64 {
    ring.windows(2)
        .map(|w| w[0].lng * w[1].lat - w[1].lng * w[0].lat)
        .sum::<f64>()
        .abs()
        / 2.0
}

/// Even-odd ray casting with lng as x and lat as y.
pub(crate) fn ring_contains(ring: &[GeoPoint], p: GeoPoint) -> bool {
    let mut inside = false;
    for w in ring.windows(2) {
        let (a, b) = (w[0], w[1]);
        if (a.lat > p.lat) != (b.lat > p.lat) {
            let x = a.lng + (p.lat - a.lat) / (b.lat - a.lat) * (b.lng - a.lng);
            if p.lng < x {
                inside = !inside;
            }
        }
    }
    inside
}

fn orientation(a: GeoPoint, b: GeoPoint, c: GeoPoint) -> f64 {
    (b.lng - a.lng) * (c.lat - a.lat) - (b.lat - a.lat) * (c.lng - a.lng)
}

fn on_segment(a: GeoPoint, b: GeoPoint, p: GeoPoint) -> bool {
    p.lng >= a.lng.min(b.lng)
        && p.lng <= a.lng.max(b.lng)
        && p.lat >= a.lat.min(b.lat)
        && p.lat <= a.lat.max(b.lat)
}

pub(crate) fn segments_intersect(p1: GeoPoint, p2: GeoPoint, q1: GeoPoint, q2: GeoPoint) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    (d1 == 0.0 && on_segment(q1, q2, p1))
        || (d2 == 0.0 && on_segment(q1, q2, p2))
        || (d3 == 0.0 && on_segment(p1, p2, q1))
        || (d4 == 0.0 && on_segment(p1, p2, q2))
}
