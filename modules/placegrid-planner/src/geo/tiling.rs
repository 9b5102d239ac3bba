//! Grid tiling of a resolved area into map-search anchors.
//!
//! Each tile is the center of one map viewport. The viewport's visible
//! half-width at a zoom level sets the grid spacing; adjacent viewports
//! overlap by `overlap` so the grid leaves no gaps at area edges. Tiles come
//! out row by row, north to south, west to east within a row, so a plan is
//! reproducible across runs.

use serde::{Deserialize, Serialize};
use tracing::debug;

use placegrid_common::{GeoPoint, PlannerInput};

use super::area::{Bounds, Geometry, ResolvedArea};
use crate::requests::MAPS_BASE_URL;

const METERS_PER_PIXEL_Z0: f64 = 156_543.033_92;
const KM_PER_DEG_LAT: f64 = 110.574;
const KM_PER_DEG_LNG_EQUATOR: f64 = 111.320;

/// Tunable tiling parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TilingOptions {
    /// Fraction of a viewport shared with its neighbour, 0.0..0.9.
    pub overlap: f64,
    /// Viewport width in pixels.
    pub viewport_px: f64,
    /// Zoom selection keeps the tile count at or below
    /// `tiles_per_result_cap * per-search cap`.
    pub tiles_per_result_cap: f64,
    pub min_zoom: u8,
    pub max_zoom: u8,
}

impl Default for TilingOptions {
    fn default() -> Self {
        Self {
            overlap: 0.1,
            viewport_px: 800.0,
            tiles_per_result_cap: 2.0,
            min_zoom: 8,
            max_zoom: 18,
        }
    }
}

impl TilingOptions {
    pub fn from_input(input: &PlannerInput) -> Self {
        Self {
            overlap: input.tile_overlap,
            viewport_px: input.viewport_px,
            tiles_per_result_cap: input.tiles_per_result_cap,
            min_zoom: input.min_zoom,
            max_zoom: input.max_zoom,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchTile {
    pub point: GeoPoint,
    pub zoom: u8,
    /// Geohash cell of the tile center.
    pub cell: String,
}

impl SearchTile {
    /// Map viewport URL centered on this tile.
    pub fn base_url(&self) -> String {
        format!("{MAPS_BASE_URL}/{}", self.anchor())
    }

    /// `@lat,lng,zoomz` path segment.
    pub fn anchor(&self) -> String {
        format!("@{:.7},{:.7},{}z", self.point.lat, self.point.lng, self.zoom)
    }
}

/// Half-width in km of the area visible in a viewport at `zoom`.
pub fn visible_radius_km(lat: f64, zoom: u8, viewport_px: f64) -> f64 {
    let meters_per_px = METERS_PER_PIXEL_Z0 * lat.to_radians().cos().max(0.01) / 2f64.powi(zoom as i32);
    meters_per_px * viewport_px / 2.0 / 1000.0
}

/// Distance in km between adjacent tile centers.
pub fn tile_spacing_km(lat: f64, zoom: u8, opts: &TilingOptions) -> f64 {
    2.0 * visible_radius_km(lat, zoom, opts.viewport_px) * (1.0 - opts.overlap)
}

fn cell_precision(zoom: u8) -> usize {
    match zoom {
        0..=8 => 3,
        9..=11 => 4,
        12..=13 => 5,
        14..=15 => 6,
        16..=17 => 7,
        _ => 8,
    }
}

/// Deterministic, finite iterator over the tiles covering an area.
/// `skip(n)` resumes the same sequence after `n` tiles.
pub struct TileGrid<'a> {
    area: &'a ResolvedArea,
    zoom: u8,
    rows: usize,
    cols: usize,
    top_lat: f64,
    left_lng: f64,
    d_lat: f64,
    d_lng: f64,
    next: usize,
}

impl<'a> TileGrid<'a> {
    pub fn new(area: &'a ResolvedArea, zoom: u8, opts: &TilingOptions) -> Self {
        let bounds = area.bounds();
        let mid = bounds.center();
        let spacing = tile_spacing_km(mid.lat, zoom, opts);
        let d_lat = spacing / KM_PER_DEG_LAT;
        let d_lng = spacing / (KM_PER_DEG_LNG_EQUATOR * mid.lat.to_radians().cos().max(0.01));

        let rows = (((bounds.max_lat - bounds.min_lat) / d_lat).ceil() as usize).max(1);
        let cols = (((bounds.max_lng - bounds.min_lng) / d_lng).ceil() as usize).max(1);

        // Center the grid on the bounding box.
        let top_lat = mid.lat + (rows - 1) as f64 * d_lat / 2.0;
        let left_lng = mid.lng - (cols - 1) as f64 * d_lng / 2.0;

        Self {
            area,
            zoom,
            rows,
            cols,
            top_lat,
            left_lng,
            d_lat,
            d_lng,
            next: 0,
        }
    }

    /// Rows times columns of the bounding-box grid; an upper bound on the
    /// number of tiles.
    pub fn grid_size(&self) -> usize {
        self.rows.saturating_mul(self.cols)
    }

    fn cell_at(&self, row: usize, col: usize) -> (GeoPoint, Bounds) {
        let point = GeoPoint::new(
            self.top_lat - row as f64 * self.d_lat,
            self.left_lng + col as f64 * self.d_lng,
        );
        let bounds = Bounds {
            min_lat: point.lat - self.d_lat / 2.0,
            max_lat: point.lat + self.d_lat / 2.0,
            min_lng: point.lng - self.d_lng / 2.0,
            max_lng: point.lng + self.d_lng / 2.0,
        };
        (point, bounds)
    }
}

impl Iterator for TileGrid<'_> {
    type Item = SearchTile;

    fn next(&mut self) -> Option<SearchTile> {
        if let Geometry::Point { center } = &self.area.geometry {
            if self.next > 0 {
                return None;
            }
            self.next = 1;
            return Some(make_tile(*center, self.zoom));
        }

        while self.next < self.grid_size() {
            let (row, col) = (self.next / self.cols, self.next % self.cols);
            self.next += 1;
            let (point, cell) = self.cell_at(row, col);
            if self.area.intersects(&cell) {
                return Some(make_tile(point, self.zoom));
            }
        }
        None
    }
}

pub(crate) fn make_tile(point: GeoPoint, zoom: u8) -> SearchTile {
    let cell = geohash::encode(
        geohash::Coord {
            x: point.lng,
            y: point.lat,
        },
        cell_precision(zoom),
    )
    .unwrap_or_default();
    SearchTile { point, zoom, cell }
}

/// Tile `area` at `zoom`.
pub fn tile<'a>(area: &'a ResolvedArea, zoom: u8, opts: &TilingOptions) -> TileGrid<'a> {
    TileGrid::new(area, zoom, opts)
}

/// Pick the zoom for an area.
///
/// An explicit zoom always wins. Without a per-search cap the area kind's
/// default applies. With a cap, the finest zoom in `min_zoom..=max_zoom`
/// whose tile count stays within `tiles_per_result_cap * cap` is used, and
/// `min_zoom` if even that exceeds the bound.
pub fn choose_zoom(area: &ResolvedArea, per_search_cap: Option<u64>, opts: &TilingOptions) -> u8 {
    if let Some(zoom) = area.zoom {
        return zoom.clamp(1, 21);
    }
    let default_zoom = area.kind.default_zoom().clamp(opts.min_zoom, opts.max_zoom);
    let Some(cap) = per_search_cap else {
        return default_zoom;
    };
    if matches!(area.geometry, Geometry::Point { .. }) {
        return default_zoom;
    }

    let max_tiles = ((cap as f64) * opts.tiles_per_result_cap).ceil().max(1.0) as usize;
    let mut chosen = opts.min_zoom;
    for zoom in opts.min_zoom..=opts.max_zoom {
        let count = tile(area, zoom, opts).take(max_tiles + 1).count();
        debug!(zoom, count, max_tiles, "Zoom candidate");
        if count > max_tiles {
            break;
        }
        chosen = zoom;
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use placegrid_common::AreaKind;

    fn springfield() -> ResolvedArea {
        // Roughly Springfield, IL city limits.
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

    #[test]
    fn tiling_is_deterministic() {
        let area = springfield();
        let opts = TilingOptions::default();
        let a: Vec<_> = tile(&area, 14, &opts).collect();
        let b: Vec<_> = tile(&area, 14, &opts).collect();
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }

    #[test]
    fn tiles_run_north_to_south_then_west_to_east() {
        let area = springfield();
        let tiles: Vec<_> = tile(&area, 14, &TilingOptions::default()).collect();
        for pair in tiles.windows(2) {
            let (a, b) = (&pair[0].point, &pair[1].point);
            assert!(b.lat < a.lat || (b.lat == a.lat && b.lng > a.lng));
        }
    }

    #[test]
    fn grid_covers_every_corner_of_the_polygon() {
        let area = springfield();
        let opts = TilingOptions::default();
        let zoom = 14;
        let tiles: Vec<_> = tile(&area, zoom, &opts).collect();
        let half_km = visible_radius_km(area.center.lat, zoom, opts.viewport_px);
        let corners = [
            GeoPoint::new(39.70, -89.75),
            GeoPoint::new(39.70, -89.55),
            GeoPoint::new(39.87, -89.55),
            GeoPoint::new(39.87, -89.75),
        ];
        for corner in corners {
            let covered = tiles.iter().any(|t| {
                let d_lat_km = (t.point.lat - corner.lat).abs() * KM_PER_DEG_LAT;
                let d_lng_km = (t.point.lng - corner.lng).abs()
                    * KM_PER_DEG_LNG_EQUATOR
                    * corner.lat.to_radians().cos();
                d_lat_km <= half_km && d_lng_km <= half_km
            });
            assert!(covered, "corner {corner:?} not inside any viewport");
        }
    }

    #[test]
    fn finer_zoom_means_more_tiles() {
        let area = springfield();
        let opts = TilingOptions::default();
        let coarse = tile(&area, 12, &opts).count();
        let fine = tile(&area, 15, &opts).count();
        assert!(fine > coarse, "zoom 15 gave {fine}, zoom 12 gave {coarse}");
    }

    #[test]
    fn more_overlap_means_more_tiles() {
        let area = springfield();
        let loose = TilingOptions {
            overlap: 0.0,
            ..Default::default()
        };
        let tight = TilingOptions {
            overlap: 0.5,
            ..Default::default()
        };
        assert!(tile(&area, 15, &tight).count() > tile(&area, 15, &loose).count());
    }

    #[test]
    fn point_area_yields_single_tile() {
        let center = GeoPoint::new(1.0, 2.0);
        let area = ResolvedArea {
            geometry: Geometry::Point { center },
            center,
            kind: AreaKind::Point,
            zoom: Some(3),
        };
        let tiles: Vec<_> = tile(&area, 3, &TilingOptions::default()).collect();
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].base_url(), "https://www.google.com/maps/@1.0000000,2.0000000,3z");
    }

    #[test]
    fn circle_tiles_stay_near_the_circle() {
        let center = GeoPoint::new(45.0, -93.0);
        let area = ResolvedArea {
            geometry: Geometry::Circle {
                center,
                radius_km: 10.0,
            },
            center,
            kind: AreaKind::Point,
            zoom: None,
        };
        let opts = TilingOptions::default();
        let tiles: Vec<_> = tile(&area, 15, &opts).collect();
        assert!(tiles.len() > 1);
        let spacing = tile_spacing_km(center.lat, 15, &opts);
        for t in &tiles {
            let d = placegrid_common::haversine_km(center.lat, center.lng, t.point.lat, t.point.lng);
            assert!(d <= 10.0 + spacing, "tile {d}km from center");
        }
    }

    #[test]
    fn explicit_zoom_wins() {
        let mut area = springfield();
        area.zoom = Some(16);
        assert_eq!(choose_zoom(&area, Some(5), &TilingOptions::default()), 16);
    }

    #[test]
    fn uncapped_search_uses_kind_default() {
        let mut area = springfield();
        area.kind = AreaKind::City;
        assert_eq!(choose_zoom(&area, None, &TilingOptions::default()), 14);
    }

    #[test]
    fn chosen_zoom_keeps_tile_count_within_bound() {
        let area = springfield();
        let opts = TilingOptions::default();
        for cap in [1u64, 5, 50, 500] {
            let zoom = choose_zoom(&area, Some(cap), &opts);
            let count = tile(&area, zoom, &opts).count();
            let bound = (cap as f64 * opts.tiles_per_result_cap).ceil() as usize;
            assert!(
                zoom == opts.min_zoom || count <= bound,
                "cap {cap}: zoom {zoom} gave {count} tiles (bound {bound})"
            );
        }
        let small = choose_zoom(&area, Some(1), &opts);
        let large = choose_zoom(&area, Some(500), &opts);
        assert!(small <= large);
    }

    #[test]
    fn tile_cells_are_geohashes() {
        let area = springfield();
        let first = tile(&area, 14, &TilingOptions::default()).next().unwrap();
        assert_eq!(first.cell.len(), 6);
        assert!(first.cell.starts_with("dp"));
    }
}
