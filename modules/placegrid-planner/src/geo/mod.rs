pub mod area;
pub mod geocoder;
pub mod tiling;

pub use area::{resolve, Bounds, Geometry, ResolvedArea};
pub use geocoder::{geometry_from_nominatim, Geocoder, NominatimGeocoder, StaticGeocoder};
pub use tiling::{choose_zoom, tile, visible_radius_km, SearchTile, TileGrid, TilingOptions};
