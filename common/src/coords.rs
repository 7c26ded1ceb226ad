use std::f64::consts::PI;

/// Spherical Mercator earth radius (meters), as used by web mapping
/// stacks for the projection itself.
const MERCATOR_RADIUS_M: f64 = 6_378_137.0;

/// Half the projected world width: the x/y shift that moves the
/// Mercator origin to the top-left corner.
const ORIGIN_SHIFT_M: f64 = PI * MERCATOR_RADIUS_M;

/// Tile edge length in projected meters.
const TILE_METERS: f64 = 10.0;

/// Latitude limit of the Mercator projection.
const MAX_MERCATOR_LAT: f64 = 85.051_128_78;

/// Mean earth radius (meters) for great-circle distances. Deliberately
/// not the Mercator radius.
const HAVERSINE_RADIUS_M: f64 = 6_371_000.0;

/// Convert WGS84 lat/lon to integer tile coordinates on the 10 m grid.
/// The grid origin is the top-left of the projected world; y grows
/// southward.
pub fn lat_lon_to_tile(lat: f64, lon: f64) -> (i64, i64) {
    let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
    let mx = lon * ORIGIN_SHIFT_M / 180.0;
    let my = ((90.0 + lat) * PI / 360.0).tan().ln() * MERCATOR_RADIUS_M;
    let x = ((mx + ORIGIN_SHIFT_M) / TILE_METERS).floor() as i64;
    let y = ((ORIGIN_SHIFT_M - my) / TILE_METERS).floor() as i64;
    (x, y)
}

/// Chunk containing a tile. Arithmetic shift keeps negative tiles in
/// negative chunks.
pub fn chunk_of(x: i64, y: i64) -> (i64, i64) {
    (x >> 8, y >> 8)
}

/// Offset of a tile within its chunk, row-major over the low bytes.
pub fn offset_of(x: i64, y: i64) -> u16 {
    (((y & 255) << 8) | (x & 255)) as u16
}

/// Tile addressed by a chunk and an in-chunk offset. Inverse of
/// `chunk_of` + `offset_of`.
pub fn tile_of(cx: i64, cy: i64, o: u16) -> (i64, i64) {
    (cx * 256 + (o & 255) as i64, cy * 256 + (o >> 8) as i64)
}

/// Lat/lon of a tile's center, by inverse Mercator of the tile's
/// center point in projected meters.
pub fn tile_center_lat_lon(x: i64, y: i64) -> (f64, f64) {
    let mx = (x as f64 + 0.5) * TILE_METERS - ORIGIN_SHIFT_M;
    let my = ORIGIN_SHIFT_M - (y as f64 + 0.5) * TILE_METERS;
    let lon = mx * 180.0 / ORIGIN_SHIFT_M;
    let lat = 2.0 * (my / MERCATOR_RADIUS_M).exp().atan() * 180.0 / PI - 90.0;
    (lat, lon)
}

/// Great-circle distance between two lat/lon points, in meters.
pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    HAVERSINE_RADIUS_M * c
}
