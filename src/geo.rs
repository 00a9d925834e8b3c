//! Geodesic helpers used to weight cells by ground area.
//!
//! Latitude distances go through the Mercator y coordinate, longitude
//! distances are treated as locally flat. Both are approximations that hold
//! for the small extents of a single grid cell.

use std::f64::consts::PI;

pub const EARTH_RADIUS_KM: f64 = 6378.137;
pub const DEG_TO_RAD: f64 = PI / 180.0;
pub const DEG_TO_HALF_RAD: f64 = PI / 360.0;
pub const DEG_TO_KM: f64 = DEG_TO_RAD * EARTH_RADIUS_KM;

/// Mercator y of a latitude in degrees. Undefined at exactly ±90.
pub fn latitude_to_mercator_y(lat: f64) -> f64 {
    ((90.0 + lat) * DEG_TO_HALF_RAD).tan().ln()
}

/// Signed north-south distance in kilometres from `lat1` to `lat2`.
pub fn distance_between_latitudes(lat1: f64, lat2: f64) -> f64 {
    (latitude_to_mercator_y(lat2) - latitude_to_mercator_y(lat1)) * EARTH_RADIUS_KM
}

/// Signed east-west distance in kilometres from `lon1` to `lon2`.
pub fn distance_between_longitudes(lon1: f64, lon2: f64) -> f64 {
    (lon2 - lon1) * DEG_TO_KM
}

pub fn meters_to_degrees_longitude(meters: f64) -> f64 {
    meters / DEG_TO_KM * 0.001
}

/// Area of a lat/lon box in square kilometres (always positive).
pub fn area_in_sq_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dx = distance_between_longitudes(lon1, lon2);
    let dy = distance_between_latitudes(lat1, lat2);
    (dx * dy).abs()
}
