//! # Geographic Utilities
//!
//! Distance and bounds helpers for route coordinates.
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two GPS points (meters) |
//! | [`polyline_length`] | Total length of a coordinate path (meters) |
//! | [`estimate_distance_km`] | Path length in kilometers, used when a record has no distance |
//! | [`compute_bounds`] | Bounding box of a coordinate path |
//!
//! ## Haversine Formula
//!
//! Distances are computed on a spherical Earth using `geo`'s Haversine metric
//! (mean radius 6,371,008.8 m). One degree of longitude at the equator is
//! therefore ~111.195 km.

use geo::{Distance, Haversine, Point};

use crate::{Bounds, GpsPoint};

/// Great-circle distance between two GPS points, in meters.
///
/// ```rust
/// use route_sync::{GpsPoint, geo_utils};
///
/// let london = GpsPoint::new(51.5074, -0.1278);
/// let paris = GpsPoint::new(48.8566, 2.3522);
///
/// let distance = geo_utils::haversine_distance(&london, &paris);
/// assert!((distance - 343_560.0).abs() < 1000.0);
/// ```
#[inline]
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Total length of a path in meters, summing consecutive segments.
///
/// Empty or single-point paths return 0.0.
pub fn polyline_length(points: &[GpsPoint]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    points
        .windows(2)
        .map(|pair| haversine_distance(&pair[0], &pair[1]))
        .sum()
}

/// Estimated path length in kilometers.
///
/// Only used when the source did not provide an authoritative distance.
pub fn estimate_distance_km(points: &[GpsPoint]) -> f64 {
    polyline_length(points) / 1000.0
}

/// Bounding box of a path, `None` when the path is empty.
pub fn compute_bounds(points: &[GpsPoint]) -> Option<Bounds> {
    Bounds::from_points(points)
}
