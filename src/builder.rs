//! Route assembly from an external workout record and its coordinate samples.

use log::debug;

use crate::geo_utils::estimate_distance_km;
use crate::types::MIN_ROUTE_POINTS;
use crate::{GpsPoint, Route, RouteColor, WorkoutRecord};

/// Build a route from a record and its sample batches.
///
/// Batches are flattened in batch order, then in-batch order. Returns `None`
/// when fewer than two coordinates remain: an unrenderable record is dropped,
/// not reported as an error.
pub fn build_route(
    record: &WorkoutRecord,
    batches: &[Vec<GpsPoint>],
    color: RouteColor,
) -> Option<Route> {
    let coordinates = flatten_batches(batches);

    if coordinates.len() < MIN_ROUTE_POINTS {
        debug!(
            "[RouteBuilder] Dropping workout {}: {} coordinate(s)",
            record.external_id,
            coordinates.len()
        );
        return None;
    }

    let distance_km = resolve_distance_km(record.distance_meters, &coordinates);

    Some(Route::with_external_id(
        Some(record.external_id.clone()),
        record.activity_kind.label(),
        distance_km,
        Some(record.start_time),
        coordinates,
        color,
    ))
}

/// Concatenate sample batches, preserving batch order then in-batch order.
pub fn flatten_batches(batches: &[Vec<GpsPoint>]) -> Vec<GpsPoint> {
    let total: usize = batches.iter().map(Vec::len).sum();
    let mut coordinates = Vec::with_capacity(total);
    for batch in batches {
        coordinates.extend_from_slice(batch);
    }
    coordinates
}

/// Authoritative distance when usable, otherwise the great-circle estimate.
pub fn resolve_distance_km(distance_meters: Option<f64>, coordinates: &[GpsPoint]) -> f64 {
    match distance_meters {
        Some(meters) if meters.is_finite() && meters >= 0.0 => meters / 1000.0,
        _ => estimate_distance_km(coordinates),
    }
}
