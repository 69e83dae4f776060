//! Routes, viewport regions, external workout records and the cached document.
//!
//! Field names on the serialized types follow the on-disk document:
//!
//! ```text
//! { "routes": [ { "id", "externalId"?, "name", "distanceInKilometers", "startDate"?,
//!                 "coordinates": [{"latitude","longitude"}...], "color" } ... ],
//!   "cameraRegion"?: { "centerLatitude","centerLongitude","spanLatitudeDelta","spanLongitudeDelta" } }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::{Bounds, GpsPoint, RouteColor};

/// Minimum number of coordinates for a route to be renderable.
pub const MIN_ROUTE_POINTS: usize = 2;

// ============================================================================
// Route
// ============================================================================

/// A rendered workout path.
///
/// Routes are immutable once built: the coordinate sequence is shared behind an
/// `Arc<[GpsPoint]>` and there are no mutating accessors. Updating a route means
/// replacing the collection entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    id: String,
    #[serde(rename = "externalId", default, skip_serializing_if = "Option::is_none")]
    external_id: Option<String>,
    name: String,
    #[serde(rename = "distanceInKilometers", deserialize_with = "non_negative_km")]
    distance_km: f64,
    #[serde(rename = "startDate", default, skip_serializing_if = "Option::is_none")]
    start_time: Option<DateTime<Utc>>,
    coordinates: Arc<[GpsPoint]>,
    color: RouteColor,
}

impl Route {
    /// Create a route with a fresh id and no external identifier
    /// (sample or synthetic data).
    pub fn new(
        name: impl Into<String>,
        distance_km: f64,
        start_time: Option<DateTime<Utc>>,
        coordinates: Vec<GpsPoint>,
        color: RouteColor,
    ) -> Self {
        Self::with_external_id(None, name, distance_km, start_time, coordinates, color)
    }

    pub(crate) fn with_external_id(
        external_id: Option<String>,
        name: impl Into<String>,
        distance_km: f64,
        start_time: Option<DateTime<Utc>>,
        coordinates: Vec<GpsPoint>,
        color: RouteColor,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            external_id,
            name: name.into(),
            distance_km: distance_km.max(0.0),
            start_time,
            coordinates: coordinates.into(),
            color,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Identifier of the source workout, used as the deduplication key.
    pub fn external_id(&self) -> Option<&str> {
        self.external_id.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn distance_km(&self) -> f64 {
        self.distance_km
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    /// Path coordinates in path order.
    pub fn coordinates(&self) -> &[GpsPoint] {
        &self.coordinates
    }

    pub fn color(&self) -> RouteColor {
        self.color
    }

    /// Whether the route has enough points to draw a polyline.
    pub fn is_renderable(&self) -> bool {
        self.coordinates.len() >= MIN_ROUTE_POINTS
    }

    pub fn bounds(&self) -> Option<Bounds> {
        Bounds::from_points(&self.coordinates)
    }
}

/// Cached distances go through the same clamp as freshly built routes.
fn non_negative_km<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let km = f64::deserialize(deserializer)?;
    Ok(if km.is_finite() && km >= 0.0 { km } else { 0.0 })
}

// ============================================================================
// Viewport
// ============================================================================

/// Persisted map region: center plus latitude/longitude span in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportRegion {
    #[serde(rename = "centerLatitude")]
    pub center_lat: f64,
    #[serde(rename = "centerLongitude")]
    pub center_lon: f64,
    #[serde(rename = "spanLatitudeDelta")]
    pub span_lat: f64,
    #[serde(rename = "spanLongitudeDelta")]
    pub span_lon: f64,
}

/// Padding applied around fitted routes.
const FIT_PADDING: f64 = 1.3;
/// Smallest span produced by [`ViewportRegion::fitting`], in degrees.
const MIN_FIT_SPAN: f64 = 0.005;

impl ViewportRegion {
    pub fn new(center_lat: f64, center_lon: f64, span_lat: f64, span_lon: f64) -> Self {
        Self {
            center_lat,
            center_lon,
            span_lat,
            span_lon,
        }
    }

    /// Padded region enclosing every renderable route.
    ///
    /// Returns `None` when there is nothing to fit.
    pub fn fitting(routes: &[Route]) -> Option<Self> {
        let bounds = routes
            .iter()
            .filter(|r| r.is_renderable())
            .filter_map(Route::bounds)
            .reduce(|acc, b| acc.union(&b))?;

        let center = bounds.center();
        Some(Self {
            center_lat: center.latitude,
            center_lon: center.longitude,
            span_lat: ((bounds.max_lat - bounds.min_lat) * FIT_PADDING).clamp(MIN_FIT_SPAN, 180.0),
            span_lon: ((bounds.max_lng - bounds.min_lng) * FIT_PADDING).clamp(MIN_FIT_SPAN, 360.0),
        })
    }
}

// ============================================================================
// Cached Document
// ============================================================================

/// The durable unit of the route cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachedDocument {
    pub routes: Vec<Route>,
    #[serde(rename = "cameraRegion", default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<ViewportRegion>,
}

impl CachedDocument {
    pub fn new(routes: Vec<Route>, viewport: Option<ViewportRegion>) -> Self {
        Self { routes, viewport }
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty() && self.viewport.is_none()
    }
}

// ============================================================================
// External Records
// ============================================================================

/// Activity classification reported by the workout source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Running,
    Walking,
    Cycling,
    Hiking,
    Swimming,
    Rowing,
    Skiing,
    Yoga,
    Other,
}

impl ActivityKind {
    /// Parse the source's activity type string. Unknown types map to `Other`.
    pub fn from_source(raw: &str) -> Self {
        let normalized: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "run" | "running" | "virtualrun" | "trailrun" => ActivityKind::Running,
            "walk" | "walking" => ActivityKind::Walking,
            "ride" | "cycling" | "virtualride" | "ebikeride" | "mountainbikeride"
            | "gravelride" => ActivityKind::Cycling,
            "hike" | "hiking" => ActivityKind::Hiking,
            "swim" | "swimming" | "openwaterswim" => ActivityKind::Swimming,
            "row" | "rowing" => ActivityKind::Rowing,
            "ski" | "nordicski" | "alpineski" | "backcountryski" | "crosscountryskiing"
            | "downhillskiing" => ActivityKind::Skiing,
            "yoga" => ActivityKind::Yoga,
            _ => ActivityKind::Other,
        }
    }

    /// Short display label for routes of this kind.
    pub fn label(&self) -> &'static str {
        match self {
            ActivityKind::Running => "Run",
            ActivityKind::Walking => "Walk",
            ActivityKind::Cycling => "Ride",
            ActivityKind::Hiking => "Hike",
            ActivityKind::Swimming => "Swim",
            ActivityKind::Rowing => "Row",
            ActivityKind::Skiing => "Ski",
            ActivityKind::Yoga => "Yoga",
            ActivityKind::Other => "Workout",
        }
    }
}

/// A workout entry from the external source.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkoutRecord {
    /// Stable identifier assigned by the source.
    pub external_id: String,
    pub activity_kind: ActivityKind,
    pub start_time: DateTime<Utc>,
    /// Source-provided distance, when the source tracks one.
    pub distance_meters: Option<f64>,
}

impl WorkoutRecord {
    pub fn new(
        external_id: impl Into<String>,
        activity_kind: ActivityKind,
        start_time: DateTime<Utc>,
        distance_meters: Option<f64>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            activity_kind,
            start_time,
            distance_meters,
        }
    }
}
