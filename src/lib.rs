//! # Route Sync
//!
//! Incremental workout-route synchronization with a local, crash-safe cache.
//!
//! This library provides:
//! - A sync engine that reconciles an external workout source against cached routes
//! - Deduplication by external identifier and stable, never-recomputed route colors
//! - A durable cache document (routes + last viewport) with legacy-format fallback
//! - A debounced viewport writer that keeps map panning off the storage hot path
//!
//! ## Features
//!
//! - **`persistence`** - SQLite-backed durable store (default)
//! - **`http`** - HTTP workout source for intervals.icu-style APIs
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use route_sync::{geo_utils, GpsPoint};
//!
//! let path = vec![GpsPoint::new(0.0, 0.0), GpsPoint::new(0.0, 1.0)];
//! let km = geo_utils::estimate_distance_km(&path);
//! assert!((km - 111.19).abs() < 0.5);
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{Result, StoreError, SyncError};

// Engine configuration
pub mod config;
pub use config::SyncConfig;

// Geographic utilities (distance estimation, bounds)
pub mod geo_utils;

// Fixed route color palette
pub mod palette;
pub use palette::{color_for_index, RouteColor, PALETTE};

// Routes, viewport and the cached document
pub mod types;
pub use types::{ActivityKind, CachedDocument, Route, ViewportRegion, WorkoutRecord};

// Route assembly from external records
pub mod builder;
pub use builder::build_route;

// Workout source boundary
pub mod source;
pub use source::{AccessStatus, WorkoutSource};

// Durable store and route cache
pub mod store;
pub use store::{DurableStore, FileStore, MemoryStore, RouteCacheStore, SaveHandle};

#[cfg(feature = "persistence")]
pub mod sqlite_store;
#[cfg(feature = "persistence")]
pub use sqlite_store::SqliteStore;

// Debounced viewport persistence
pub mod viewport;
pub use viewport::ViewportPersistor;

// Sync engine (state machine + incremental merge)
pub mod engine;
pub use engine::{EngineSnapshot, LoadingProgress, RefreshSummary, SyncEngine, SyncState};

// HTTP module for workout fetching
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::HttpWorkoutSource;

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// Serialized as `{"latitude": .., "longitude": ..}`, the shape used by the
/// cached document.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Bounding box of one or more routes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Create bounds from GPS points.
    pub fn from_points(points: &[GpsPoint]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let mut min_lat = f64::MAX;
        let mut max_lat = f64::MIN;
        let mut min_lng = f64::MAX;
        let mut max_lng = f64::MIN;

        for p in points {
            min_lat = min_lat.min(p.latitude);
            max_lat = max_lat.max(p.latitude);
            min_lng = min_lng.min(p.longitude);
            max_lng = max_lng.max(p.longitude);
        }

        Some(Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        })
    }

    /// Smallest bounds containing both `self` and `other`.
    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min_lat: self.min_lat.min(other.min_lat),
            max_lat: self.max_lat.max(other.max_lat),
            min_lng: self.min_lng.min(other.min_lng),
            max_lng: self.max_lng.max(other.max_lng),
        }
    }

    /// Get the center point of the bounds.
    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
