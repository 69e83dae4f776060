//! Boundary to the external workout data source.
//!
//! The engine only sees this trait. Platform health stores, REST APIs and test
//! fakes all plug in here.

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::{GpsPoint, Result, WorkoutRecord};

/// Outcome of an access request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    Granted,
    Denied,
}

/// A source of workout records and their route samples.
///
/// Implementations report "user declined" as `AccessStatus::Denied` or
/// `SyncError::AuthorizationDenied`; anything else unexpected as
/// `SyncError::TransientFetchFailure`.
pub trait WorkoutSource: Send + Sync + 'static {
    /// Opaque handle to one batch of route samples.
    type Batch: Send + Sync;

    /// Whether the source can be used on this device at all.
    fn is_available(&self) -> bool;

    /// Ask the user (or remote service) for read access.
    fn request_access(&self) -> impl Future<Output = Result<AccessStatus>> + Send;

    /// Fetch workout records in source order, optionally only those
    /// starting after `since`.
    fn fetch_workouts(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<Vec<WorkoutRecord>>> + Send;

    /// Fetch the route sample batches recorded for `record`.
    fn fetch_route_samples(
        &self,
        record: &WorkoutRecord,
    ) -> impl Future<Output = Result<Vec<Self::Batch>>> + Send;

    /// Read the ordered coordinates contained in one batch.
    fn read_coordinates(
        &self,
        batch: &Self::Batch,
    ) -> impl Future<Output = Result<Vec<GpsPoint>>> + Send;
}
