//! Shared fixtures for integration tests: a scripted workout source and
//! record/path builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use route_sync::{AccessStatus, ActivityKind, GpsPoint, Result, SyncError, WorkoutRecord, WorkoutSource};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Failure a scripted call should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Denied,
    Unavailable,
    Transient,
}

impl Failure {
    fn to_error(self) -> SyncError {
        match self {
            Failure::Denied => SyncError::AuthorizationDenied,
            Failure::Unavailable => SyncError::SourceUnavailable,
            Failure::Transient => SyncError::transient("connection reset"),
        }
    }
}

#[derive(Default)]
struct Script {
    unavailable: AtomicBool,
    deny_access: AtomicBool,
    workouts: Mutex<Vec<WorkoutRecord>>,
    fetch_failure: Mutex<Option<Failure>>,
    fetch_delay: Mutex<Option<Duration>>,
    access_delay: Mutex<Option<Duration>>,
    sample_delay: Mutex<Option<Duration>>,
    samples: Mutex<HashMap<String, Vec<Vec<GpsPoint>>>>,
    sample_failures: Mutex<HashMap<String, Failure>>,
    access_requests: AtomicUsize,
    fetch_calls: AtomicUsize,
    sample_fetches: AtomicUsize,
    last_since: Mutex<Option<DateTime<Utc>>>,
}

/// In-memory workout source whose responses are set up by the test.
///
/// Clones share one script, so a test can keep a handle after moving a clone
/// into the engine.
#[derive(Clone, Default)]
pub struct FakeSource {
    script: Arc<Script>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record with the given sample batches, after the existing ones.
    pub fn push(&self, record: WorkoutRecord, batches: Vec<Vec<GpsPoint>>) {
        self.script
            .samples
            .lock()
            .unwrap()
            .insert(record.external_id.clone(), batches);
        self.script.workouts.lock().unwrap().push(record);
    }

    pub fn clear_workouts(&self) {
        self.script.workouts.lock().unwrap().clear();
    }

    pub fn set_unavailable(&self) {
        self.script.unavailable.store(true, Ordering::SeqCst);
    }

    pub fn deny_access(&self) {
        self.script.deny_access.store(true, Ordering::SeqCst);
    }

    pub fn grant_access(&self) {
        self.script.deny_access.store(false, Ordering::SeqCst);
    }

    pub fn fail_fetch(&self, failure: Option<Failure>) {
        *self.script.fetch_failure.lock().unwrap() = failure;
    }

    pub fn fail_samples(&self, external_id: &str, failure: Failure) {
        self.script
            .sample_failures
            .lock()
            .unwrap()
            .insert(external_id.to_string(), failure);
    }

    pub fn clear_sample_failures(&self) {
        self.script.sample_failures.lock().unwrap().clear();
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.script.fetch_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_access_delay(&self, delay: Duration) {
        *self.script.access_delay.lock().unwrap() = Some(delay);
    }

    /// Delay applied to every per-record sample fetch.
    pub fn set_sample_delay(&self, delay: Duration) {
        *self.script.sample_delay.lock().unwrap() = Some(delay);
    }

    pub fn access_requests(&self) -> usize {
        self.script.access_requests.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.script.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn sample_fetches(&self) -> usize {
        self.script.sample_fetches.load(Ordering::SeqCst)
    }

    pub fn last_since(&self) -> Option<DateTime<Utc>> {
        *self.script.last_since.lock().unwrap()
    }
}

impl WorkoutSource for FakeSource {
    type Batch = Vec<GpsPoint>;

    fn is_available(&self) -> bool {
        !self.script.unavailable.load(Ordering::SeqCst)
    }

    async fn request_access(&self) -> Result<AccessStatus> {
        self.script.access_requests.fetch_add(1, Ordering::SeqCst);
        let delay = *self.script.access_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.script.deny_access.load(Ordering::SeqCst) {
            Ok(AccessStatus::Denied)
        } else {
            Ok(AccessStatus::Granted)
        }
    }

    async fn fetch_workouts(&self, since: Option<DateTime<Utc>>) -> Result<Vec<WorkoutRecord>> {
        self.script.fetch_calls.fetch_add(1, Ordering::SeqCst);
        *self.script.last_since.lock().unwrap() = since;

        let delay = *self.script.fetch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = *self.script.fetch_failure.lock().unwrap();
        if let Some(failure) = failure {
            return Err(failure.to_error());
        }

        let workouts = self.script.workouts.lock().unwrap().clone();
        Ok(workouts
            .into_iter()
            .filter(|r| since.map_or(true, |s| r.start_time >= s))
            .collect())
    }

    async fn fetch_route_samples(&self, record: &WorkoutRecord) -> Result<Vec<Vec<GpsPoint>>> {
        self.script.sample_fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.script.sample_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self
            .script
            .sample_failures
            .lock()
            .unwrap()
            .get(&record.external_id)
            .copied();
        if let Some(failure) = failure {
            return Err(failure.to_error());
        }
        Ok(self
            .script
            .samples
            .lock()
            .unwrap()
            .get(&record.external_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn read_coordinates(&self, batch: &Vec<GpsPoint>) -> Result<Vec<GpsPoint>> {
        Ok(batch.clone())
    }
}

/// Record starting on day `day` of May 2024.
pub fn record(id: &str, kind: ActivityKind, day: u32, distance_meters: Option<f64>) -> WorkoutRecord {
    WorkoutRecord::new(
        id,
        kind,
        Utc.with_ymd_and_hms(2024, 5, day, 7, 0, 0).unwrap(),
        distance_meters,
    )
}

/// Straight eastward path of `n` points starting at `(lat, lon)`.
pub fn path(lat: f64, lon: f64, n: usize) -> Vec<GpsPoint> {
    (0..n)
        .map(|i| GpsPoint::new(lat, lon + i as f64 * 0.001))
        .collect()
}
