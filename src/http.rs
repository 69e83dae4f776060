//! HTTP workout source for intervals.icu-style APIs.
//!
//! - Basic auth with `API_KEY:<key>`
//! - `athlete/{id}` probes access (401/403 means denied)
//! - `athlete/{id}/activities?oldest=&newest=` lists workouts
//! - `activity/{id}/map` returns one coordinate batch per workout
//! - Automatic retry with exponential backoff on 429 and transport errors

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, info, warn};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

use crate::source::{AccessStatus, WorkoutSource};
use crate::{ActivityKind, GpsPoint, Result, SyncError, WorkoutRecord};

const DEFAULT_BASE_URL: &str = "https://intervals.icu/api/v1";
/// Lower bound of the activity window when no `since` is given.
const DEFAULT_OLDEST: &str = "2000-01-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 3;

/// One activity from the list endpoint.
#[derive(Debug, Deserialize)]
struct ActivityResponse {
    id: String,
    #[serde(rename = "type", default)]
    activity_type: Option<String>,
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    distance: Option<f64>,
}

/// Response of the activity map endpoint.
#[derive(Debug, Deserialize)]
struct MapApiResponse {
    latlngs: Option<Vec<Option<[f64; 2]>>>,
}

/// Coordinates of one activity, as returned by the map endpoint.
#[derive(Debug, Clone)]
pub struct MapBatch {
    pub activity_id: String,
    pub latlngs: Vec<[f64; 2]>,
}

/// Workout source backed by the intervals.icu REST API.
pub struct HttpWorkoutSource {
    client: Client,
    base_url: String,
    athlete_id: String,
    auth_header: String,
    consecutive_429s: AtomicU32,
}

impl HttpWorkoutSource {
    /// Create a source for `athlete_id` authenticated with `api_key`.
    pub fn new(athlete_id: &str, api_key: &str) -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL, athlete_id, api_key)
    }

    /// Create a source against a different API root (self-hosted or test server).
    pub fn with_base_url(base_url: &str, athlete_id: &str, api_key: &str) -> Result<Self> {
        let auth = base64::engine::general_purpose::STANDARD
            .encode(format!("API_KEY:{}", api_key));

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SyncError::transient(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            athlete_id: athlete_id.to_string(),
            auth_header: format!("Basic {}", auth),
            consecutive_429s: AtomicU32::new(0),
        })
    }

    /// GET with retry on 429 and transport errors.
    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Response> {
        let mut retries = 0;

        loop {
            let response = self
                .client
                .get(url)
                .header("Authorization", &self.auth_header)
                .query(query)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        return Err(SyncError::transient("Max retries exceeded (429)"));
                    }
                    let backoff = self.record_429();
                    warn!(
                        "[HttpWorkoutSource] 429 for {}, retry {} after {:?}",
                        url, retries, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Ok(resp) => {
                    self.consecutive_429s.store(0, Ordering::Relaxed);
                    return check_status(resp);
                }
                Err(e) => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        return Err(SyncError::transient(format!("Request error: {}", e)));
                    }
                    let backoff = Duration::from_millis(500 * (1 << retries));
                    warn!(
                        "[HttpWorkoutSource] Error for {}: {}, retry {} after {:?}",
                        url, e, retries, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    fn record_429(&self) -> Duration {
        let count = self.consecutive_429s.fetch_add(1, Ordering::Relaxed) + 1;
        // Exponential backoff: 2s, 4s, 8s, 16s
        Duration::from_millis(1000 * (1 << count.min(4)))
    }
}

impl WorkoutSource for HttpWorkoutSource {
    type Batch = MapBatch;

    fn is_available(&self) -> bool {
        !self.athlete_id.is_empty()
    }

    async fn request_access(&self) -> Result<AccessStatus> {
        let url = format!("{}/athlete/{}", self.base_url, self.athlete_id);
        match self.get(&url, &[]).await {
            Ok(_) => Ok(AccessStatus::Granted),
            Err(SyncError::AuthorizationDenied) => Ok(AccessStatus::Denied),
            Err(e) => Err(e),
        }
    }

    async fn fetch_workouts(&self, since: Option<DateTime<Utc>>) -> Result<Vec<WorkoutRecord>> {
        let url = format!("{}/athlete/{}/activities", self.base_url, self.athlete_id);
        let oldest = since
            .map(|t| t.date_naive().to_string())
            .unwrap_or_else(|| DEFAULT_OLDEST.to_string());
        let newest = Utc::now().date_naive().to_string();

        let activities: Vec<ActivityResponse> = self
            .get(&url, &[("oldest", oldest), ("newest", newest)])
            .await?
            .json()
            .await
            .map_err(|e| SyncError::transient(format!("Parse error: {}", e)))?;

        let records = to_records(activities);
        info!("[HttpWorkoutSource] Listed {} activities", records.len());
        Ok(records)
    }

    async fn fetch_route_samples(&self, record: &WorkoutRecord) -> Result<Vec<MapBatch>> {
        let url = format!("{}/activity/{}/map", self.base_url, record.external_id);
        let data: MapApiResponse = self
            .get(&url, &[])
            .await?
            .json()
            .await
            .map_err(|e| SyncError::transient(format!("Parse error: {}", e)))?;

        let latlngs = flatten_latlngs(data.latlngs);
        debug!(
            "[HttpWorkoutSource] {} has {} points",
            record.external_id,
            latlngs.len()
        );
        if latlngs.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![MapBatch {
            activity_id: record.external_id.clone(),
            latlngs,
        }])
    }

    async fn read_coordinates(&self, batch: &MapBatch) -> Result<Vec<GpsPoint>> {
        Ok(to_points(&batch.latlngs))
    }
}

fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(SyncError::AuthorizationDenied);
    }
    if !status.is_success() {
        return Err(SyncError::transient(format!("HTTP {}", status)));
    }
    Ok(resp)
}

/// Convert listed activities, skipping those without a parseable start date.
fn to_records(activities: Vec<ActivityResponse>) -> Vec<WorkoutRecord> {
    activities
        .into_iter()
        .filter_map(|a| {
            let start_time = match a.start_date.as_deref().and_then(parse_start_date) {
                Some(t) => t,
                None => {
                    warn!("[HttpWorkoutSource] Skipping {}: no start date", a.id);
                    return None;
                }
            };
            let kind = a
                .activity_type
                .as_deref()
                .map(ActivityKind::from_source)
                .unwrap_or(ActivityKind::Other);
            Some(WorkoutRecord::new(a.id, kind, start_time, a.distance))
        })
        .collect()
}

/// RFC 3339 timestamp, or a bare date taken as midnight UTC.
fn parse_start_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
}

/// Filter null latlngs.
fn flatten_latlngs(latlngs: Option<Vec<Option<[f64; 2]>>>) -> Vec<[f64; 2]> {
    latlngs
        .map(|coords| coords.into_iter().flatten().collect())
        .unwrap_or_default()
}

fn to_points(latlngs: &[[f64; 2]]) -> Vec<GpsPoint> {
    latlngs
        .iter()
        .map(|&[lat, lng]| GpsPoint::new(lat, lng))
        .filter(GpsPoint::is_valid)
        .collect()
}
