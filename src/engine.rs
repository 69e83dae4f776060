//! # Sync Engine
//!
//! Reconciles an external [`WorkoutSource`] against the cached route collection.
//!
//! ## State machine
//!
//! ```text
//! Idle ──refresh──► RequestingAccess ──granted──► Loading ──► Loaded | Empty
//!   ▲                                   (skipped once granted)     │
//!   └───────────── any step may end in Error(message) ◄────────────┘
//! ```
//!
//! The engine is the single owner of routes, state and progress. They live in
//! one [`EngineSnapshot`] behind a `watch` channel: every mutation goes through
//! the sender, and observers hold receivers from [`SyncEngine::subscribe`].
//!
//! ## Refresh
//!
//! Records are fetched in source order. Records whose external id is already
//! known are skipped without being rebuilt or recolored. Sample fetches for
//! new records run with bounded concurrency but are consumed in source order,
//! so color indices, progress and incremental publication stay deterministic.
//! New routes lead the merged collection and are persisted together with the
//! last known viewport.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{stream, StreamExt};
use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::builder::build_route;
use crate::palette::color_for_index;
use crate::source::{AccessStatus, WorkoutSource};
use crate::store::DurableStore;
use crate::viewport::ViewportPersistor;
use crate::{
    CachedDocument, GpsPoint, Result, Route, RouteCacheStore, SyncConfig, SyncError,
    ViewportRegion, WorkoutRecord,
};

// ============================================================================
// Observable State
// ============================================================================

/// Lifecycle state of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    RequestingAccess,
    Loading,
    Loaded,
    Empty,
    /// Short user-facing message.
    Error(String),
}

impl SyncState {
    pub fn is_busy(&self) -> bool {
        matches!(self, SyncState::RequestingAccess | SyncState::Loading)
    }
}

/// Per-record progress of a running refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadingProgress {
    pub total: usize,
    pub loaded: usize,
}

impl LoadingProgress {
    /// Completed fraction in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.loaded as f64 / self.total as f64
    }
}

/// Everything observers see, published atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSnapshot {
    pub state: SyncState,
    pub routes: Vec<Route>,
    pub progress: Option<LoadingProgress>,
}

/// Outcome counts of one refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Records returned by the source.
    pub fetched: usize,
    /// Routes built and added to the collection.
    pub added: usize,
    /// Records skipped because their external id was already known.
    pub already_known: usize,
    /// Records dropped for having fewer than two coordinates.
    pub dropped: usize,
    /// Records whose samples could not be fetched.
    pub failed: usize,
    /// The call was ignored because another refresh was running.
    pub skipped_in_flight: bool,
}

impl RefreshSummary {
    pub fn already_running() -> Self {
        Self {
            skipped_in_flight: true,
            ..Self::default()
        }
    }
}

/// Clears the in-flight flag when the refresh ends, however it ends.
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

// ============================================================================
// Sync Engine
// ============================================================================

/// Incremental route sync over a workout source and a route cache.
pub struct SyncEngine<S: WorkoutSource> {
    source: S,
    store: RouteCacheStore,
    config: SyncConfig,
    snapshot: watch::Sender<EngineSnapshot>,
    viewport: ViewportPersistor,
    access_granted: AtomicBool,
    in_flight: AtomicBool,
    has_synced: AtomicBool,
}

impl<S: WorkoutSource> SyncEngine<S> {
    /// Create an engine and load the cache before any source access.
    ///
    /// With at least one cached route the engine starts `Loaded` and the cached
    /// viewport is restored. Must be called within a Tokio runtime.
    pub async fn new(source: S, store: RouteCacheStore, config: SyncConfig) -> Self {
        let cached = store.load_async().await;
        let state = if cached.routes.is_empty() {
            SyncState::Idle
        } else {
            SyncState::Loaded
        };
        info!(
            "[SyncEngine] Starting {:?} with {} cached routes",
            state,
            cached.routes.len()
        );

        let (snapshot, _) = watch::channel(EngineSnapshot {
            state,
            routes: cached.routes,
            progress: None,
        });

        let routes_rx = snapshot.subscribe();
        let viewport = ViewportPersistor::new(
            store.clone(),
            config.viewport_debounce,
            Arc::new(move || routes_rx.borrow().routes.clone()),
            Handle::current(),
            cached.viewport,
        );

        Self {
            source,
            store,
            config,
            snapshot,
            viewport,
            access_granted: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            has_synced: AtomicBool::new(false),
        }
    }

    /// Create an engine caching under `config.cache_key` in `backend`.
    pub async fn with_backend(
        source: S,
        backend: Arc<dyn DurableStore>,
        config: SyncConfig,
    ) -> Self {
        let store = RouteCacheStore::with_key(backend, config.cache_key.clone());
        Self::new(source, store, config).await
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// Receiver notified on every routes/state/progress change.
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn routes(&self) -> Vec<Route> {
        self.snapshot.borrow().routes.clone()
    }

    pub fn route_count(&self) -> usize {
        self.snapshot.borrow().routes.len()
    }

    pub fn state(&self) -> SyncState {
        self.snapshot.borrow().state.clone()
    }

    pub fn progress(&self) -> Option<LoadingProgress> {
        self.snapshot.borrow().progress
    }

    /// Last recorded (or restored) viewport.
    pub fn viewport(&self) -> Option<ViewportRegion> {
        self.viewport.last_viewport()
    }

    /// Region enclosing all current routes, for auto-fit.
    pub fn fitted_viewport(&self) -> Option<ViewportRegion> {
        ViewportRegion::fitting(&self.snapshot.borrow().routes)
    }

    pub fn store(&self) -> &RouteCacheStore {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // ========================================================================
    // Viewport
    // ========================================================================

    /// Remember `region` now and persist it after the debounce delay.
    pub fn record_viewport(&self, region: ViewportRegion) {
        self.viewport.record_viewport(region);
    }

    /// Write a pending viewport immediately (e.g. when the app is backgrounded).
    pub async fn flush_viewport(&self) -> bool {
        self.viewport.flush().await
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    /// Refresh unless a refresh already succeeded in this process lifetime.
    pub async fn refresh_if_needed(&self) -> Result<Option<RefreshSummary>> {
        if self.has_synced.load(Ordering::Acquire) {
            debug!("[SyncEngine] Already synced, skipping refresh");
            return Ok(None);
        }
        self.refresh_workouts().await.map(Some)
    }

    /// Fetch new workouts from the source and merge them into the collection.
    ///
    /// A call made while another refresh is running returns
    /// [`RefreshSummary::already_running`] and changes nothing. On failure the
    /// collection is left as it was before the call and the state is
    /// `Error(user message)`.
    pub async fn refresh_workouts(&self) -> Result<RefreshSummary> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            info!("[SyncEngine] Refresh already in flight, ignoring");
            return Ok(RefreshSummary::already_running());
        };

        self.set_progress(None);
        let existing = self.routes();

        let outcome = self.run_refresh(&existing).await;
        match outcome {
            Ok(summary) => {
                self.has_synced.store(true, Ordering::Release);
                info!(
                    "[SyncEngine] Refresh done: {} fetched, {} added, {} known, {} dropped, {} failed",
                    summary.fetched,
                    summary.added,
                    summary.already_known,
                    summary.dropped,
                    summary.failed
                );
                Ok(summary)
            }
            Err(e) => {
                warn!("[SyncEngine] Refresh failed: {}", e);
                let message = e.user_message();
                self.snapshot.send_modify(|s| {
                    debug!("[SyncEngine] {:?} -> Error", s.state);
                    s.progress = None;
                    s.routes = existing;
                    s.state = SyncState::Error(message);
                });
                Err(e)
            }
        }
    }

    async fn run_refresh(&self, existing: &[Route]) -> Result<RefreshSummary> {
        self.ensure_access().await?;
        self.set_state(SyncState::Loading);

        let since = if self.config.incremental_fetch {
            existing.iter().filter_map(Route::start_time).max()
        } else {
            None
        };
        let records = self
            .bounded("workout fetch", self.source.fetch_workouts(since))
            .await?;

        let mut summary = RefreshSummary {
            fetched: records.len(),
            ..RefreshSummary::default()
        };
        if records.is_empty() {
            debug!("[SyncEngine] Source returned no workouts");
            self.settle();
            return Ok(summary);
        }

        let total = records.len();
        self.set_progress(Some(LoadingProgress { total, loaded: 0 }));

        // Ids seen earlier in this batch count as known too
        let mut known: HashSet<String> = existing
            .iter()
            .filter_map(|r| r.external_id().map(str::to_owned))
            .collect();
        let plan: Vec<(WorkoutRecord, bool)> = records
            .into_iter()
            .map(|record| {
                let is_new = known.insert(record.external_id.clone());
                (record, is_new)
            })
            .collect();

        let mut samples = stream::iter(plan)
            .map(|(record, is_new)| async move {
                let batches = if is_new {
                    Some(self.load_coordinates(&record).await)
                } else {
                    None
                };
                (record, batches)
            })
            .buffered(self.config.sample_concurrency.max(1));

        let mut new_routes: Vec<Route> = Vec::new();
        while let Some((record, batches)) = samples.next().await {
            match batches {
                None => summary.already_known += 1,
                Some(Ok(batches)) => {
                    let color = color_for_index(existing.len() + new_routes.len());
                    match build_route(&record, &batches, color) {
                        Some(route) => {
                            new_routes.push(route);
                            summary.added += 1;
                            self.publish_partial(&new_routes, existing);
                        }
                        None => summary.dropped += 1,
                    }
                }
                Some(Err(e)) if e.is_fatal() => return Err(e),
                Some(Err(e)) => {
                    warn!(
                        "[SyncEngine] Skipping workout {}: {}",
                        record.external_id, e
                    );
                    summary.failed += 1;
                }
            }
            self.advance_progress();
        }
        drop(samples);

        if new_routes.is_empty() {
            self.settle();
            return Ok(summary);
        }

        let merged: Vec<Route> = new_routes
            .into_iter()
            .chain(existing.iter().cloned())
            .collect();
        // Publish inside the ticketed build so a concurrent viewport write
        // either precedes this one or already sees the merged collection.
        let write = self.store.save_with(|| {
            let document = CachedDocument::new(merged.clone(), self.viewport.last_viewport());
            self.snapshot.send_modify(|s| {
                debug!("[SyncEngine] {:?} -> Loaded ({} routes)", s.state, merged.len());
                s.routes = merged;
                s.progress = None;
                s.state = SyncState::Loaded;
            });
            document
        });

        if !write.await {
            debug!("[SyncEngine] Cache not updated; in-memory routes remain current");
        }
        Ok(summary)
    }

    async fn ensure_access(&self) -> Result<()> {
        if !self.source.is_available() {
            return Err(SyncError::SourceUnavailable);
        }
        if self.access_granted.load(Ordering::Acquire) {
            return Ok(());
        }

        self.set_state(SyncState::RequestingAccess);
        match self
            .bounded("access request", self.source.request_access())
            .await?
        {
            AccessStatus::Granted => {
                self.access_granted.store(true, Ordering::Release);
                info!("[SyncEngine] Access granted");
                Ok(())
            }
            AccessStatus::Denied => Err(SyncError::AuthorizationDenied),
        }
    }

    /// Fetch and read all sample batches of one record.
    async fn load_coordinates(&self, record: &WorkoutRecord) -> Result<Vec<Vec<GpsPoint>>> {
        let batches = self
            .bounded("sample fetch", self.source.fetch_route_samples(record))
            .await?;

        let mut coordinates = Vec::with_capacity(batches.len());
        for batch in &batches {
            coordinates.push(
                self.bounded("coordinate read", self.source.read_coordinates(batch))
                    .await?,
            );
        }
        Ok(coordinates)
    }

    /// Apply the configured operation timeout, if any.
    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match self.config.operation_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| SyncError::Timeout { operation })?,
            None => call.await,
        }
    }

    // ========================================================================
    // Snapshot mutation
    // ========================================================================

    fn set_state(&self, state: SyncState) {
        self.snapshot.send_if_modified(|s| {
            if s.state == state {
                return false;
            }
            debug!("[SyncEngine] {:?} -> {:?}", s.state, state);
            s.state = state;
            true
        });
    }

    fn set_progress(&self, progress: Option<LoadingProgress>) {
        self.snapshot.send_if_modified(|s| {
            if s.progress == progress {
                return false;
            }
            s.progress = progress;
            true
        });
    }

    fn advance_progress(&self) {
        self.snapshot.send_if_modified(|s| match s.progress.as_mut() {
            Some(p) if p.loaded < p.total => {
                p.loaded += 1;
                true
            }
            _ => false,
        });
    }

    /// Publish `new ++ existing` while the refresh is still running.
    fn publish_partial(&self, new_routes: &[Route], existing: &[Route]) {
        let merged: Vec<Route> = new_routes.iter().chain(existing).cloned().collect();
        self.snapshot.send_modify(|s| s.routes = merged);
    }

    /// Finish a refresh that added nothing.
    fn settle(&self) {
        self.snapshot.send_modify(|s| {
            let next = if s.routes.is_empty() {
                SyncState::Empty
            } else {
                SyncState::Loaded
            };
            debug!("[SyncEngine] {:?} -> {:?}", s.state, next);
            s.progress = None;
            s.state = next;
        });
    }
}

// ============================================================================
// Tests
// ============================================================================
