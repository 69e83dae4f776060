//! # Viewport Persistor
//!
//! Debounced, cancellable writer of the last user-chosen map viewport.
//!
//! `record_viewport` updates the in-memory viewport immediately and schedules a
//! cache write after a quiet period. Each call supersedes the previous one:
//! the pending task is aborted and a generation counter is bumped, so a task
//! that already woke up but lost the race still sees it is stale and skips its
//! write. Only the last viewport in any burst reaches storage.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::debug;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::{CachedDocument, Route, RouteCacheStore, ViewportRegion};

/// Supplies the route collection current at write time.
pub type RouteProvider = Arc<dyn Fn() -> Vec<Route> + Send + Sync>;

/// The single scheduled write, if any.
struct PendingWrite {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Debounced viewport writer sharing the route cache with the sync engine.
pub struct ViewportPersistor {
    store: RouteCacheStore,
    routes: RouteProvider,
    delay: Duration,
    runtime: Handle,
    last_viewport: Mutex<Option<ViewportRegion>>,
    generation: Arc<AtomicU64>,
    pending: Mutex<Option<PendingWrite>>,
}

impl ViewportPersistor {
    /// Create a persistor that writes through `store` after `delay` of quiet.
    ///
    /// `routes` is called when a write fires. Timers run on `runtime`.
    pub fn new(
        store: RouteCacheStore,
        delay: Duration,
        routes: RouteProvider,
        runtime: Handle,
        initial: Option<ViewportRegion>,
    ) -> Self {
        Self {
            store,
            routes,
            delay,
            runtime,
            last_viewport: Mutex::new(initial),
            generation: Arc::new(AtomicU64::new(0)),
            pending: Mutex::new(None),
        }
    }

    /// Last viewport passed to [`record_viewport`](Self::record_viewport)
    /// (or loaded from the cache), whether or not it has been written yet.
    pub fn last_viewport(&self) -> Option<ViewportRegion> {
        *self
            .last_viewport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a new viewport and (re)schedule its write.
    ///
    /// The viewport update, generation bump, spawn and handle swap all happen
    /// under the `pending` lock, so concurrent callers are strictly ordered and
    /// the task left installed is always the newest generation.
    pub fn record_viewport(&self, region: ViewportRegion) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        *self
            .last_viewport
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(region);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let current = Arc::clone(&self.generation);
        let store = self.store.clone();
        let routes = Arc::clone(&self.routes);
        let delay = self.delay;

        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if current.load(Ordering::SeqCst) != generation {
                return;
            }
            let write = store.save_with(|| {
                let document = CachedDocument::new(routes(), Some(region));
                debug!(
                    "[ViewportPersistor] Writing viewport #{} with {} routes",
                    generation,
                    document.routes.len()
                );
                document
            });
            write.await;
        });

        if let Some(previous) = pending.replace(PendingWrite { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Whether a write is scheduled and has not finished yet.
    pub fn has_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|p| !p.handle.is_finished())
    }

    /// Drop the scheduled write, if any. The in-memory viewport is kept.
    pub fn cancel(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        Self::cancel_locked(&self.generation, &mut pending);
    }

    fn cancel_locked(generation: &AtomicU64, pending: &mut Option<PendingWrite>) -> bool {
        generation.fetch_add(1, Ordering::SeqCst);
        match pending.take() {
            Some(previous) => {
                debug!(
                    "[ViewportPersistor] Cancelled pending write #{}",
                    previous.generation
                );
                let unfinished = !previous.handle.is_finished();
                previous.handle.abort();
                unfinished
            }
            None => false,
        }
    }

    /// Write the pending viewport now instead of waiting for the debounce.
    ///
    /// Returns `false` when nothing was pending or the write failed.
    pub async fn flush(&self) -> bool {
        let write = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if !Self::cancel_locked(&self.generation, &mut pending) {
                return false;
            }
            let region = self.last_viewport();
            self.store
                .save_with(|| CachedDocument::new((self.routes)(), region))
        };
        write.await
    }
}
