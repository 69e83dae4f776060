//! Configuration for the sync engine and viewport persistence.

use std::time::Duration;

/// Configuration for [`SyncEngine`](crate::SyncEngine).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period before a viewport change is written to the cache.
    /// Default: 400ms
    pub viewport_debounce: Duration,

    /// Only fetch records newer than the latest cached route start date.
    /// Records at the window boundary are still deduplicated by external id.
    /// Default: false (always fetch the full batch)
    pub incremental_fetch: bool,

    /// Maximum number of in-flight sample fetches. Records are still built,
    /// published and counted in source order.
    /// Default: 4
    pub sample_concurrency: usize,

    /// Optional bound on each access/fetch call. `None` relies on the
    /// source's own transport timeout.
    /// Default: None
    pub operation_timeout: Option<Duration>,

    /// Key of the cached document in the durable store.
    /// Default: "routes"
    pub cache_key: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            viewport_debounce: Duration::from_millis(400),
            incremental_fetch: false,
            sample_concurrency: 4,
            operation_timeout: None,
            cache_key: "routes".to_string(),
        }
    }
}

impl SyncConfig {
    /// Use a different viewport debounce delay.
    pub fn with_debounce(mut self, delay: Duration) -> Self {
        self.viewport_debounce = delay;
        self
    }

    /// Fetch only records newer than the latest synced start date.
    pub fn incremental(mut self) -> Self {
        self.incremental_fetch = true;
        self
    }

    /// Bound access and fetch calls by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }
}
