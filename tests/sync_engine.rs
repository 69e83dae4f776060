//! Integration tests for the sync engine against a scripted source.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{init_logging, path, record, FakeSource, Failure};
use route_sync::{
    ActivityKind, CachedDocument, FileStore, GpsPoint, MemoryStore, Route, RouteCacheStore,
    RouteColor, SyncConfig, SyncEngine, SyncError, SyncState, ViewportRegion, PALETTE,
};
use tempfile::TempDir;

fn memory_cache() -> (Arc<MemoryStore>, RouteCacheStore) {
    let memory = Arc::new(MemoryStore::new());
    let cache = RouteCacheStore::new(memory.clone());
    (memory, cache)
}

async fn engine_with(source: &FakeSource, cache: &RouteCacheStore) -> SyncEngine<FakeSource> {
    SyncEngine::new(source.clone(), cache.clone(), SyncConfig::default()).await
}

fn ids(routes: &[Route]) -> Vec<String> {
    routes.iter().map(|r| r.id().to_string()).collect()
}

fn colors(routes: &[Route]) -> Vec<RouteColor> {
    routes.iter().map(Route::color).collect()
}

fn cached_routes() -> Vec<Route> {
    vec![
        Route::new("Morning Loop", 5.2, None, path(47.37, 8.54, 10), RouteColor::Blue),
        Route::new("Lake Walk", 3.1, None, path(47.36, 8.55, 6), RouteColor::Red),
    ]
}

#[tokio::test]
async fn test_three_records_one_unrenderable() {
    init_logging();
    let (memory, cache) = memory_cache();
    let source = FakeSource::new();
    source.push(record("a", ActivityKind::Running, 1, Some(5_000.0)), vec![path(47.0, 8.0, 5)]);
    source.push(record("b", ActivityKind::Walking, 2, None), vec![path(47.1, 8.1, 1)]);
    source.push(record("c", ActivityKind::Cycling, 3, Some(20_000.0)), vec![path(47.2, 8.2, 3)]);

    let engine = engine_with(&source, &cache).await;
    let summary = engine.refresh_workouts().await.unwrap();

    assert_eq!(summary.fetched, 3);
    assert_eq!(summary.added, 2);
    assert_eq!(summary.dropped, 1);
    assert_eq!(engine.state(), SyncState::Loaded);
    assert!(engine.progress().is_none());

    let routes = engine.routes();
    assert_eq!(routes.len(), 2);
    assert_eq!(routes[0].external_id(), Some("a"));
    assert_eq!(routes[1].external_id(), Some("c"));
    assert_eq!(colors(&routes), vec![PALETTE[0], PALETTE[1]]);
    assert_eq!(routes[0].name(), "Run");
    assert_eq!(routes[1].name(), "Ride");
    assert_eq!(routes[1].distance_km(), 20.0);

    assert_eq!(memory.write_count(), 1);
    assert_eq!(cache.load().routes, routes);
}

#[tokio::test]
async fn test_zero_records_on_empty_cache() {
    init_logging();
    let (memory, cache) = memory_cache();
    let source = FakeSource::new();
    let engine = engine_with(&source, &cache).await;

    let summary = engine.refresh_workouts().await.unwrap();

    assert_eq!(summary.fetched, 0);
    assert_eq!(engine.state(), SyncState::Empty);
    assert!(engine.routes().is_empty());
    assert!(engine.progress().is_none());
    assert_eq!(memory.write_count(), 0);
}

#[tokio::test]
async fn test_zero_records_with_cache_is_loaded() {
    let (_, cache) = memory_cache();
    cache.write_now(&CachedDocument::new(cached_routes(), None)).unwrap();
    let source = FakeSource::new();
    let engine = engine_with(&source, &cache).await;

    engine.refresh_workouts().await.unwrap();
    assert_eq!(engine.state(), SyncState::Loaded);
    assert_eq!(engine.routes(), cache.load().routes);
}

#[tokio::test]
async fn test_access_denied_keeps_cached_routes() {
    init_logging();
    let (memory, cache) = memory_cache();
    cache.write_now(&CachedDocument::new(cached_routes(), None)).unwrap();
    let before = cache.load().routes;

    let source = FakeSource::new();
    source.deny_access();
    source.push(record("a", ActivityKind::Running, 1, None), vec![path(47.0, 8.0, 4)]);

    let engine = engine_with(&source, &cache).await;
    let err = engine.refresh_workouts().await.unwrap_err();

    assert!(matches!(err, SyncError::AuthorizationDenied));
    assert_eq!(
        engine.state(),
        SyncState::Error(SyncError::AuthorizationDenied.user_message())
    );
    assert_eq!(engine.routes(), before);
    assert!(engine.progress().is_none());
    assert_eq!(source.fetch_calls(), 0);
    assert_eq!(memory.write_count(), 1);
}

#[tokio::test]
async fn test_denied_then_granted_requests_again() {
    let (_, cache) = memory_cache();
    let source = FakeSource::new();
    source.deny_access();
    source.push(record("a", ActivityKind::Hiking, 1, None), vec![path(46.0, 7.0, 4)]);
    let engine = engine_with(&source, &cache).await;

    assert!(engine.refresh_workouts().await.is_err());
    source.grant_access();
    engine.refresh_workouts().await.unwrap();

    assert_eq!(source.access_requests(), 2);
    assert_eq!(engine.state(), SyncState::Loaded);
    assert_eq!(engine.routes()[0].name(), "Hike");
}

#[tokio::test]
async fn test_access_requested_once_when_granted() {
    let (_, cache) = memory_cache();
    let source = FakeSource::new();
    source.push(record("a", ActivityKind::Running, 1, None), vec![path(46.0, 7.0, 4)]);
    let engine = engine_with(&source, &cache).await;

    engine.refresh_workouts().await.unwrap();
    engine.refresh_workouts().await.unwrap();

    assert_eq!(source.access_requests(), 1);
    assert_eq!(source.fetch_calls(), 2);
}

#[tokio::test]
async fn test_source_unavailable() {
    let (_, cache) = memory_cache();
    let source = FakeSource::new();
    source.set_unavailable();
    let engine = engine_with(&source, &cache).await;

    let err = engine.refresh_workouts().await.unwrap_err();
    assert!(matches!(err, SyncError::SourceUnavailable));
    assert_eq!(
        engine.state(),
        SyncState::Error(SyncError::SourceUnavailable.user_message())
    );
    assert_eq!(source.access_requests(), 0);
}

#[tokio::test]
async fn test_idempotent_resync() {
    let (memory, cache) = memory_cache();
    let source = FakeSource::new();
    source.push(record("a", ActivityKind::Running, 1, None), vec![path(47.0, 8.0, 4)]);
    source.push(record("b", ActivityKind::Swimming, 2, None), vec![path(47.1, 8.1, 4)]);
    let engine = engine_with(&source, &cache).await;

    engine.refresh_workouts().await.unwrap();
    let first = engine.routes();

    let summary = engine.refresh_workouts().await.unwrap();
    assert_eq!(summary.added, 0);
    assert_eq!(summary.already_known, 2);
    assert_eq!(engine.routes(), first);
    assert_eq!(engine.state(), SyncState::Loaded);

    // Nothing changed, nothing written
    assert_eq!(memory.write_count(), 1);
    // Known records are not re-fetched
    assert_eq!(source.sample_fetches(), 2);
}

#[tokio::test]
async fn test_superset_fetch_has_no_duplicates() {
    let (_, cache) = memory_cache();
    let source = FakeSource::new();
    source.push(record("a", ActivityKind::Running, 1, None), vec![path(47.0, 8.0, 4)]);
    source.push(record("b", ActivityKind::Running, 2, None), vec![path(47.1, 8.1, 4)]);
    let engine = engine_with(&source, &cache).await;
    engine.refresh_workouts().await.unwrap();
    let first = engine.routes();

    source.push(record("c", ActivityKind::Walking, 3, None), vec![path(47.2, 8.2, 4)]);
    source.push(record("d", ActivityKind::Rowing, 4, None), vec![path(47.3, 8.3, 4)]);
    engine.refresh_workouts().await.unwrap();

    let routes = engine.routes();
    assert_eq!(routes.len(), 4);
    let unique: HashSet<&str> = routes.iter().filter_map(Route::external_id).collect();
    assert_eq!(unique.len(), 4);

    // New routes lead, existing keep their ids and colors
    assert_eq!(routes[0].external_id(), Some("c"));
    assert_eq!(routes[1].external_id(), Some("d"));
    assert_eq!(&routes[2..], &first[..]);
    assert_eq!(colors(&routes[..2]), vec![PALETTE[2], PALETTE[3]]);
}

#[tokio::test]
async fn test_colors_stable_across_failed_refresh() {
    let (_, cache) = memory_cache();
    let source = FakeSource::new();
    source.push(record("a", ActivityKind::Running, 1, None), vec![path(47.0, 8.0, 4)]);
    source.push(record("b", ActivityKind::Running, 2, None), vec![path(47.1, 8.1, 4)]);
    let engine = engine_with(&source, &cache).await;
    engine.refresh_workouts().await.unwrap();
    let before = engine.routes();

    source.fail_fetch(Some(Failure::Transient));
    let err = engine.refresh_workouts().await.unwrap_err();
    assert!(matches!(err, SyncError::TransientFetchFailure { .. }));
    assert!(matches!(engine.state(), SyncState::Error(ref m) if m.contains("connection reset")));
    assert_eq!(engine.routes(), before);

    // Error is not terminal: the next refresh goes straight to loading
    source.fail_fetch(None);
    engine.refresh_workouts().await.unwrap();
    assert_eq!(engine.state(), SyncState::Loaded);
    assert_eq!(ids(&engine.routes()), ids(&before));
    assert_eq!(colors(&engine.routes()), colors(&before));
    assert_eq!(source.access_requests(), 1);
}

#[tokio::test]
async fn test_sample_failure_skips_record() {
    init_logging();
    let (_, cache) = memory_cache();
    let source = FakeSource::new();
    source.push(record("a", ActivityKind::Running, 1, None), vec![path(47.0, 8.0, 4)]);
    source.push(record("b", ActivityKind::Running, 2, None), vec![path(47.1, 8.1, 4)]);
    source.push(record("c", ActivityKind::Running, 3, None), vec![path(47.2, 8.2, 4)]);
    source.fail_samples("b", Failure::Transient);
    let engine = engine_with(&source, &cache).await;

    let summary = engine.refresh_workouts().await.unwrap();
    assert_eq!(summary.added, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(engine.state(), SyncState::Loaded);
    assert_eq!(colors(&engine.routes()), vec![PALETTE[0], PALETTE[1]]);

    // The failed record is not known yet, so the next refresh picks it up
    source.clear_sample_failures();
    let retry = engine.refresh_workouts().await.unwrap();
    assert_eq!(retry.added, 1);
    assert_eq!(retry.already_known, 2);
    let routes = engine.routes();
    assert_eq!(routes[0].external_id(), Some("b"));
    assert_eq!(routes[0].color(), PALETTE[2]);
}

#[tokio::test]
async fn test_fatal_sample_failure_restores_collection() {
    let (memory, cache) = memory_cache();
    let source = FakeSource::new();
    source.push(record("a", ActivityKind::Running, 1, None), vec![path(47.0, 8.0, 4)]);
    source.push(record("b", ActivityKind::Running, 2, None), vec![path(47.1, 8.1, 4)]);
    source.fail_samples("b", Failure::Denied);
    let engine = engine_with(&source, &cache).await;

    let err = engine.refresh_workouts().await.unwrap_err();
    assert!(matches!(err, SyncError::AuthorizationDenied));
    assert!(engine.routes().is_empty());
    assert!(engine.progress().is_none());
    assert!(matches!(engine.state(), SyncState::Error(_)));
    assert_eq!(memory.write_count(), 0);
}

#[tokio::test]
async fn test_concurrent_refresh_is_single_flight() {
    let (_, cache) = memory_cache();
    let source = FakeSource::new();
    source.set_fetch_delay(Duration::from_millis(100));
    source.push(record("a", ActivityKind::Running, 1, None), vec![path(47.0, 8.0, 4)]);
    let engine = engine_with(&source, &cache).await;

    let (first, second) = tokio::join!(engine.refresh_workouts(), engine.refresh_workouts());
    let first = first.unwrap();
    let second = second.unwrap();

    assert!(!first.skipped_in_flight);
    assert!(second.skipped_in_flight);
    assert_eq!(source.fetch_calls(), 1);
    assert_eq!(engine.route_count(), 1);

    // Guard released afterwards
    assert!(!engine.refresh_workouts().await.unwrap().skipped_in_flight);
}

#[tokio::test]
async fn test_operation_timeout_is_error() {
    let (_, cache) = memory_cache();
    let source = FakeSource::new();
    source.set_fetch_delay(Duration::from_millis(500));
    let config = SyncConfig::default().with_timeout(Duration::from_millis(20));
    let engine = SyncEngine::new(source.clone(), cache, config).await;

    let err = engine.refresh_workouts().await.unwrap_err();
    assert!(matches!(err, SyncError::Timeout { operation: "workout fetch" }));
    assert_eq!(
        engine.state(),
        SyncState::Error(err.user_message())
    );
}

#[tokio::test]
async fn test_incremental_fetch_dedups_boundary() {
    let (_, cache) = memory_cache();
    let source = FakeSource::new();
    source.push(record("a", ActivityKind::Running, 1, None), vec![path(47.0, 8.0, 4)]);
    source.push(record("b", ActivityKind::Running, 2, None), vec![path(47.1, 8.1, 4)]);
    let config = SyncConfig::default().incremental();
    let engine = SyncEngine::new(source.clone(), cache, config).await;

    engine.refresh_workouts().await.unwrap();
    assert!(source.last_since().is_none());

    source.push(record("c", ActivityKind::Running, 3, None), vec![path(47.2, 8.2, 4)]);
    let summary = engine.refresh_workouts().await.unwrap();

    assert_eq!(source.last_since(), Some(record("b", ActivityKind::Running, 2, None).start_time));
    assert_eq!(summary.fetched, 2);
    assert_eq!(summary.already_known, 1);
    assert_eq!(summary.added, 1);
    assert_eq!(engine.route_count(), 3);
    assert_eq!(engine.routes()[0].color(), PALETTE[2]);
}

#[tokio::test]
async fn test_startup_shows_cache_before_source_access() {
    let (_, cache) = memory_cache();
    let region = ViewportRegion::new(47.37, 8.54, 0.2, 0.2);
    cache
        .write_now(&CachedDocument::new(cached_routes(), Some(region)))
        .unwrap();
    let source = FakeSource::new();

    let engine = engine_with(&source, &cache).await;

    assert_eq!(engine.state(), SyncState::Loaded);
    assert_eq!(engine.route_count(), 2);
    assert_eq!(engine.viewport(), Some(region));
    assert_eq!(source.access_requests(), 0);
    assert_eq!(source.fetch_calls(), 0);
}

#[tokio::test]
async fn test_saved_document_carries_last_viewport() {
    let (_, cache) = memory_cache();
    let source = FakeSource::new();
    source.push(record("a", ActivityKind::Running, 1, None), vec![path(47.0, 8.0, 4)]);
    let engine = engine_with(&source, &cache).await;

    let region = ViewportRegion::new(47.0, 8.0, 0.05, 0.05);
    engine.record_viewport(region);
    engine.refresh_workouts().await.unwrap();

    let doc = cache.load();
    assert_eq!(doc.routes.len(), 1);
    assert_eq!(doc.viewport, Some(region));
}

#[tokio::test]
async fn test_distance_falls_back_to_estimate() {
    let (_, cache) = memory_cache();
    let source = FakeSource::new();
    source.push(
        record("eq", ActivityKind::Other, 1, None),
        vec![vec![GpsPoint::new(0.0, 0.0)], vec![GpsPoint::new(0.0, 1.0)]],
    );
    let engine = engine_with(&source, &cache).await;
    engine.refresh_workouts().await.unwrap();

    let route = &engine.routes()[0];
    assert_eq!(route.name(), "Workout");
    assert!((route.distance_km() - 111.19).abs() / 111.19 < 0.005);
}

#[tokio::test]
async fn test_subscriber_sees_final_snapshot() {
    let (_, cache) = memory_cache();
    let source = FakeSource::new();
    source.push(record("a", ActivityKind::Running, 1, None), vec![path(47.0, 8.0, 4)]);
    let engine = engine_with(&source, &cache).await;
    let mut rx = engine.subscribe();

    engine.refresh_workouts().await.unwrap();

    assert!(rx.has_changed().unwrap());
    let snapshot = rx.borrow_and_update().clone();
    assert_eq!(snapshot.state, SyncState::Loaded);
    assert_eq!(snapshot.routes.len(), 1);
    assert!(snapshot.progress.is_none());
}

#[tokio::test]
async fn test_subscriber_sees_each_incremental_step() {
    init_logging();
    let (_, cache) = memory_cache();
    let cached = Route::new("Morning Loop", 5.2, None, path(47.37, 8.54, 10), RouteColor::Blue);
    cache.write_now(&CachedDocument::new(vec![cached.clone()], None)).unwrap();

    let source = FakeSource::new();
    source.push(record("a", ActivityKind::Running, 1, None), vec![path(47.0, 8.0, 4)]);
    source.push(record("b", ActivityKind::Walking, 2, None), vec![path(47.1, 8.1, 4)]);
    source.push(record("c", ActivityKind::Cycling, 3, None), vec![path(47.2, 8.2, 4)]);
    source.set_access_delay(Duration::from_millis(10));
    source.set_sample_delay(Duration::from_millis(10));

    let config = SyncConfig {
        sample_concurrency: 1,
        ..SyncConfig::default()
    };
    let engine = SyncEngine::new(source.clone(), cache.clone(), config).await;
    let mut rx = engine.subscribe();

    let collector = tokio::spawn(async move {
        let mut seen = Vec::new();
        while rx.changed().await.is_ok() {
            let snapshot = rx.borrow_and_update().clone();
            let done = snapshot.state == SyncState::Loaded;
            seen.push(snapshot);
            if done {
                break;
            }
        }
        seen
    });

    engine.refresh_workouts().await.unwrap();
    let seen = tokio::time::timeout(Duration::from_secs(5), collector)
        .await
        .unwrap()
        .unwrap();

    let mut states: Vec<SyncState> = seen.iter().map(|s| s.state.clone()).collect();
    states.dedup();
    assert_eq!(
        states,
        vec![SyncState::RequestingAccess, SyncState::Loading, SyncState::Loaded]
    );

    // The last increment and the Loaded publish happen without a yield between them
    let loaded: Vec<usize> = seen
        .iter()
        .filter_map(|s| s.progress)
        .inspect(|p| assert_eq!(p.total, 3))
        .map(|p| p.loaded)
        .collect();
    assert_eq!(loaded, vec![0, 1, 2]);

    let counts: Vec<usize> = seen.iter().map(|s| s.routes.len()).collect();
    assert_eq!(counts, vec![1, 1, 2, 3, 4]);
    for pair in seen.windows(2) {
        let (before, after) = (&pair[0].routes, &pair[1].routes);
        assert_eq!(after.last(), Some(&cached));
        let fresh = before.len() - 1;
        assert_eq!(after[..fresh], before[..fresh]);
    }

    let last = seen.last().unwrap();
    assert!(last.progress.is_none());
    let external: Vec<Option<&str>> = last.routes.iter().map(Route::external_id).collect();
    assert_eq!(external, vec![Some("a"), Some("b"), Some("c"), None]);
    assert_eq!(last.routes, engine.routes());
}

#[tokio::test]
async fn test_file_backed_restart() {
    let dir = TempDir::new().unwrap();
    let source = FakeSource::new();
    source.push(record("a", ActivityKind::Running, 1, None), vec![path(47.0, 8.0, 4)]);
    source.push(record("b", ActivityKind::Cycling, 2, None), vec![path(47.1, 8.1, 4)]);

    let first_routes = {
        let cache = RouteCacheStore::new(Arc::new(FileStore::new(dir.path())));
        let engine = engine_with(&source, &cache).await;
        engine.refresh_workouts().await.unwrap();
        engine.routes()
    };

    let cache = RouteCacheStore::new(Arc::new(FileStore::new(dir.path())));
    let engine = engine_with(&source, &cache).await;
    assert_eq!(engine.state(), SyncState::Loaded);
    assert_eq!(engine.routes(), first_routes);

    // Re-sync after restart adds nothing and keeps colors
    let summary = engine.refresh_workouts().await.unwrap();
    assert_eq!(summary.added, 0);
    assert_eq!(colors(&engine.routes()), colors(&first_routes));
}
