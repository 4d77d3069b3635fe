//! End-to-end tests of the enqueue, flush and read cycle.

mod common;

use common::{fast_config, FlakyStore, GatedStore, SlowStore};
use statz_core::{
    dimensions, Dimensions, Enqueued, FlushMode, MemoryRowStore, PlayerId, RefreshMode, RowRequirement,
    RowStore, SchemaRegistry, SqliteRowStore, StatKind, StatValue, StatzConfig, StatzError, StatzService,
    UpdateKey,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn walk(world: &str) -> Dimensions {
    dimensions([("moveType", "WALK"), ("world", world)])
}

#[tokio::test]
async fn test_distance_sums_before_flush() {
    let store = Arc::new(MemoryRowStore::new());
    let service = StatzService::new(&StatzConfig::default(), store.clone()).unwrap();
    let api = service.api();
    let player = PlayerId::new();

    api.set_player_info(player, StatKind::DistanceTravelled, walk("world"), 5.0).unwrap();
    api.set_player_info(player, StatKind::DistanceTravelled, walk("world"), 3.0).unwrap();
    assert_eq!(service.queue().len(), 1);

    api.flush_now().await.unwrap();

    assert_eq!(store.rows_written(), 1);
    let info = api
        .get_player_info(player, StatKind::DistanceTravelled, &[RowRequirement::new("moveType", "WALK")])
        .await
        .unwrap();
    assert_eq!(info.total_value(), 8.0);
}

#[tokio::test]
async fn test_current_world_replaces() {
    let service = StatzService::new(&StatzConfig::default(), Arc::new(MemoryRowStore::new())).unwrap();
    let api = service.api();
    let player = PlayerId::new();

    api.set_player_info(player, StatKind::CurrentWorld, Dimensions::new(), "world_nether").unwrap();
    api.set_player_info(player, StatKind::CurrentWorld, Dimensions::new(), "world").unwrap();
    api.flush_now().await.unwrap();

    let info = api.get_player_info(player, StatKind::CurrentWorld, &[]).await.unwrap();
    assert_eq!(info.text_value(), Some("world"));
}

#[tokio::test]
async fn test_reads_do_not_see_unflushed_updates() {
    let service = StatzService::new(&StatzConfig::default(), Arc::new(MemoryRowStore::new())).unwrap();
    let api = service.api();
    let player = PlayerId::new();

    api.set_player_info(player, StatKind::Joins, Dimensions::new(), 1.0).unwrap();
    let before = api.get_player_info(player, StatKind::Joins, &[]).await.unwrap();
    assert!(!before.has_rows());

    api.flush_now().await.unwrap();
    assert_eq!(api.total(player, StatKind::Joins, &[]).await.unwrap(), 1.0);
}

#[tokio::test]
async fn test_eager_refresh_keeps_cached_rows_current() {
    let service = StatzService::new(&StatzConfig::default(), Arc::new(MemoryRowStore::new())).unwrap();
    let api = service.api();
    let player = PlayerId::new();

    api.set_player_info(player, StatKind::Joins, Dimensions::new(), 1.0).unwrap();
    api.flush_now().await.unwrap();
    assert_eq!(api.total(player, StatKind::Joins, &[]).await.unwrap(), 1.0);

    api.set_player_info(player, StatKind::Joins, Dimensions::new(), 1.0).unwrap();
    api.flush_now().await.unwrap();

    let cached = api.cached_player_info(player, StatKind::Joins, &[]).unwrap();
    assert_eq!(cached.total_value(), 2.0);
    assert!(service.cache().get(player, StatKind::Joins).unwrap().is_fresh());
}

#[tokio::test]
async fn test_lazy_refresh_reloads_on_next_read() {
    let config = StatzConfig {
        cache_refresh: RefreshMode::Lazy,
        ..Default::default()
    };
    let service = StatzService::new(&config, Arc::new(MemoryRowStore::new())).unwrap();
    let api = service.api();
    let player = PlayerId::new();

    api.set_player_info(player, StatKind::Votes, Dimensions::new(), 1.0).unwrap();
    api.flush_now().await.unwrap();
    assert_eq!(api.total(player, StatKind::Votes, &[]).await.unwrap(), 1.0);

    api.set_player_info(player, StatKind::Votes, Dimensions::new(), 4.0).unwrap();
    api.flush_now().await.unwrap();
    assert!(!service.cache().get(player, StatKind::Votes).unwrap().is_fresh());

    assert_eq!(api.total(player, StatKind::Votes, &[]).await.unwrap(), 5.0);
}

#[tokio::test]
async fn test_failed_write_is_retried_once_and_persists() {
    let store = Arc::new(FlakyStore::new(1));
    let service = StatzService::new(&StatzConfig::default(), store.clone()).unwrap();
    let api = service.api();
    let player = PlayerId::new();

    api.set_player_info(player, StatKind::Joins, Dimensions::new(), 1.0).unwrap();

    let first = service.scheduler().flush(FlushMode::Periodic).await.unwrap();
    assert_eq!(first.requeued, 1);
    let key = UpdateKey {
        player_id: player,
        kind: StatKind::Joins,
        dimensions: Dimensions::new(),
    };
    assert_eq!(service.queue().peek(&key).unwrap().retries, 1);

    let second = service.scheduler().flush(FlushMode::Periodic).await.unwrap();
    assert_eq!(second.persisted, 1);
    assert_eq!(api.total(player, StatKind::Joins, &[]).await.unwrap(), 1.0);
    assert_eq!(service.scheduler().stats().records_requeued, 1);
}

#[tokio::test]
async fn test_updates_arriving_during_retry_merge_in_order() {
    let store = Arc::new(FlakyStore::new(1));
    let service = StatzService::new(&StatzConfig::default(), store.clone()).unwrap();
    let api = service.api();
    let player = PlayerId::new();

    api.set_player_info(player, StatKind::CurrentWorld, Dimensions::new(), "world").unwrap();
    service.scheduler().flush(FlushMode::Periodic).await.unwrap();
    api.set_player_info(player, StatKind::CurrentWorld, Dimensions::new(), "world_the_end").unwrap();

    service.scheduler().flush(FlushMode::Periodic).await.unwrap();
    let info = api.get_player_info(player, StatKind::CurrentWorld, &[]).await.unwrap();
    assert_eq!(info.text_value(), Some("world_the_end"));
}

#[tokio::test]
async fn test_records_dropped_after_max_retries() {
    let service = StatzService::new(&fast_config(1), Arc::new(FlakyStore::always_failing())).unwrap();
    let api = service.api();

    api.set_player_info(PlayerId::new(), StatKind::Joins, Dimensions::new(), 1.0).unwrap();
    api.set_player_info(PlayerId::new(), StatKind::Joins, Dimensions::new(), 1.0).unwrap();

    let err = api.flush_now().await.unwrap_err();
    assert!(matches!(err, StatzError::UnpersistedRecords { requeued: 2, dropped: 0 }));
    let err = api.flush_now().await.unwrap_err();
    assert!(matches!(err, StatzError::UnpersistedRecords { requeued: 0, dropped: 2 }));

    assert!(service.queue().is_empty());
    assert_eq!(service.scheduler().stats().records_dropped, 2);
}

#[tokio::test]
async fn test_shutdown_with_empty_queue_runs_one_final_flush() {
    let store = Arc::new(MemoryRowStore::new());
    let service = StatzService::new(&fast_config(3), store.clone()).unwrap();

    let flusher = service.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let report = flusher.shutdown().await.unwrap();

    assert_eq!(report.mode, FlushMode::Final);
    assert_eq!(report.drained, 0);
    assert_eq!(store.write_calls(), 0);
    assert_eq!(service.scheduler().stats().final_flushes, 1);

    let late = service
        .api()
        .set_player_info(PlayerId::new(), StatKind::Joins, Dimensions::new(), 1.0)
        .unwrap();
    assert_eq!(late, Enqueued::Ignored);
}

#[tokio::test]
async fn test_shutdown_persists_pending_updates() {
    let store = Arc::new(MemoryRowStore::new());
    let config = StatzConfig {
        flush_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let service = StatzService::new(&config, store.clone()).unwrap();
    let flusher = service.start();
    let player = PlayerId::new();

    service
        .api()
        .set_player_info(player, StatKind::Deaths, dimensions([("world", "world")]), 1.0)
        .unwrap();
    let report = flusher.shutdown().await.unwrap();

    assert_eq!(report.persisted, 1);
    let rows = store.read_all(player, StatKind::Deaths).await.unwrap();
    assert_eq!(rows[0].value, StatValue::Number(1.0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_with_background_flushing() {
    let store = Arc::new(MemoryRowStore::new());
    let service = StatzService::new(&fast_config(3), store.clone()).unwrap();
    let flusher = service.start();
    let players: Vec<PlayerId> = (0..10).map(|_| PlayerId::new()).collect();

    let mut producers = Vec::new();
    for _ in 0..4 {
        let api = service.api();
        let players = players.clone();
        producers.push(tokio::spawn(async move {
            for i in 0..500 {
                let player = players[i % players.len()];
                api.set_player_info(player, StatKind::Joins, Dimensions::new(), 1.0).unwrap();
                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }
    flusher.shutdown().await.unwrap();

    let api = service.api();
    let mut total = 0.0;
    for player in &players {
        total += api.total(*player, StatKind::Joins, &[]).await.unwrap();
    }
    assert_eq!(total, 2000.0);
    assert!(service.scheduler().stats().max_in_flight <= 1);
}

#[tokio::test]
async fn test_disabled_statistic_is_ignored() {
    let config = StatzConfig {
        disabled_stats: vec![StatKind::Votes],
        ..Default::default()
    };
    let store = Arc::new(MemoryRowStore::new());
    let service = StatzService::new(&config, store.clone()).unwrap();
    let api = service.api();

    let outcome = api.set_player_info(PlayerId::new(), StatKind::Votes, Dimensions::new(), 1.0).unwrap();
    assert_eq!(outcome, Enqueued::Ignored);
    api.flush_now().await.unwrap();
    assert_eq!(store.write_calls(), 0);
}

#[tokio::test]
async fn test_schema_violation_is_rejected() {
    let service = StatzService::new(&StatzConfig::default(), Arc::new(MemoryRowStore::new())).unwrap();
    let api = service.api();

    let err = api
        .set_player_info(PlayerId::new(), StatKind::Deaths, Dimensions::new(), 1.0)
        .unwrap_err();
    assert!(err.is_programmer_error());
    let err = api
        .set_player_info(PlayerId::new(), StatKind::Joins, Dimensions::new(), "one")
        .unwrap_err();
    assert!(matches!(err, StatzError::SchemaViolation { .. }));
}

#[tokio::test]
async fn test_load_racing_flush_does_not_install_stale_rows() {
    let store = Arc::new(GatedStore::new());
    let service = StatzService::new(&StatzConfig::default(), store.clone()).unwrap();
    let api = service.api();
    let player = PlayerId::new();

    api.set_player_info(player, StatKind::Joins, Dimensions::new(), 3.0).unwrap();
    api.flush_now().await.unwrap();

    store.hold_reads(true);
    let reader = {
        let api = api.clone();
        tokio::spawn(async move { api.total(player, StatKind::Joins, &[]).await })
    };
    store.read_entered.notified().await;
    store.hold_reads(false);

    api.set_player_info(player, StatKind::Joins, Dimensions::new(), 2.0).unwrap();
    api.flush_now().await.unwrap();
    store.release.notify_one();

    assert_eq!(reader.await.unwrap().unwrap(), 3.0);
    assert!(api.cached_player_info(player, StatKind::Joins, &[]).is_none());
    assert_eq!(api.total(player, StatKind::Joins, &[]).await.unwrap(), 5.0);
}

#[tokio::test]
async fn test_sqlite_round_trip_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("statz.db");
    let config = StatzConfig::default();
    let player = PlayerId::new();

    {
        let registry = Arc::new(config.build_registry().unwrap());
        let store = Arc::new(SqliteRowStore::open(&path, registry).unwrap());
        let service = StatzService::new(&config, store).unwrap();
        let api = service.api();
        let flusher = service.start();

        api.set_player_info(player, StatKind::DistanceTravelled, walk("world"), 5.0).unwrap();
        api.set_player_info(player, StatKind::DistanceTravelled, walk("world"), 3.0).unwrap();
        api.set_player_info(player, StatKind::DistanceTravelled, walk("world_nether"), 1.5).unwrap();
        api.set_player_info(player, StatKind::HighestAltitude, dimensions([("world", "world")]), 120.0).unwrap();
        api.set_player_info(player, StatKind::HighestAltitude, dimensions([("world", "world")]), 80.0).unwrap();
        flusher.shutdown().await.unwrap();
    }

    let store = SqliteRowStore::open(&path, Arc::new(SchemaRegistry::builtin())).unwrap();
    let rows = store.read_all(player, StatKind::DistanceTravelled).await.unwrap();
    assert_eq!(rows.len(), 2);
    let overworld = rows.iter().find(|r| r.dimension("world") == Some("world")).unwrap();
    assert_eq!(overworld.value, StatValue::Number(8.0));

    let altitude = store.read_all(player, StatKind::HighestAltitude).await.unwrap();
    assert_eq!(altitude[0].value, StatValue::Number(120.0));
}

#[tokio::test]
async fn test_flush_now_timeout_does_not_lose_drained_updates() {
    let store = Arc::new(SlowStore::new(Duration::from_millis(200)));
    let service = StatzService::new(&StatzConfig::default(), store.clone()).unwrap();
    let api = service.api();
    let player = PlayerId::new();

    api.set_player_info(player, StatKind::Joins, Dimensions::new(), 1.0).unwrap();
    let timed_out = tokio::time::timeout(Duration::from_millis(50), api.flush_now()).await;
    assert!(timed_out.is_err());
    assert!(service.queue().is_empty());

    api.flush_now().await.unwrap();

    assert_eq!(store.inner.rows_written(), 1);
    assert_eq!(api.total(player, StatKind::Joins, &[]).await.unwrap(), 1.0);
    assert_eq!(service.scheduler().stats().in_flight, 0);
}
