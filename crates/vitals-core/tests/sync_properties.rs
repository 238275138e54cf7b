//! End-to-end behavior of the engine over the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use time::Duration as TimeDuration;
use time::macros::{date, datetime};
use tracing_subscriber::EnvFilter;

use vitals_core::mock::{MockBackend, MockHealthSource};
use vitals_core::{
    AppActivity, AuthContext, DeviceCharacteristics, Engine, EngineBuilder, EngineConfig,
    ManualClock, PromptReason, PushOutcome, Session,
};
use vitals_store::{KeyValueStore, MemoryStore};
use vitals_types::{DailyMetrics, Freshness, Platform, SyncStrategy};

struct Harness {
    backend: Arc<MockBackend>,
    health: Arc<MockHealthSource>,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    engine: Engine,
}

fn harness() -> Harness {
    harness_with(EngineConfig::default())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness_with(config: EngineConfig) -> Harness {
    init_tracing();
    let backend = Arc::new(MockBackend::new());
    let health = Arc::new(MockHealthSource::new(Platform::Ios));
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(datetime!(2024-05-20 09:00 UTC)));

    let engine = EngineBuilder::new(config)
        .store(store.clone())
        .backend(backend.clone())
        .health_source(health.clone())
        .clock(clock.clone())
        .characteristics(DeviceCharacteristics::new(Platform::Ios, "iPhone15,2", "Apple"))
        .context(AuthContext::signed_in(Session::new("42", "token")))
        .build()
        .unwrap();

    Harness {
        backend,
        health,
        store,
        clock,
        engine,
    }
}

async fn registered(h: &Harness, batch_days: u32) {
    h.engine.gate().register_device("42", true).await.unwrap();
    h.engine
        .scheduler()
        .initialize_sync(h.engine.sync_config("42", "token").batch_days(batch_days))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn overlapping_syncs_run_once() {
    let h = harness();
    registered(&h, 1).await;
    h.backend.set_latency(Duration::from_millis(50));
    let validations = h.backend.validate_count();

    let scheduler = h.engine.scheduler();
    let results = join_all((0..3).map(|_| scheduler.perform_smart_sync())).await;

    assert_eq!(h.backend.validate_count() - validations, 1);
    let rejected = results
        .iter()
        .filter(|r| r.is_concurrency_rejection())
        .count();
    assert_eq!(rejected, 2);
    assert!(results.iter().any(|r| r.success));
    assert_eq!(h.backend.uploads().len(), 1);
}

#[tokio::test]
async fn first_sync_backfills_then_goes_incremental() {
    let h = harness();
    registered(&h, 7).await;

    let first = h.engine.scheduler().perform_smart_sync().await;
    assert_eq!(first.strategy, Some(SyncStrategy::FirstTime));
    assert_eq!(h.health.requested_dates().len(), 7);
    assert_eq!((first.synced_days, first.failed_days), (7, 0));
    assert!(h.backend.uploads().iter().all(|u| u.user_id == "42"));

    h.health.reset_counters();
    let second = h.engine.scheduler().perform_smart_sync().await;
    assert_eq!(second.strategy, Some(SyncStrategy::Incremental));
    assert_eq!(h.health.requested_dates(), vec![date!(2024 - 05 - 20)]);
}

#[tokio::test(start_paused = true)]
async fn failed_upload_is_isolated_to_its_day() {
    let h = harness();
    registered(&h, 7).await;
    h.backend.fail_push_for(date!(2024 - 05 - 16));

    let result = h.engine.scheduler().perform_smart_sync().await;

    assert!(result.success);
    assert_eq!((result.synced_days, result.failed_days), (6, 1));
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].date.as_deref(), Some("2024-05-16"));
    assert_eq!(h.backend.uploads().len(), 6);
}

#[tokio::test]
async fn uploads_carry_device_and_platform() {
    let h = harness();
    registered(&h, 2).await;
    h.engine.scheduler().perform_smart_sync().await;

    let device_id = h.engine.identity().device_id();
    for upload in h.backend.uploads() {
        assert_eq!(upload.device_identifier, device_id);
        assert_eq!(upload.source_platform, Platform::Ios);
    }
}

#[tokio::test]
async fn unregistered_device_never_reads_health_data() {
    let h = harness();
    h.engine
        .scheduler()
        .initialize_sync(h.engine.sync_config("42", "token"))
        .await
        .unwrap();

    let result = h.engine.scheduler().perform_smart_sync().await;
    assert!(!result.success);
    assert_eq!(h.health.read_count(), 0);
    assert_eq!(h.backend.push_count(), 0);
}

#[tokio::test]
async fn consent_withdrawal_blocks_sync() {
    let h = harness();
    registered(&h, 1).await;
    h.engine
        .gate()
        .update_health_data_permission("42", false)
        .await
        .unwrap();

    assert!(!h.engine.gate().is_sync_allowed("42").await);
    let result = h.engine.scheduler().perform_smart_sync().await;
    assert!(!result.success);
    assert_eq!(h.backend.push_count(), 0);
}

#[tokio::test]
async fn validation_fails_closed_when_offline() {
    let h = harness();
    registered(&h, 1).await;
    h.backend.set_offline(true);

    let validation = h.engine.gate().validate_device_registration("42").await;
    assert!(!validation.is_registered);
    assert!(!h.engine.gate().is_sync_allowed("42").await);
}

#[tokio::test]
async fn reregistration_reuses_the_device_row() {
    let h = harness();
    let first = h.engine.gate().register_device("42", true).await.unwrap();
    let second = h.engine.gate().register_device("42", false).await.unwrap();

    assert!(first.is_new_device);
    assert!(!second.is_new_device);
    assert_eq!(first.device.id, second.device.id);
    let devices = h.backend.devices_for("42");
    assert_eq!(devices.len(), 1);
    assert!(!devices[0].health_data_enabled);
}

#[test]
fn device_id_is_stable_across_engines_on_one_store() {
    let h = harness();
    let id = h.engine.identity().device_id();
    assert_eq!(h.engine.identity().device_id(), id);

    let rebuilt = EngineBuilder::new(EngineConfig::default())
        .store(h.store.clone())
        .backend(Arc::new(MockBackend::new()))
        .characteristics(DeviceCharacteristics::new(Platform::Ios, "iPhone15,2", "Apple"))
        .build()
        .unwrap();
    assert_eq!(rebuilt.identity().device_id(), id);
}

#[tokio::test]
async fn backend_denial_overrides_local_signals() {
    let h = harness();
    h.backend.set_permission("42", true, Some(Platform::Ios));
    assert!(
        !h.engine
            .permissions()
            .check_permission_status("42")
            .await
            .should_prompt
    );

    h.backend.set_permission("42", false, Some(Platform::Ios));
    h.health.set_os_permission(Some(true));
    let check = h.engine.permissions().check_permission_status("42").await;
    assert!(check.should_prompt);
    assert_eq!(check.reason, PromptReason::BackendDenied);
}

#[tokio::test]
async fn offline_permission_trust_is_bounded() {
    let h = harness();
    assert!(h.engine.permissions().update_permission_status("42", true).await);
    h.backend.set_permission_offline(true);

    let check = h.engine.permissions().check_permission_status("42").await;
    assert_eq!(check.reason, PromptReason::OfflineCacheTrusted);

    h.clock.advance(Duration::from_secs(73 * 3600));
    let check = h.engine.permissions().check_permission_status("42").await;
    assert!(check.should_prompt);
    assert_eq!(check.reason, PromptReason::Undetermined);
}

#[test]
fn cache_freshness_follows_the_clock() {
    let h = harness();
    let cache = h.engine.cache();
    let today = date!(2024 - 05 - 20);
    cache.cache_snapshot(today, DailyMetrics::default()).unwrap();

    assert_eq!(cache.get_with_freshness(today).freshness, Freshness::Fresh);
    h.clock.advance(Duration::from_secs(6 * 60));
    assert_eq!(cache.get_with_freshness(today).freshness, Freshness::Stale);
    h.clock.advance(Duration::from_secs(10 * 60));
    assert_eq!(cache.get_with_freshness(today).freshness, Freshness::Old);
}

#[test]
fn prune_keeps_the_retention_window() {
    let h = harness();
    let cache = h.engine.cache();
    let today = date!(2024 - 05 - 20);
    cache
        .cache_snapshot(today - TimeDuration::days(40), DailyMetrics::default())
        .unwrap();
    cache
        .cache_snapshot(today - TimeDuration::days(10), DailyMetrics::default())
        .unwrap();

    assert_eq!(h.engine.prune_cache().unwrap(), 1);
    assert!(cache.get_with_freshness(today - TimeDuration::days(40)).data.is_none());
    assert!(cache.get_with_freshness(today - TimeDuration::days(10)).data.is_some());
    assert!(h.store.keys_with_prefix("health_cache_").unwrap().len() == 1);
}

#[tokio::test(start_paused = true)]
async fn live_reads_coalesce_into_one_refresh() {
    let h = harness();
    h.engine.gate().register_device("42", true).await.unwrap();
    let live = h.engine.live();

    for _ in 0..5 {
        let metrics = live.live_metrics();
        assert!(metrics.needs_refresh);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(h.health.read_count(), 1);
    let metrics = live.live_metrics();
    assert_eq!(metrics.freshness, Freshness::Fresh);
    assert!(!metrics.refresh_scheduled);
}

#[tokio::test(start_paused = true)]
async fn background_reads_do_not_refresh() {
    let h = harness();
    h.engine.lifecycle().set(AppActivity::Background);

    let metrics = h.engine.live().live_metrics();
    assert!(metrics.needs_refresh);
    assert!(!metrics.refresh_scheduled);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.health.read_count(), 0);
}

#[tokio::test]
async fn live_push_reports_failures() {
    let h = harness();
    h.engine.gate().register_device("42", true).await.unwrap();
    let live = h.engine.live();
    assert_eq!(live.sync_to_database().await, PushOutcome::NothingToPush);

    assert!(live.refresh_data().await);
    assert_eq!(live.sync_to_database().await, PushOutcome::Pushed);

    h.backend.set_offline(true);
    assert!(matches!(
        live.sync_to_database().await,
        PushOutcome::Failed(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn timer_restarts_on_reinitialize() {
    let h = harness();
    h.engine.gate().register_device("42", true).await.unwrap();
    let scheduler = h.engine.scheduler();
    scheduler
        .initialize_sync(h.engine.sync_config("42", "token").interval_minutes(10))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(8 * 60)).await;
    scheduler
        .initialize_sync(h.engine.sync_config("42", "token").interval_minutes(10))
        .await
        .unwrap();

    // The first timer would have fired at minute 10.
    tokio::time::sleep(Duration::from_secs(4 * 60)).await;
    assert_eq!(h.health.read_count(), 0);

    tokio::time::sleep(Duration::from_secs(7 * 60)).await;
    assert_eq!(h.health.read_count(), 1);
    h.engine.shutdown();
}

#[test]
fn freshness_thresholds_come_from_config() {
    let mut config = EngineConfig::default();
    config.cache.fresh_minutes = 1;
    config.cache.stale_minutes = 2;
    let h = harness_with(config);
    let today = date!(2024 - 05 - 20);
    h.engine
        .cache()
        .cache_snapshot(today, DailyMetrics::default())
        .unwrap();

    h.clock.advance(Duration::from_secs(90));
    assert_eq!(
        h.engine.cache().get_with_freshness(today).freshness,
        Freshness::Stale
    );
    h.clock.advance(Duration::from_secs(60));
    assert_eq!(
        h.engine.cache().get_with_freshness(today).freshness,
        Freshness::Old
    );
}

#[tokio::test]
async fn live_controller_respects_withdrawn_consent() {
    let h = harness();
    h.engine.gate().register_device("42", true).await.unwrap();
    h.engine
        .gate()
        .update_health_data_permission("42", false)
        .await
        .unwrap();
    assert!(!h.engine.gate().is_sync_allowed("42").await);

    let live = h.engine.live();
    assert!(!live.refresh_data().await);
    assert!(matches!(
        live.sync_to_database().await,
        PushOutcome::Failed(_)
    ));
    assert_eq!(h.health.read_count(), 0);
    assert!(h.backend.uploads().is_empty());
}

#[tokio::test]
async fn daily_syncs_keep_the_cache_within_retention() {
    let h = harness();
    registered(&h, 1).await;

    for _ in 0..60 {
        let result = h.engine.scheduler().sync_today_data().await;
        assert!(result.success);
        h.clock.advance(Duration::from_secs(24 * 3600));
    }

    // Today plus the 30 days before it.
    let entries = h.store.keys_with_prefix("health_cache_").unwrap();
    assert_eq!(entries.len(), 31);
    h.engine.shutdown();
}
