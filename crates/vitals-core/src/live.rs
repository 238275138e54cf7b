//! Cache-first serving of today's metrics.
//!
//! [`LiveMetricsController::live_metrics`] always answers from the cache
//! immediately. When the answer is stale and the app is in the foreground,
//! it also schedules a refresh after a short settle time; further calls
//! during that window push the refresh back, so a burst of reads causes a
//! single health-store query.
//!
//! Both the refresh and the push go through the
//! [`DeviceAuthorizationGate`] first, like every scheduled sync.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use vitals_types::{CachedMetricSnapshot, Freshness};

use crate::authorization::DeviceAuthorizationGate;
use crate::cache::FreshnessCache;
use crate::client::DEFAULT_TIMEOUT;
use crate::clock::Clock;
use crate::context::AuthContext;
use crate::error::Error;
use crate::events::{EventDispatcher, SyncEvent};
use crate::guard::BusyFlag;
use crate::health::HealthDataSource;
use crate::identity::DeviceIdentity;
use crate::lifecycle::AppLifecycle;
use crate::remote::{MetricsStore, MetricsUpload};

/// Default settle time before an automatic refresh.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

/// Components the controller reads from.
#[derive(Clone)]
pub struct LiveDependencies {
    pub cache: Arc<FreshnessCache>,
    pub health: Arc<dyn HealthDataSource>,
    pub metrics: Arc<dyn MetricsStore>,
    pub gate: Arc<DeviceAuthorizationGate>,
    pub identity: Arc<DeviceIdentity>,
    pub context: AuthContext,
    pub lifecycle: AppLifecycle,
    pub clock: Arc<dyn Clock>,
    pub events: EventDispatcher,
}

/// What [`LiveMetricsController::live_metrics`] returns.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveMetrics {
    /// Today's cached snapshot, possibly stale.
    pub snapshot: Option<CachedMetricSnapshot>,
    pub freshness: Freshness,
    pub needs_refresh: bool,
    pub is_refreshing: bool,
    /// A debounced refresh is pending.
    pub refresh_scheduled: bool,
}

/// Result of a best-effort push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// No snapshot for today yet.
    NothingToPush,
    Failed(String),
}

struct LiveInner {
    deps: LiveDependencies,
    debounce: Duration,
    request_timeout: Duration,
    refreshing: BusyFlag,
    /// Bumped by every schedule request; only the latest one fires.
    pending: AtomicU64,
    scheduled: AtomicBool,
}

/// Serves today's metrics from the cache and keeps them fresh.
#[derive(Clone)]
pub struct LiveMetricsController {
    inner: Arc<LiveInner>,
}

impl std::fmt::Debug for LiveMetricsController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveMetricsController")
            .field("debounce", &self.inner.debounce)
            .field("is_refreshing", &self.inner.refreshing.is_busy())
            .finish_non_exhaustive()
    }
}

impl LiveMetricsController {
    pub fn new(deps: LiveDependencies, debounce: Duration) -> Self {
        Self::with_request_timeout(deps, debounce, DEFAULT_TIMEOUT)
    }

    pub fn with_request_timeout(
        deps: LiveDependencies,
        debounce: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(LiveInner {
                deps,
                debounce,
                request_timeout,
                refreshing: BusyFlag::new(),
                pending: AtomicU64::new(0),
                scheduled: AtomicBool::new(false),
            }),
        }
    }

    /// Today's cached metrics, scheduling a refresh when they are stale.
    ///
    /// Must be called inside a Tokio runtime for the refresh to be
    /// scheduled; outside one the cached value is still returned.
    pub fn live_metrics(&self) -> LiveMetrics {
        let inner = &self.inner;
        let today = inner.deps.clock.today();
        let lookup = inner.deps.cache.get_with_freshness(today);

        if lookup.needs_refresh && inner.deps.lifecycle.is_active() && !inner.refreshing.is_busy()
        {
            self.schedule_refresh();
        }

        LiveMetrics {
            snapshot: lookup.data,
            freshness: lookup.freshness,
            needs_refresh: lookup.needs_refresh,
            is_refreshing: inner.refreshing.is_busy(),
            refresh_scheduled: inner.scheduled.load(Ordering::SeqCst),
        }
    }

    /// Pull today's metrics from the health source into the cache.
    ///
    /// Returns `false` without doing anything if a refresh is already
    /// running or the device may not sync, and `false` if the refresh
    /// failed.
    pub async fn refresh_data(&self) -> bool {
        self.inner.refresh_data().await
    }

    /// Push today's cached snapshot to the metrics store once.
    ///
    /// The device must pass the authorization gate first. Failures are
    /// logged and reported, never retried here.
    pub async fn sync_to_database(&self) -> PushOutcome {
        let inner = &self.inner;
        let deps = &inner.deps;

        let Some(session) = deps.context.session() else {
            return inner.push_failed("no signed-in user".to_string());
        };
        let Some(token) = session.token.filter(|t| !t.is_empty()) else {
            return inner.push_failed("no session token".to_string());
        };
        if let Err(e) = deps.gate.authorize_sync(&session.user_id).await {
            return inner.push_failed(e.to_string());
        }
        let Some(snapshot) = deps
            .cache
            .get_with_freshness(deps.clock.today())
            .data
        else {
            debug!("No snapshot for today, nothing to push");
            return PushOutcome::NothingToPush;
        };

        let upload = MetricsUpload {
            user_id: session.user_id,
            date: snapshot.date_key,
            metrics: snapshot.metrics,
            source_platform: deps.health.platform(),
            device_identifier: deps.identity.device_id(),
        };
        match timeout(
            inner.request_timeout,
            deps.metrics.push_metrics(&token, &upload),
        )
        .await
        {
            Ok(Ok(())) => {
                debug!("Pushed live snapshot for {}", upload.user_id);
                PushOutcome::Pushed
            }
            Ok(Err(e)) => inner.push_failed(e.to_string()),
            Err(_) => {
                inner.push_failed(Error::timeout("push_metrics", inner.request_timeout).to_string())
            }
        }
    }

    /// Cached snapshots for the last `days` days, most recent first.
    pub fn history(&self, days: u32) -> Vec<CachedMetricSnapshot> {
        self.inner.deps.cache.get_range(days)
    }

    fn schedule_refresh(&self) {
        let Ok(handle) = Handle::try_current() else {
            debug!("No runtime, skipping refresh scheduling");
            return;
        };

        let generation = self.inner.pending.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.scheduled.store(true, Ordering::SeqCst);

        let weak = Arc::downgrade(&self.inner);
        let debounce = self.inner.debounce;
        handle.spawn(async move {
            tokio::time::sleep(debounce).await;
            let Some(inner) = weak.upgrade() else { return };
            if inner.pending.load(Ordering::SeqCst) != generation {
                // Superseded by a later request.
                return;
            }
            inner.scheduled.store(false, Ordering::SeqCst);
            inner.refresh_data().await;
        });
    }
}

impl LiveInner {
    async fn refresh_data(&self) -> bool {
        let Some(_guard) = self.refreshing.try_acquire() else {
            debug!("Refresh already running");
            return false;
        };
        if !self.authorized().await {
            return false;
        }

        let health = &self.deps.health;
        if !health.is_available().await {
            debug!("Health data unavailable, nothing to refresh");
            return false;
        }

        let today = self.deps.clock.today();
        let metrics = match timeout(self.request_timeout, health.get_health_data(today)).await {
            Ok(Ok(metrics)) => metrics,
            Ok(Err(e)) => {
                warn!("Refresh failed: {}", e);
                return false;
            }
            Err(_) => {
                warn!("Refresh timed out after {:?}", self.request_timeout);
                return false;
            }
        };

        match self.deps.cache.cache_snapshot(today, metrics) {
            Ok(snapshot) => {
                let date = vitals_types::format_date_key(snapshot.date_key);
                info!("Refreshed metrics for {}", date);
                self.deps.events.send(SyncEvent::CacheRefreshed { date });
                true
            }
            Err(e) => {
                warn!("Failed to cache refreshed metrics: {}", e);
                false
            }
        }
    }

    /// Trust the gate's last answer when it allows syncing; otherwise ask
    /// the authority again for the signed-in user.
    async fn authorized(&self) -> bool {
        let gate = &self.deps.gate;
        if gate.status().allows_sync() {
            return true;
        }
        let Some(user_id) = self.deps.context.current_user() else {
            debug!("No signed-in user, skipping refresh");
            return false;
        };
        match gate.authorize_sync(&user_id).await {
            Ok(()) => true,
            Err(e) => {
                info!("Refresh skipped: {}", e);
                false
            }
        }
    }

    fn push_failed(&self, error: String) -> PushOutcome {
        warn!("Live snapshot push failed: {}", error);
        self.deps.events.send(SyncEvent::PushFailed {
            error: error.clone(),
        });
        PushOutcome::Failed(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::context::Session;
    use crate::identity::DeviceCharacteristics;
    use crate::lifecycle::AppActivity;
    use crate::mock::{MockBackend, MockHealthSource};
    use time::macros::{date, datetime};
    use vitals_store::{KeyValueStore, MemoryStore};
    use vitals_types::{DailyMetrics, FreshnessThresholds, Platform};

    struct Fixture {
        backend: Arc<MockBackend>,
        health: Arc<MockHealthSource>,
        cache: Arc<FreshnessCache>,
        clock: Arc<ManualClock>,
        context: AuthContext,
        lifecycle: AppLifecycle,
        events: EventDispatcher,
        gate: Arc<DeviceAuthorizationGate>,
        controller: LiveMetricsController,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MockBackend::new());
        let health = Arc::new(MockHealthSource::new(Platform::Android));
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-20 09:00 UTC)));
        let cache = Arc::new(FreshnessCache::new(
            Arc::clone(&store),
            clock.clone(),
            FreshnessThresholds::default(),
        ));
        let context = AuthContext::signed_in(Session::new("42", "token"));
        let lifecycle = AppLifecycle::default();
        let events = EventDispatcher::default();
        let identity = Arc::new(DeviceIdentity::new(
            Arc::clone(&store),
            DeviceCharacteristics::new(Platform::Android, "Pixel 8", "Google"),
        ));
        let gate = Arc::new(DeviceAuthorizationGate::new(
            backend.clone(),
            Arc::clone(&identity),
            store,
            context.clone(),
            events.clone(),
        ));
        let controller = LiveMetricsController::new(
            LiveDependencies {
                cache: Arc::clone(&cache),
                health: health.clone(),
                metrics: backend.clone(),
                gate: Arc::clone(&gate),
                identity,
                context: context.clone(),
                lifecycle: lifecycle.clone(),
                clock: clock.clone(),
                events: events.clone(),
            },
            DEFAULT_DEBOUNCE,
        );
        Fixture {
            backend,
            health,
            cache,
            clock,
            context,
            lifecycle,
            events,
            gate,
            controller,
        }
    }

    async fn registered() -> Fixture {
        let f = fixture();
        f.gate.register_device("42", true).await.unwrap();
        f
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_cache_schedules_refresh() {
        let f = registered().await;
        let live = f.controller.live_metrics();
        assert!(live.snapshot.is_none());
        assert!(live.needs_refresh);
        assert!(live.refresh_scheduled);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.health.read_count(), 1);

        let live = f.controller.live_metrics();
        assert_eq!(live.freshness, Freshness::Fresh);
        assert!(!live.refresh_scheduled);
        assert_eq!(
            live.snapshot.unwrap().metrics,
            MockHealthSource::generated(date!(2024 - 05 - 20))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_one_refresh() {
        let f = registered().await;
        for _ in 0..5 {
            f.controller.live_metrics();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.health.read_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_cache_does_not_refresh() {
        let f = registered().await;
        f.cache
            .cache_snapshot(date!(2024 - 05 - 20), DailyMetrics::default())
            .unwrap();

        let live = f.controller.live_metrics();
        assert!(!live.needs_refresh);
        assert!(!live.refresh_scheduled);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.health.read_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_in_background_does_not_refresh() {
        let f = registered().await;
        f.cache
            .cache_snapshot(date!(2024 - 05 - 20), DailyMetrics::default())
            .unwrap();
        f.clock.advance(Duration::from_secs(10 * 60));
        f.lifecycle.set(AppActivity::Background);

        let live = f.controller.live_metrics();
        assert_eq!(live.freshness, Freshness::Stale);
        assert!(live.snapshot.is_some());
        assert!(!live.refresh_scheduled);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.health.read_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_refresh_is_rejected() {
        let f = registered().await;
        f.health.set_latency(Duration::from_millis(100));
        let mut rx = f.events.subscribe();

        let (a, b) = tokio::join!(f.controller.refresh_data(), f.controller.refresh_data());
        assert!(a ^ b);
        assert_eq!(f.health.read_count(), 1);
        assert!(matches!(
            rx.recv().await.unwrap(),
            SyncEvent::CacheRefreshed { .. }
        ));
    }

    #[tokio::test]
    async fn test_sync_to_database() {
        let f = registered().await;
        assert_eq!(
            f.controller.sync_to_database().await,
            PushOutcome::NothingToPush
        );

        assert!(f.controller.refresh_data().await);
        assert_eq!(f.controller.sync_to_database().await, PushOutcome::Pushed);
        let uploads = f.backend.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].user_id, "42");
        assert_eq!(uploads[0].source_platform, Platform::Android);
    }

    #[tokio::test]
    async fn test_push_failure_is_reported_once() {
        let f = registered().await;
        assert!(f.controller.refresh_data().await);
        f.backend.fail_push_for(date!(2024 - 05 - 20));
        let mut rx = f.events.subscribe();

        let outcome = f.controller.sync_to_database().await;
        assert!(matches!(outcome, PushOutcome::Failed(_)));
        assert_eq!(f.backend.push_count(), 1);
        assert!(matches!(
            rx.recv().await.unwrap(),
            SyncEvent::PushFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_history() {
        let f = registered().await;
        f.cache
            .cache_snapshot(date!(2024 - 05 - 19), DailyMetrics::default())
            .unwrap();
        f.cache
            .cache_snapshot(date!(2024 - 05 - 20), DailyMetrics::default())
            .unwrap();
        let dates: Vec<_> = f
            .controller
            .history(7)
            .iter()
            .map(|s| s.date_key)
            .collect();
        assert_eq!(dates, vec![date!(2024 - 05 - 20), date!(2024 - 05 - 19)]);
    }

    #[tokio::test]
    async fn test_unregistered_device_neither_reads_nor_pushes() {
        let f = fixture();
        f.cache
            .cache_snapshot(date!(2024 - 05 - 20), DailyMetrics::default())
            .unwrap();

        assert!(!f.controller.refresh_data().await);
        assert_eq!(f.health.read_count(), 0);

        let outcome = f.controller.sync_to_database().await;
        assert!(matches!(outcome, PushOutcome::Failed(_)));
        assert_eq!(f.backend.push_count(), 0);
    }

    #[tokio::test]
    async fn test_withdrawn_consent_blocks_refresh_and_push() {
        let f = registered().await;
        assert!(f.controller.refresh_data().await);
        f.gate
            .update_health_data_permission("42", false)
            .await
            .unwrap();
        f.health.reset_counters();

        assert!(!f.controller.refresh_data().await);
        assert_eq!(f.health.read_count(), 0);

        let outcome = f.controller.sync_to_database().await;
        assert!(matches!(outcome, PushOutcome::Failed(_)));
        assert_eq!(f.backend.push_count(), 0);
        assert!(f.backend.uploads().is_empty());
    }

    #[tokio::test]
    async fn test_push_without_token_fails() {
        let f = registered().await;
        assert!(f.controller.refresh_data().await);
        f.context.set_session(Some(Session {
            user_id: "42".into(),
            token: None,
        }));

        assert_eq!(
            f.controller.sync_to_database().await,
            PushOutcome::Failed("no session token".into())
        );
        assert_eq!(f.backend.push_count(), 0);
    }
}
