//! Scheduled and event-triggered synchronization.
//!
//! A [`SyncScheduler`] owns one background worker per initialized config:
//!
//! - a timer task that emits a tick every `interval_minutes`
//! - a forwarder task that turns app-state changes into messages
//! - a single consumer loop that handles both, one at a time
//!
//! Ticks and foreground transitions run [`sync_today_data`]. Callers can run
//! a full [`perform_smart_sync`] at any time; at most one sync of either kind
//! runs at once, and overlapping calls are rejected immediately. Each
//! completed sync also prunes cached snapshots past `retention_days`.
//!
//! [`sync_today_data`]: SyncScheduler::sync_today_data
//! [`perform_smart_sync`]: SyncScheduler::perform_smart_sync

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use time::format_description::well_known::Rfc3339;
use time::{Date, Duration as TimeDuration, OffsetDateTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vitals_store::KeyValueStore;
use vitals_types::{
    SyncConfig, SyncConfigUpdate, SyncIssue, SyncIssueKind, SyncResult, SyncStrategy,
    format_date_key,
};

use crate::authorization::DeviceAuthorizationGate;
use crate::cache::FreshnessCache;
use crate::client::DEFAULT_TIMEOUT;
use crate::clock::Clock;
use crate::context::AuthContext;
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, SyncEvent};
use crate::guard::BusyFlag;
use crate::health::HealthDataSource;
use crate::identity::DeviceIdentity;
use crate::lifecycle::{AppActivity, AppLifecycle};
use crate::remote::{MetricsStore, MetricsUpload};
use crate::retry::{RetryConfig, with_retry};

const SYNC_CONFIG_KEY: &str = "sync_config";
const LAST_SYNC_RESULT_KEY: &str = "last_sync_result";
const LAST_DAILY_SYNC_KEY: &str = "last_daily_sync";

fn last_successful_sync_key(user_id: &str) -> String {
    format!("lastSuccessfulSync_{}", user_id)
}

/// Messages consumed by the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedulerEvent {
    Tick,
    AppStateChanged { from: AppActivity, to: AppActivity },
}

/// Components the scheduler coordinates.
#[derive(Clone)]
pub struct SyncDependencies {
    pub store: Arc<dyn KeyValueStore>,
    pub health: Arc<dyn HealthDataSource>,
    pub metrics: Arc<dyn MetricsStore>,
    pub gate: Arc<DeviceAuthorizationGate>,
    pub cache: Arc<FreshnessCache>,
    pub identity: Arc<DeviceIdentity>,
    pub context: AuthContext,
    pub lifecycle: AppLifecycle,
    pub clock: Arc<dyn Clock>,
    pub events: EventDispatcher,
    /// Cached snapshots older than this are pruned after each sync.
    pub retention_days: u32,
}

/// Snapshot of the scheduler's persisted and in-memory state.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    pub config: Option<SyncConfig>,
    pub is_running: bool,
    pub is_syncing: bool,
    pub last_result: Option<SyncResult>,
    pub last_daily_sync: Option<OffsetDateTime>,
    pub last_successful_sync: Option<OffsetDateTime>,
}

struct Worker {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Worker {
    fn stop(self) {
        self.cancel.cancel();
        // Tasks exit on their own once cancelled.
        drop(self.tasks);
    }
}

struct SchedulerInner {
    deps: SyncDependencies,
    request_timeout: Duration,
    syncing: BusyFlag,
    worker: Mutex<Option<Worker>>,
}

/// Periodic and on-demand sync coordinator.
///
/// Cloning shares the same scheduler.
#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("is_running", &self.is_running())
            .field("is_syncing", &self.is_syncing())
            .finish_non_exhaustive()
    }
}

impl SyncScheduler {
    pub fn new(deps: SyncDependencies) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                deps,
                request_timeout: DEFAULT_TIMEOUT,
                syncing: BusyFlag::new(),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Create a scheduler with an explicit per-call timeout for health reads
    /// and uploads.
    pub fn with_request_timeout(deps: SyncDependencies, request_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                deps,
                request_timeout,
                syncing: BusyFlag::new(),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Validate and persist `config`, then (re)start periodic syncing.
    pub async fn initialize_sync(&self, config: SyncConfig) -> Result<()> {
        config
            .validate()
            .map_err(|e| Error::invalid_config(e.to_string()))?;
        self.inner.deps.store.set_json(SYNC_CONFIG_KEY, &config)?;
        self.start_worker(config.interval());
        info!(
            "Sync initialized for user {} every {} minutes",
            config.user_id, config.interval_minutes
        );
        Ok(())
    }

    /// Run a full sync: first-time batch or incremental, per user history.
    ///
    /// Never fails; every problem is folded into the result.
    pub async fn perform_smart_sync(&self) -> SyncResult {
        self.inner.perform_smart_sync().await
    }

    /// Sync today only. Used by the timer and foreground trigger.
    pub async fn sync_today_data(&self) -> SyncResult {
        self.inner.sync_today_data().await
    }

    /// Merge `update` into the stored config and restart the timer if it
    /// was running.
    pub async fn update_sync_config(&self, update: SyncConfigUpdate) -> Result<SyncConfig> {
        let mut config = self
            .inner
            .load_config()?
            .ok_or_else(|| Error::invalid_config("sync not initialized"))?;
        config.apply(&update);
        config
            .validate()
            .map_err(|e| Error::invalid_config(e.to_string()))?;
        self.inner.deps.store.set_json(SYNC_CONFIG_KEY, &config)?;

        if self.is_running() {
            self.start_worker(config.interval());
        }
        debug!("Sync config updated: {:?}", config);
        Ok(config)
    }

    /// Stop the timer and the foreground trigger. Safe to call repeatedly.
    pub fn stop_periodic_sync(&self) {
        if let Some(worker) = self.inner.take_worker() {
            worker.stop();
            info!("Periodic sync stopped");
        }
    }

    /// Stop syncing and forget the stored config, last result and markers.
    pub fn clear_sync_data(&self) -> Result<()> {
        self.stop_periodic_sync();

        let store = &self.inner.deps.store;
        if let Ok(Some(config)) = self.inner.load_config() {
            store.remove(&last_successful_sync_key(&config.user_id))?;
        }
        for key in [SYNC_CONFIG_KEY, LAST_SYNC_RESULT_KEY, LAST_DAILY_SYNC_KEY] {
            store.remove(key)?;
        }
        info!("Sync data cleared");
        Ok(())
    }

    /// Current state, read from the store. Unreadable values show as absent.
    pub fn sync_status(&self) -> SyncStatus {
        let inner = &self.inner;
        let config = inner.load_config().unwrap_or_else(|e| {
            warn!("Sync config unreadable: {}", e);
            None
        });
        let last_result = inner
            .deps
            .store
            .get_json::<SyncResult>(LAST_SYNC_RESULT_KEY)
            .unwrap_or_else(|e| {
                warn!("Last sync result unreadable: {}", e);
                None
            });
        let last_successful_sync = config
            .as_ref()
            .and_then(|c| inner.read_timestamp(&last_successful_sync_key(&c.user_id)));

        SyncStatus {
            is_running: self.is_running(),
            is_syncing: self.is_syncing(),
            last_daily_sync: inner.read_timestamp(LAST_DAILY_SYNC_KEY),
            last_successful_sync,
            last_result,
            config,
        }
    }

    /// Whether the periodic worker is active.
    pub fn is_running(&self) -> bool {
        self.inner
            .lock_worker()
            .as_ref()
            .is_some_and(|w| !w.cancel.is_cancelled())
    }

    /// Whether a sync is in flight.
    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.is_busy()
    }

    fn start_worker(&self, period: Duration) {
        if let Some(old) = self.inner.take_worker() {
            debug!("Stopping previous sync worker");
            old.stop();
        }

        let (tx, mut rx) = mpsc::channel::<SchedulerEvent>(16);
        let cancel = CancellationToken::new();

        let timer = {
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if tx.send(SchedulerEvent::Tick).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        let forwarder = {
            let cancel = cancel.clone();
            let mut activity = self.inner.deps.lifecycle.subscribe();
            let mut last = *activity.borrow_and_update();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        changed = activity.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let current = *activity.borrow_and_update();
                            if current == last {
                                continue;
                            }
                            let event = SchedulerEvent::AppStateChanged { from: last, to: current };
                            last = current;
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        let consumer = {
            let cancel = cancel.clone();
            let inner: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        event = rx.recv() => {
                            let Some(event) = event else { break };
                            let Some(inner) = inner.upgrade() else { break };
                            inner.handle(event).await;
                        }
                    }
                }
                debug!("Sync worker stopped");
            })
        };

        *self.inner.lock_worker() = Some(Worker {
            cancel,
            tasks: vec![timer, forwarder, consumer],
        });
    }
}

impl SchedulerInner {
    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_worker(&self) -> Option<Worker> {
        self.lock_worker().take()
    }

    fn load_config(&self) -> Result<Option<SyncConfig>> {
        Ok(self.deps.store.get_json(SYNC_CONFIG_KEY)?)
    }

    fn read_timestamp(&self, key: &str) -> Option<OffsetDateTime> {
        let raw = match self.deps.store.get(key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Failed to read {}: {}", key, e);
                return None;
            }
        };
        match OffsetDateTime::parse(&raw, &Rfc3339) {
            Ok(at) => Some(at),
            Err(e) => {
                warn!("Ignoring malformed timestamp in {}: {}", key, e);
                None
            }
        }
    }

    fn write_timestamp(&self, key: &str, at: OffsetDateTime) {
        let result = at
            .format(&Rfc3339)
            .map_err(|e| e.to_string())
            .and_then(|raw| self.deps.store.set(key, &raw).map_err(|e| e.to_string()));
        if let Err(e) = result {
            warn!("Failed to write {}: {}", key, e);
        }
    }

    async fn handle(&self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Tick => {
                debug!("Periodic sync tick");
                let result = self.sync_today_data().await;
                debug!("Periodic sync: {}", result.summary());
            }
            SchedulerEvent::AppStateChanged { from, to } => {
                if from.is_active() || !to.is_active() {
                    return;
                }
                if self.foreground_sync_due() {
                    info!("App returned to foreground, syncing today");
                    let result = self.sync_today_data().await;
                    debug!("Foreground sync: {}", result.summary());
                } else {
                    debug!("App returned to foreground, daily sync still recent");
                }
            }
        }
    }

    fn foreground_sync_due(&self) -> bool {
        let interval = match self.load_config() {
            Ok(Some(config)) => config.interval(),
            _ => return false,
        };
        match self.read_timestamp(LAST_DAILY_SYNC_KEY) {
            Some(last) => self.deps.clock.now() - last > interval,
            None => true,
        }
    }

    async fn perform_smart_sync(&self) -> SyncResult {
        let Some(_guard) = self.syncing.try_acquire() else {
            debug!("Sync already in progress, rejecting");
            self.deps.events.send(SyncEvent::SyncRejected);
            return SyncResult::rejected(self.deps.clock.now());
        };

        let config = match self.ready_config().await {
            Ok(config) => config,
            Err(result) => return *result,
        };

        let today = self.deps.clock.today();
        let strategy = match self.read_timestamp(&last_successful_sync_key(&config.user_id)) {
            Some(_) => SyncStrategy::Incremental,
            None => SyncStrategy::FirstTime,
        };
        let dates = match strategy {
            SyncStrategy::FirstTime => batch_dates(today, config.batch_days),
            SyncStrategy::Incremental | SyncStrategy::Daily => vec![today],
        };

        info!(
            "Starting {} sync of {} days for user {}",
            strategy,
            dates.len(),
            config.user_id
        );
        let result = self.sync_days(&config, strategy, dates).await;
        self.finish(&config, result)
    }

    async fn sync_today_data(&self) -> SyncResult {
        let Some(_guard) = self.syncing.try_acquire() else {
            debug!("Sync already in progress, skipping daily sync");
            self.deps.events.send(SyncEvent::SyncRejected);
            return SyncResult::rejected(self.deps.clock.now());
        };

        let config = match self.ready_config().await {
            Ok(config) => config,
            Err(result) => return *result,
        };

        let today = self.deps.clock.today();
        let result = self
            .sync_days(&config, SyncStrategy::Daily, vec![today])
            .await;
        let result = self.finish(&config, result);
        if result.success && !has_stale_context(&result) {
            self.write_timestamp(LAST_DAILY_SYNC_KEY, result.last_sync_date);
        }
        result
    }

    /// Load the config and run the authorization and availability gates.
    async fn ready_config(&self) -> std::result::Result<SyncConfig, Box<SyncResult>> {
        let now = self.deps.clock.now();
        let config = match self.load_config() {
            Ok(Some(config)) => config,
            Ok(None) => {
                return Err(Box::new(SyncResult::aborted(
                    None,
                    now,
                    SyncIssue::new(SyncIssueKind::Storage, "Sync not initialized"),
                )));
            }
            Err(e) => {
                warn!("Sync config unreadable: {}", e);
                return Err(Box::new(SyncResult::aborted(
                    None,
                    now,
                    SyncIssue::new(e.issue_kind(), e.to_string()),
                )));
            }
        };

        if let Err(e) = self.deps.gate.authorize_sync(&config.user_id).await {
            info!("Sync not authorized: {}", e);
            let result = SyncResult::aborted(None, now, SyncIssue::new(e.issue_kind(), e.to_string()));
            return Err(Box::new(self.finish(&config, result)));
        }

        if !self.deps.health.is_available().await {
            let e = Error::Unavailable(format!(
                "health data is not available on {}",
                self.deps.health.platform()
            ));
            info!("{}", e);
            let result = SyncResult::aborted(None, now, SyncIssue::new(e.issue_kind(), e.to_string()));
            return Err(Box::new(self.finish(&config, result)));
        }

        Ok(config)
    }

    async fn sync_days(
        &self,
        config: &SyncConfig,
        strategy: SyncStrategy,
        dates: Vec<Date>,
    ) -> SyncResult {
        self.deps.events.send(SyncEvent::SyncStarted {
            user_id: config.user_id.clone(),
            strategy: Some(strategy),
        });

        let device_identifier = self.deps.identity.device_id();
        let retry = RetryConfig::for_upload(config.retry_attempts);
        let mut result = SyncResult {
            success: false,
            strategy: Some(strategy),
            synced_days: 0,
            failed_days: 0,
            last_sync_date: self.deps.clock.now(),
            errors: Vec::new(),
        };

        for date in dates {
            let key = format_date_key(date);
            match self.sync_day(config, date, &device_identifier, &retry).await {
                Ok(()) => {
                    result.synced_days += 1;
                    debug!("Synced {}", key);
                    self.deps.events.send(SyncEvent::DaySynced {
                        user_id: config.user_id.clone(),
                        date: key,
                    });
                }
                Err(e) => {
                    result.failed_days += 1;
                    warn!("Sync of {} failed: {}", key, e);
                    result
                        .errors
                        .push(SyncIssue::for_day(e.issue_kind(), date, e.to_string()));
                    self.deps.events.send(SyncEvent::DayFailed {
                        user_id: config.user_id.clone(),
                        date: key,
                        error: e.to_string(),
                    });
                }
            }
        }

        result.success = result.synced_days > 0;
        result.last_sync_date = self.deps.clock.now();
        result
    }

    async fn sync_day(
        &self,
        config: &SyncConfig,
        date: Date,
        device_identifier: &str,
        retry: &RetryConfig,
    ) -> Result<()> {
        let limit = self.request_timeout;
        let metrics = timeout(limit, self.deps.health.get_health_data(date))
            .await
            .map_err(|_| Error::timeout("get_health_data", limit))??;

        if let Err(e) = self.deps.cache.cache_snapshot(date, metrics.clone()) {
            warn!("Failed to cache {}: {}", format_date_key(date), e);
        }

        let upload = MetricsUpload {
            user_id: config.user_id.clone(),
            date,
            metrics,
            source_platform: self.deps.health.platform(),
            device_identifier: device_identifier.to_string(),
        };

        let store = &self.deps.metrics;
        let token = config.token.as_str();
        let upload = &upload;
        with_retry(retry, "push_metrics", move || async move {
            timeout(limit, store.push_metrics(token, upload))
                .await
                .map_err(|_| Error::timeout("push_metrics", limit))?
        })
        .await
    }

    /// Persist `result` if the config's user is still signed in.
    fn finish(&self, config: &SyncConfig, mut result: SyncResult) -> SyncResult {
        if !self.deps.context.is_current_user(&config.user_id) {
            warn!(
                "Signed-in user changed during sync for {}, discarding result",
                config.user_id
            );
            let issue = Error::StaleContext;
            result
                .errors
                .push(SyncIssue::new(issue.issue_kind(), issue.to_string()));
            self.deps.events.send(SyncEvent::SyncCompleted {
                result: result.clone(),
            });
            return result;
        }

        if let Err(e) = self.deps.store.set_json(LAST_SYNC_RESULT_KEY, &result) {
            warn!("Failed to persist sync result: {}", e);
        }
        if result.synced_days > 0
            && matches!(
                result.strategy,
                Some(SyncStrategy::FirstTime | SyncStrategy::Incremental)
            )
        {
            self.write_timestamp(
                &last_successful_sync_key(&config.user_id),
                result.last_sync_date,
            );
        }

        if let Err(e) = self.deps.cache.prune_older_than(self.deps.retention_days) {
            warn!("Cache pruning failed: {}", e);
        }

        info!("Sync finished: {}", result.summary());
        self.deps.events.send(SyncEvent::SyncCompleted {
            result: result.clone(),
        });
        result
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        if let Some(worker) = self.take_worker() {
            worker.stop();
        }
    }
}

fn has_stale_context(result: &SyncResult) -> bool {
    result
        .errors
        .iter()
        .any(|e| e.kind == SyncIssueKind::StaleContext)
}

/// The last `days` calendar days ending today, oldest first.
fn batch_dates(today: Date, days: u32) -> Vec<Date> {
    (0..i64::from(days))
        .rev()
        .filter_map(|offset| today.checked_sub(TimeDuration::days(offset)))
        .collect()
}
