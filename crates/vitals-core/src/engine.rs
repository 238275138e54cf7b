//! Engine facade: builds every component from one [`EngineConfig`].
//!
//! ```no_run
//! use vitals_core::{AuthContext, EngineBuilder, EngineConfig, Session};
//!
//! # async fn example() -> Result<(), vitals_core::Error> {
//! let context = AuthContext::signed_in(Session::new("42", "token"));
//! let engine = EngineBuilder::new(EngineConfig::default())
//!     .context(context)
//!     .build()?;
//!
//! engine.gate().register_device("42", true).await?;
//! engine.scheduler().initialize_sync(engine.sync_config("42", "token")).await?;
//! let result = engine.scheduler().perform_smart_sync().await;
//! println!("{}", result.summary());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::info;

use vitals_store::{KeyValueStore, SqliteStore};
use vitals_types::SyncConfig;

use crate::authorization::DeviceAuthorizationGate;
use crate::cache::FreshnessCache;
use crate::client::ApiClient;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::context::AuthContext;
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventReceiver};
use crate::health::{HealthDataSource, select_health_source};
use crate::identity::{DeviceCharacteristics, DeviceIdentity};
use crate::lifecycle::AppLifecycle;
use crate::live::{LiveDependencies, LiveMetricsController};
use crate::permission::PermissionStateResolver;
use crate::remote::{DeviceAuthority, MetricsStore, PermissionRecords};
use crate::scheduler::{SyncDependencies, SyncScheduler};

/// Builder for [`Engine`].
///
/// Anything not supplied is created from the config: a SQLite store at
/// `storage.path` and an [`ApiClient`] for `api.base_url`.
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    health: Option<Arc<dyn HealthDataSource>>,
    authority: Option<Arc<dyn DeviceAuthority>>,
    permissions: Option<Arc<dyn PermissionRecords>>,
    metrics: Option<Arc<dyn MetricsStore>>,
    clock: Option<Arc<dyn Clock>>,
    characteristics: DeviceCharacteristics,
    context: Option<AuthContext>,
    lifecycle: Option<AppLifecycle>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            health: None,
            authority: None,
            permissions: None,
            metrics: None,
            clock: None,
            characteristics: DeviceCharacteristics::default(),
            context: None,
            lifecycle: None,
        }
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// The platform's native health source. Without one, health data is
    /// reported unavailable.
    #[must_use]
    pub fn health_source(mut self, health: Arc<dyn HealthDataSource>) -> Self {
        self.health = Some(health);
        self
    }

    /// Use one object for all three remote services.
    #[must_use]
    pub fn backend<B>(mut self, backend: Arc<B>) -> Self
    where
        B: DeviceAuthority + PermissionRecords + MetricsStore + 'static,
    {
        self.authority = Some(backend.clone() as Arc<dyn DeviceAuthority>);
        self.permissions = Some(backend.clone() as Arc<dyn PermissionRecords>);
        self.metrics = Some(backend as Arc<dyn MetricsStore>);
        self
    }

    #[must_use]
    pub fn device_authority(mut self, authority: Arc<dyn DeviceAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    #[must_use]
    pub fn permission_records(mut self, permissions: Arc<dyn PermissionRecords>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    #[must_use]
    pub fn metrics_store(mut self, metrics: Arc<dyn MetricsStore>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn characteristics(mut self, characteristics: DeviceCharacteristics) -> Self {
        self.characteristics = characteristics;
        self
    }

    #[must_use]
    pub fn context(mut self, context: AuthContext) -> Self {
        self.context = Some(context);
        self
    }

    #[must_use]
    pub fn lifecycle(mut self, lifecycle: AppLifecycle) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Validate the config and assemble the engine.
    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| Error::invalid_config(e.to_string()))?;

        let store: Arc<dyn KeyValueStore> = match self.store {
            Some(store) => store,
            None => Arc::new(SqliteStore::open(&config.storage.path)?),
        };
        let context = self.context.unwrap_or_default();
        let lifecycle = self.lifecycle.unwrap_or_default();
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let events = EventDispatcher::default();

        let (authority, permissions, metrics) =
            match (self.authority, self.permissions, self.metrics) {
                (Some(a), Some(p), Some(m)) => (a, p, m),
                (a, p, m) => {
                    let client = Arc::new(
                        ApiClient::with_timeout(&config.api.base_url, config.api.timeout())?
                            .with_context(context.clone()),
                    );
                    let client_authority: Arc<dyn DeviceAuthority> = client.clone();
                    let client_permissions: Arc<dyn PermissionRecords> = client.clone();
                    let client_metrics: Arc<dyn MetricsStore> = client;
                    (
                        a.unwrap_or(client_authority),
                        p.unwrap_or(client_permissions),
                        m.unwrap_or(client_metrics),
                    )
                }
            };

        let health = select_health_source(self.health, self.characteristics.platform);
        let identity = Arc::new(DeviceIdentity::new(
            Arc::clone(&store),
            self.characteristics,
        ));
        let gate = Arc::new(DeviceAuthorizationGate::new(
            authority,
            Arc::clone(&identity),
            Arc::clone(&store),
            context.clone(),
            events.clone(),
        ));
        let permission = Arc::new(PermissionStateResolver::new(
            permissions,
            Arc::clone(&health),
            Arc::clone(&store),
            Arc::clone(&clock),
            config.permission.offline_trust_max_age(),
        ));
        let cache = Arc::new(FreshnessCache::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.cache.thresholds(),
        ));

        let request_timeout = config.api.timeout();
        let scheduler = SyncScheduler::with_request_timeout(
            SyncDependencies {
                store: Arc::clone(&store),
                health: Arc::clone(&health),
                metrics: Arc::clone(&metrics),
                gate: Arc::clone(&gate),
                cache: Arc::clone(&cache),
                identity: Arc::clone(&identity),
                context: context.clone(),
                lifecycle: lifecycle.clone(),
                clock: Arc::clone(&clock),
                events: events.clone(),
                retention_days: config.cache.retention_days,
            },
            request_timeout,
        );
        let live = LiveMetricsController::with_request_timeout(
            LiveDependencies {
                cache: Arc::clone(&cache),
                health,
                metrics,
                gate: Arc::clone(&gate),
                identity: Arc::clone(&identity),
                context: context.clone(),
                lifecycle: lifecycle.clone(),
                clock,
                events: events.clone(),
            },
            config.live.debounce(),
            request_timeout,
        );

        info!("Engine ready");
        Ok(Engine {
            config,
            context,
            lifecycle,
            events,
            identity,
            gate,
            permission,
            cache,
            scheduler,
            live,
        })
    }
}

/// All engine components, wired together.
pub struct Engine {
    config: EngineConfig,
    context: AuthContext,
    lifecycle: AppLifecycle,
    events: EventDispatcher,
    identity: Arc<DeviceIdentity>,
    gate: Arc<DeviceAuthorizationGate>,
    permission: Arc<PermissionStateResolver>,
    cache: Arc<FreshnessCache>,
    scheduler: SyncScheduler,
    live: LiveMetricsController,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> &AuthContext {
        &self.context
    }

    pub fn lifecycle(&self) -> &AppLifecycle {
        &self.lifecycle
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn gate(&self) -> &DeviceAuthorizationGate {
        &self.gate
    }

    pub fn permissions(&self) -> &PermissionStateResolver {
        &self.permission
    }

    pub fn cache(&self) -> &FreshnessCache {
        &self.cache
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    pub fn live(&self) -> &LiveMetricsController {
        &self.live
    }

    /// Subscribe to sync, registration and cache events.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// A sync config for `user_id` with this engine's cadence defaults.
    pub fn sync_config(&self, user_id: impl Into<String>, token: impl Into<String>) -> SyncConfig {
        self.config.sync_config(user_id, token)
    }

    /// Drop cached snapshots past the configured retention.
    pub fn prune_cache(&self) -> Result<usize> {
        self.cache
            .prune_older_than(self.config.cache.retention_days)
    }

    /// Stop background work.
    pub fn shutdown(&self) {
        self.scheduler.stop_periodic_sync();
    }
}
