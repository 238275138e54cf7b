//! Health-data synchronization engine.
//!
//! This crate moves daily health metrics from the platform's health store
//! to a backend, keeps a freshness-aware local cache of recent days, and
//! gates every sync on device registration and user consent.
//!
//! # Features
//!
//! - **Device identity**: a stable per-install identifier derived from the
//!   hardware fingerprint
//! - **Authorization gate**: backend registration and health-data consent,
//!   failing closed when the backend cannot be reached
//! - **Permission reconciliation**: backend, OS and cached signals merged
//!   with a fixed precedence
//! - **Freshness cache**: per-day snapshots classified as fresh, stale or old
//! - **Sync scheduling**: first-time batch, incremental and daily syncs on a
//!   timer and on foreground transitions, one at a time
//! - **Live metrics**: today's numbers with debounced refresh and upload
//!
//! # Components
//!
//! | Component | Role |
//! |-----------|------|
//! | [`DeviceIdentity`] | Install-scoped device identifier |
//! | [`DeviceAuthorizationGate`] | Registration and consent checks |
//! | [`PermissionStateResolver`] | Should the user be prompted? |
//! | [`FreshnessCache`] | Daily snapshots with freshness |
//! | [`SyncScheduler`] | Periodic and on-demand sync |
//! | [`LiveMetricsController`] | Today's metrics for display |
//!
//! [`EngineBuilder`] wires them together from an [`EngineConfig`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vitals_core::mock::{MockBackend, MockHealthSource};
//! use vitals_core::{AuthContext, EngineBuilder, EngineConfig, Session};
//! use vitals_types::Platform;
//!
//! # async fn example() -> Result<(), vitals_core::Error> {
//! let engine = EngineBuilder::new(EngineConfig::default())
//!     .backend(Arc::new(MockBackend::new()))
//!     .health_source(Arc::new(MockHealthSource::new(Platform::Ios)))
//!     .context(AuthContext::signed_in(Session::new("42", "token")))
//!     .build()?;
//!
//! engine.gate().register_device("42", true).await?;
//! let live = engine.live().live_metrics();
//! println!("needs refresh: {}", live.needs_refresh);
//! # Ok(())
//! # }
//! ```

pub mod authorization;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod guard;
pub mod health;
pub mod identity;
pub mod lifecycle;
pub mod live;
pub mod mock;
pub mod permission;
pub mod remote;
pub mod retry;
pub mod scheduler;

// Re-export the shared data model
pub use vitals_types::types;

// Core exports
pub use engine::{Engine, EngineBuilder};
pub use error::{Error, Result};

pub use authorization::{DeviceAuthorizationGate, RegistrationOutcome};
pub use cache::{CacheLookup, DEFAULT_RETENTION_DAYS, FreshnessCache};
pub use client::{ApiClient, DEFAULT_TIMEOUT};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig, ValidationError};
pub use context::{AuthContext, Session};
pub use events::{EventDispatcher, EventReceiver, EventSender, SyncEvent};
pub use guard::{BusyFlag, BusyGuard};
pub use health::{HealthDataSource, UnavailableHealthSource};
pub use identity::{DeviceCharacteristics, DeviceIdentity, IdentityOrigin};
pub use lifecycle::{AppActivity, AppLifecycle};
pub use live::{LiveDependencies, LiveMetrics, LiveMetricsController, PushOutcome};
pub use mock::{MockBackend, MockHealthSource};
pub use permission::{PermissionCheck, PermissionStateResolver, PromptReason};
pub use remote::{DeviceAuthority, DeviceValidation, MetricsStore, PermissionRecords};
pub use retry::{RetryConfig, with_retry};
pub use scheduler::{SyncDependencies, SyncScheduler, SyncStatus};
