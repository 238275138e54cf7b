//! Platform-agnostic types for the vitals health-data sync engine.
//!
//! This crate provides the data model shared by the store and the engine:
//! daily metrics and cached snapshots, device identity and registration
//! records, permission status, sync configuration and sync results.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use vitals_types::{Freshness, FreshnessThresholds, SyncConfig};
//!
//! let config = SyncConfig::new("42", "token").batch_days(14);
//! assert_eq!(config.batch_days, 14);
//!
//! let thresholds = FreshnessThresholds::default();
//! assert_eq!(thresholds.classify(Duration::from_secs(30)), Freshness::Fresh);
//! ```

pub mod error;
pub mod types;

pub use error::{ParseError, ParseResult};
pub use types::{
    CachedMetricSnapshot, DEFAULT_BATCH_DAYS, DEFAULT_INTERVAL_MINUTES, DEFAULT_RETRY_ATTEMPTS,
    DailyMetrics, DeviceFingerprint, Freshness, FreshnessThresholds, PermissionSource,
    PermissionStatus, Platform, RegisteredDevice, RegistrationStatus, SyncConfig,
    SyncConfigUpdate, SyncIssue, SyncIssueKind, SyncResult, SyncStrategy, date_key,
    format_date_key, parse_date_key,
};
