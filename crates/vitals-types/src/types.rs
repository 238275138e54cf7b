//! Core types for health-data synchronization.

use core::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime};

use crate::error::{ParseError, ParseResult};

/// Platform the health data originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Platform {
    /// Apple HealthKit.
    Ios,
    /// Google Health Connect.
    Android,
    /// Browser or desktop build without a native health store.
    Web,
    /// Platform could not be determined.
    #[default]
    Unknown,
}

impl Platform {
    /// Wire name of the platform.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
            Platform::Web => "web",
            Platform::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==========================================================================
// Date keys
// ==========================================================================

/// Format a calendar date as a `YYYY-MM-DD` key.
///
/// ```
/// use time::macros::date;
/// use vitals_types::format_date_key;
///
/// assert_eq!(format_date_key(date!(2024 - 03 - 07)), "2024-03-07");
/// ```
#[must_use]
pub fn format_date_key(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

/// Parse a `YYYY-MM-DD` key into a calendar date.
pub fn parse_date_key(key: &str) -> ParseResult<Date> {
    let invalid = || ParseError::InvalidDateKey(key.to_string());

    let mut parts = key.split('-');
    let (Some(year), Some(month), Some(day), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };

    if year.len() != 4 || month.len() != 2 || day.len() != 2 {
        return Err(invalid());
    }

    let year: i32 = year.parse().map_err(|_| invalid())?;
    let month: u8 = month.parse().map_err(|_| invalid())?;
    let day: u8 = day.parse().map_err(|_| invalid())?;
    let month = Month::try_from(month).map_err(|_| invalid())?;

    Date::from_calendar_date(year, month, day).map_err(|_| invalid())
}

/// Serde adapter storing a [`Date`] as a `YYYY-MM-DD` string.
pub mod date_key {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    pub fn serialize<S: Serializer>(date: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_date_key(*date))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_date_key(&raw).map_err(serde::de::Error::custom)
    }
}

// ==========================================================================
// Metrics
// ==========================================================================

/// One day of aggregated health metrics as read from the health-data capability.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyMetrics {
    /// Step count.
    pub steps: u32,
    /// Active energy in kilocalories.
    pub calories: f64,
    /// Average heart rate in bpm, when the source reports one.
    #[serde(default)]
    pub heart_rate: Option<u32>,
    /// Minutes of moderate or vigorous activity.
    pub active_minutes: u32,
    /// Distance covered in meters.
    pub distance: f64,
    /// Blood oxygen saturation percentage, when available.
    #[serde(default)]
    pub spo2: Option<f64>,
}

/// A cached per-day snapshot.
///
/// Freshness is never stored; it is derived from `cached_at` on every read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedMetricSnapshot {
    /// Calendar day the metrics belong to.
    #[serde(with = "date_key")]
    pub date_key: Date,
    /// The metrics themselves.
    #[serde(flatten)]
    pub metrics: DailyMetrics,
    /// When the snapshot was written to the cache.
    #[serde(with = "time::serde::rfc3339")]
    pub cached_at: OffsetDateTime,
}

/// Age-based classification of a cached snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Recently cached; serve as-is.
    Fresh,
    /// Usable but due for a refresh.
    Stale,
    /// Too old to trust, or missing.
    Old,
}

impl Freshness {
    /// Whether this classification should trigger a refresh.
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        !matches!(self, Freshness::Fresh)
    }

    #[must_use]
    pub fn is_fresh(&self) -> bool {
        matches!(self, Freshness::Fresh)
    }
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Freshness::Fresh => write!(f, "fresh"),
            Freshness::Stale => write!(f, "stale"),
            Freshness::Old => write!(f, "old"),
        }
    }
}

/// Age thresholds used to classify snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessThresholds {
    /// Snapshots at most this old are fresh.
    pub fresh_for: Duration,
    /// Snapshots at most this old (and older than `fresh_for`) are stale.
    pub stale_for: Duration,
}

impl Default for FreshnessThresholds {
    fn default() -> Self {
        Self {
            fresh_for: Duration::from_secs(5 * 60),
            stale_for: Duration::from_secs(15 * 60),
        }
    }
}

impl FreshnessThresholds {
    /// Classify a snapshot by its age.
    ///
    /// ```
    /// use std::time::Duration;
    /// use vitals_types::{Freshness, FreshnessThresholds};
    ///
    /// let thresholds = FreshnessThresholds::default();
    /// assert_eq!(thresholds.classify(Duration::from_secs(60)), Freshness::Fresh);
    /// assert_eq!(thresholds.classify(Duration::from_secs(6 * 60)), Freshness::Stale);
    /// assert_eq!(thresholds.classify(Duration::from_secs(16 * 60)), Freshness::Old);
    /// ```
    #[must_use]
    pub fn classify(&self, age: Duration) -> Freshness {
        if age <= self.fresh_for {
            Freshness::Fresh
        } else if age <= self.stale_for {
            Freshness::Stale
        } else {
            Freshness::Old
        }
    }

    /// Classify a snapshot cached at `cached_at` as observed at `now`.
    ///
    /// A `cached_at` in the future (clock skew) counts as zero age.
    #[must_use]
    pub fn classify_at(&self, cached_at: OffsetDateTime, now: OffsetDateTime) -> Freshness {
        let age = Duration::try_from(now - cached_at).unwrap_or_default();
        self.classify(age)
    }
}

// ==========================================================================
// Device identity and registration
// ==========================================================================

/// Stable identity of this installation, sent as the authorization payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFingerprint {
    pub device_id: String,
    pub installation_id: String,
    pub platform: Platform,
    pub model: String,
    pub manufacturer: String,
    /// Hex-encoded digest over every other field.
    pub hash: String,
}

/// A device record as known to the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredDevice {
    pub id: String,
    pub user_id: String,
    pub device_id: String,
    pub device_name: String,
    pub platform: Platform,
    pub health_data_enabled: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_active_at: Option<OffsetDateTime>,
}

/// Registration state of this device for the current user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    /// Waiting for the remote authority to confirm.
    #[default]
    Checking,
    /// Registered with health data enabled.
    Registered,
    /// Unknown to the authority, or registered with health data disabled.
    Unregistered,
    /// The last check failed; sync stays blocked.
    Error,
}

impl RegistrationStatus {
    /// Whether a sync may proceed under this status.
    #[must_use]
    pub fn allows_sync(&self) -> bool {
        matches!(self, RegistrationStatus::Registered)
    }
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationStatus::Checking => write!(f, "checking"),
            RegistrationStatus::Registered => write!(f, "registered"),
            RegistrationStatus::Unregistered => write!(f, "unregistered"),
            RegistrationStatus::Error => write!(f, "error"),
        }
    }
}

// ==========================================================================
// Permissions
// ==========================================================================

/// Which signal a permission status was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionSource {
    Os,
    Backend,
    Cache,
}

/// Resolved health-data permission.
///
/// The cached copy is a hint for offline use, never a source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionStatus {
    pub granted: bool,
    pub platform: Platform,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub granted_at: Option<OffsetDateTime>,
    pub source: PermissionSource,
    /// When this signal was observed.
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
}

// ==========================================================================
// Sync configuration and results
// ==========================================================================

/// Default periodic sync interval in minutes.
pub const DEFAULT_INTERVAL_MINUTES: u32 = 30;
/// Default number of calendar days pulled on a first sync.
pub const DEFAULT_BATCH_DAYS: u32 = 7;
/// Default number of upload retries per day.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Per-user sync configuration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub user_id: String,
    pub token: String,
    pub interval_minutes: u32,
    pub batch_days: u32,
    pub retry_attempts: u32,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .field("interval_minutes", &self.interval_minutes)
            .field("batch_days", &self.batch_days)
            .field("retry_attempts", &self.retry_attempts)
            .finish()
    }
}

impl SyncConfig {
    /// Create a config with default cadence for the given user.
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            batch_days: DEFAULT_BATCH_DAYS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
        }
    }

    /// Set the periodic interval.
    #[must_use]
    pub fn interval_minutes(mut self, minutes: u32) -> Self {
        self.interval_minutes = minutes;
        self
    }

    /// Set the first-sync batch size.
    #[must_use]
    pub fn batch_days(mut self, days: u32) -> Self {
        self.batch_days = days;
        self
    }

    /// Set the number of upload retries.
    #[must_use]
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// The periodic interval as a [`Duration`].
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.interval_minutes) * 60)
    }

    /// Check the config for values the scheduler cannot run with.
    pub fn validate(&self) -> ParseResult<()> {
        if self.user_id.trim().is_empty() {
            return Err(ParseError::InvalidValue("user id cannot be empty".into()));
        }
        if self.interval_minutes == 0 {
            return Err(ParseError::InvalidValue(
                "interval must be at least one minute".into(),
            ));
        }
        if self.batch_days == 0 {
            return Err(ParseError::InvalidValue(
                "batch must cover at least one day".into(),
            ));
        }
        Ok(())
    }

    /// Merge a partial update into this config.
    pub fn apply(&mut self, update: &SyncConfigUpdate) {
        if let Some(token) = &update.token {
            self.token = token.clone();
        }
        if let Some(minutes) = update.interval_minutes {
            self.interval_minutes = minutes;
        }
        if let Some(days) = update.batch_days {
            self.batch_days = days;
        }
        if let Some(attempts) = update.retry_attempts {
            self.retry_attempts = attempts;
        }
    }
}

/// A partial [`SyncConfig`] update. `None` fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncConfigUpdate {
    pub token: Option<String>,
    pub interval_minutes: Option<u32>,
    pub batch_days: Option<u32>,
    pub retry_attempts: Option<u32>,
}

/// How many days a sync attempt covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// No prior successful sync for the user: pull a batch of days.
    FirstTime,
    /// A prior sync exists: pull today only.
    Incremental,
    /// The lightweight timer/foreground path: today only.
    Daily,
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStrategy::FirstTime => write!(f, "first-time"),
            SyncStrategy::Incremental => write!(f, "incremental"),
            SyncStrategy::Daily => write!(f, "daily"),
        }
    }
}

/// Category of a problem recorded during a sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncIssueKind {
    /// Device not registered or health data disabled.
    Authorization,
    /// The health-data capability is absent.
    Availability,
    /// A remote call failed.
    Network,
    /// Another sync was already running.
    ConcurrencyRejection,
    /// Local persistence failed.
    Storage,
    /// The signed-in user changed while the sync was running.
    StaleContext,
}

/// A single problem recorded in a [`SyncResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncIssue {
    pub kind: SyncIssueKind,
    /// Date key of the day the issue affected, if day-scoped.
    #[serde(default)]
    pub date: Option<String>,
    pub message: String,
}

impl SyncIssue {
    pub fn new(kind: SyncIssueKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            date: None,
            message: message.into(),
        }
    }

    pub fn for_day(kind: SyncIssueKind, date: Date, message: impl Into<String>) -> Self {
        Self {
            kind,
            date: Some(format_date_key(date)),
            message: message.into(),
        }
    }
}

impl fmt::Display for SyncIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.date {
            Some(date) => write!(f, "{}: {}", date, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Outcome of one sync attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub strategy: Option<SyncStrategy>,
    pub synced_days: u32,
    pub failed_days: u32,
    /// When the attempt finished.
    #[serde(with = "time::serde::rfc3339")]
    pub last_sync_date: OffsetDateTime,
    pub errors: Vec<SyncIssue>,
}

impl SyncResult {
    /// Result for an attempt that ended before any day was processed.
    pub fn aborted(strategy: Option<SyncStrategy>, at: OffsetDateTime, issue: SyncIssue) -> Self {
        Self {
            success: false,
            strategy,
            synced_days: 0,
            failed_days: 0,
            last_sync_date: at,
            errors: vec![issue],
        }
    }

    /// Result for a call rejected because another sync was running.
    pub fn rejected(at: OffsetDateTime) -> Self {
        Self::aborted(
            None,
            at,
            SyncIssue::new(
                SyncIssueKind::ConcurrencyRejection,
                "Sync already in progress",
            ),
        )
    }

    /// Whether this result is the no-op signal for an overlapping call.
    #[must_use]
    pub fn is_concurrency_rejection(&self) -> bool {
        !self.success
            && self
                .errors
                .iter()
                .any(|e| e.kind == SyncIssueKind::ConcurrencyRejection)
    }

    /// Total days attempted.
    #[must_use]
    pub fn total_days(&self) -> u32 {
        self.synced_days + self.failed_days
    }

    /// User-facing one-line summary favoring partial success.
    #[must_use]
    pub fn summary(&self) -> String {
        let total = self.total_days();
        if total == 0 {
            return match self.errors.first() {
                Some(issue) if !self.success => issue.message.clone(),
                _ => "Nothing to sync".to_string(),
            };
        }
        if self.failed_days == 0 {
            format!("{} of {} days synced", self.synced_days, total)
        } else if self.synced_days > 0 {
            format!(
                "{} of {} days synced ({} failed)",
                self.synced_days, total, self.failed_days
            )
        } else {
            format!("Sync failed for all {} days, tap to retry", total)
        }
    }
}
