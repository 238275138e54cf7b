//! Engine configuration.
//!
//! Loaded from TOML. Every section has defaults, so an empty file is valid.
//!
//! ```toml
//! [api]
//! base_url = "https://api.example.com"
//! timeout_secs = 15
//!
//! [sync]
//! interval_minutes = 30
//! batch_days = 7
//! retry_attempts = 3
//!
//! [cache]
//! fresh_minutes = 5
//! stale_minutes = 15
//! retention_days = 30
//!
//! [permission]
//! offline_trust_max_age_hours = 72
//!
//! [live]
//! debounce_ms = 1000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use vitals_types::{
    DEFAULT_BATCH_DAYS, DEFAULT_INTERVAL_MINUTES, DEFAULT_RETRY_ATTEMPTS, FreshnessThresholds,
    SyncConfig,
};

/// Full engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub api: ApiConfig,
    pub sync: SyncDefaults,
    pub cache: CacheConfig,
    pub permission: PermissionConfig,
    pub live: LiveConfig,
    pub storage: StorageConfig,
}

impl EngineConfig {
    /// Load configuration from the default path, or defaults if absent.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.api.validate());
        errors.extend(self.sync.validate());
        errors.extend(self.cache.validate());
        errors.extend(self.live.validate());
        errors.extend(self.storage.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Build a per-user [`SyncConfig`] using this file's cadence defaults.
    pub fn sync_config(&self, user_id: impl Into<String>, token: impl Into<String>) -> SyncConfig {
        SyncConfig::new(user_id, token)
            .interval_minutes(self.sync.interval_minutes)
            .batch_days(self.sync.batch_days)
            .retry_attempts(self.sync.retry_attempts)
    }
}

/// Remote API settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the authorization, permission and metrics services.
    pub base_url: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".to_string(),
            timeout_secs: 15,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            errors.push(ValidationError::new(
                "api.base_url",
                format!(
                    "URL must start with http:// or https://, got '{}'",
                    self.base_url
                ),
            ));
        }

        if !(1..=120).contains(&self.timeout_secs) {
            errors.push(ValidationError::new(
                "api.timeout_secs",
                format!(
                    "timeout {} is out of range (1-120 seconds)",
                    self.timeout_secs
                ),
            ));
        }

        errors
    }
}

/// Default cadence applied to new per-user sync configs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncDefaults {
    pub interval_minutes: u32,
    pub batch_days: u32,
    pub retry_attempts: u32,
}

/// Upper bound on the first-sync batch.
pub const MAX_BATCH_DAYS: u32 = 90;

impl Default for SyncDefaults {
    fn default() -> Self {
        Self {
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            batch_days: DEFAULT_BATCH_DAYS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
        }
    }
}

impl SyncDefaults {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.interval_minutes == 0 {
            errors.push(ValidationError::new(
                "sync.interval_minutes",
                "interval must be at least one minute",
            ));
        }
        if self.batch_days == 0 || self.batch_days > MAX_BATCH_DAYS {
            errors.push(ValidationError::new(
                "sync.batch_days",
                format!(
                    "batch of {} days is out of range (1-{})",
                    self.batch_days, MAX_BATCH_DAYS
                ),
            ));
        }
        if self.retry_attempts > 10 {
            errors.push(ValidationError::new(
                "sync.retry_attempts",
                format!("{} retries is too many (maximum 10)", self.retry_attempts),
            ));
        }

        errors
    }
}

/// Freshness thresholds and retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub fresh_minutes: u64,
    pub stale_minutes: u64,
    pub retention_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fresh_minutes: 5,
            stale_minutes: 15,
            retention_days: 30,
        }
    }
}

impl CacheConfig {
    pub fn thresholds(&self) -> FreshnessThresholds {
        FreshnessThresholds {
            fresh_for: Duration::from_secs(self.fresh_minutes * 60),
            stale_for: Duration::from_secs(self.stale_minutes * 60),
        }
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.stale_minutes < self.fresh_minutes {
            errors.push(ValidationError::new(
                "cache.stale_minutes",
                format!(
                    "stale threshold ({} min) must not be below fresh threshold ({} min)",
                    self.stale_minutes, self.fresh_minutes
                ),
            ));
        }
        if self.retention_days == 0 {
            errors.push(ValidationError::new(
                "cache.retention_days",
                "retention must be at least one day",
            ));
        }

        errors
    }
}

/// Permission fallback settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// How long a cached "granted" hint may be trusted while the backend is
    /// unreachable. `0` removes the bound.
    pub offline_trust_max_age_hours: u64,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            offline_trust_max_age_hours: 72,
        }
    }
}

impl PermissionConfig {
    pub fn offline_trust_max_age(&self) -> Option<Duration> {
        match self.offline_trust_max_age_hours {
            0 => None,
            hours => Some(Duration::from_secs(hours * 3600)),
        }
    }
}

/// Live-metrics serving settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Settle time before an auto-refresh fires.
    pub debounce_ms: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self { debounce_ms: 1000 }
    }
}

impl LiveConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        if self.debounce_ms > 60_000 {
            vec![ValidationError::new(
                "live.debounce_ms",
                format!("debounce {} ms is too long (maximum 60000)", self.debounce_ms),
            )]
        } else {
            Vec::new()
        }
    }
}

/// Local storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Key-value database file path.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: vitals_store::default_db_path(),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        if self.path.as_os_str().is_empty() {
            vec![ValidationError::new(
                "storage.path",
                "database path cannot be empty",
            )]
        } else {
            Vec::new()
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path (e.g., `api.base_url`).
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vitals")
        .join("engine.toml")
}
