//! Native health-data source abstraction.
//!
//! The host platform (HealthKit, Health Connect, or nothing at all on web)
//! is reached through [`HealthDataSource`]. The engine selects an
//! implementation once at construction; platforms without one get
//! [`UnavailableHealthSource`], so callers never branch on platform.

use std::sync::Arc;

use async_trait::async_trait;
use time::Date;

use vitals_types::{DailyMetrics, Platform};

use crate::error::{Error, Result};

/// Access to the platform's health store.
#[async_trait]
pub trait HealthDataSource: Send + Sync {
    /// Platform this source reads from.
    fn platform(&self) -> Platform;

    /// Whether the health capability exists on this device.
    async fn is_available(&self) -> bool;

    /// Aggregate metrics for one calendar day.
    async fn get_health_data(&self, date: Date) -> Result<DailyMetrics>;

    /// The OS-level read permission, if the platform can report it.
    ///
    /// `None` means the OS gives no answer; the permission resolver then
    /// falls back to the backend record.
    async fn os_permission(&self) -> Option<bool>;
}

/// Health source used where the platform has no health store.
#[derive(Debug, Clone, Copy)]
pub struct UnavailableHealthSource {
    platform: Platform,
}

impl UnavailableHealthSource {
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }
}

impl Default for UnavailableHealthSource {
    fn default() -> Self {
        Self::new(Platform::Unknown)
    }
}

#[async_trait]
impl HealthDataSource for UnavailableHealthSource {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn is_available(&self) -> bool {
        false
    }

    async fn get_health_data(&self, _date: Date) -> Result<DailyMetrics> {
        Err(Error::Unavailable(format!(
            "no health data source on {}",
            self.platform
        )))
    }

    async fn os_permission(&self) -> Option<bool> {
        None
    }
}

/// Pick the health source for this process.
pub fn select_health_source(
    native: Option<Arc<dyn HealthDataSource>>,
    platform: Platform,
) -> Arc<dyn HealthDataSource> {
    match native {
        Some(source) => source,
        None => Arc::new(UnavailableHealthSource::new(platform)),
    }
}
