//! In-process test doubles for the health source and the remote services.
//!
//! [`MockHealthSource`] implements [`HealthDataSource`]; [`MockBackend`]
//! implements [`DeviceAuthority`], [`PermissionRecords`] and
//! [`MetricsStore`] at once, so a whole engine can run without a network.
//!
//! # Features
//!
//! - **Failure injection**: fail specific dates, or take the backend offline
//! - **Latency simulation**: add artificial delays to every call
//! - **Call accounting**: counters and request logs for assertions

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use time::{Date, OffsetDateTime};

use vitals_types::{DailyMetrics, Platform, RegisteredDevice, format_date_key};

use crate::error::{Error, Result};
use crate::health::HealthDataSource;
use crate::remote::{
    DeviceAuthority, DeviceValidation, MetricsStore, MetricsUpload, PermissionRecords,
    PermissionUpdate, RegisterDeviceRequest, RegisterDeviceResponse, RemotePermission,
};

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

async fn simulate_latency(latency_ms: &AtomicU64) {
    let ms = latency_ms.load(Ordering::Relaxed);
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

// ==========================================================================
// Health source
// ==========================================================================

/// A scriptable health-data source.
///
/// Days without explicit data return generated metrics derived from the
/// date, so every day is "valid" unless told otherwise.
///
/// ```
/// use time::macros::date;
/// use vitals_core::{HealthDataSource, mock::MockHealthSource};
/// use vitals_types::Platform;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let source = MockHealthSource::new(Platform::Ios);
/// source.fail_date(date!(2024 - 05 - 03));
/// assert!(source.get_health_data(date!(2024 - 05 - 03)).await.is_err());
/// assert!(source.get_health_data(date!(2024 - 05 - 04)).await.is_ok());
/// # }
/// ```
#[derive(Debug)]
pub struct MockHealthSource {
    platform: Platform,
    available: AtomicBool,
    os_permission: RwLock<Option<bool>>,
    data: RwLock<HashMap<Date, DailyMetrics>>,
    failing_dates: RwLock<HashSet<Date>>,
    requested: RwLock<Vec<Date>>,
    read_count: AtomicU32,
    latency_ms: AtomicU64,
}

impl MockHealthSource {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            available: AtomicBool::new(true),
            os_permission: RwLock::new(Some(true)),
            data: RwLock::new(HashMap::new()),
            failing_dates: RwLock::new(HashSet::new()),
            requested: RwLock::new(Vec::new()),
            read_count: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Metrics generated for a day with no explicit data.
    pub fn generated(date: Date) -> DailyMetrics {
        let seed = u32::from(date.ordinal());
        DailyMetrics {
            steps: 4000 + seed * 13,
            calories: 250.0 + f64::from(seed),
            heart_rate: Some(60 + seed % 30),
            active_minutes: 20 + seed % 40,
            distance: 3000.0 + f64::from(seed) * 10.0,
            spo2: Some(97.0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_os_permission(&self, granted: Option<bool>) {
        *write(&self.os_permission) = granted;
    }

    pub fn set_data(&self, date: Date, metrics: DailyMetrics) {
        write(&self.data).insert(date, metrics);
    }

    /// Make reads for `date` fail.
    pub fn fail_date(&self, date: Date) {
        write(&self.failing_dates).insert(date);
    }

    pub fn clear_failures(&self) {
        write(&self.failing_dates).clear();
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Number of `get_health_data` calls so far.
    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::SeqCst)
    }

    /// Dates requested so far, in call order.
    pub fn requested_dates(&self) -> Vec<Date> {
        read(&self.requested).clone()
    }

    pub fn reset_counters(&self) {
        self.read_count.store(0, Ordering::SeqCst);
        write(&self.requested).clear();
    }
}

impl Default for MockHealthSource {
    fn default() -> Self {
        Self::new(Platform::Ios)
    }
}

#[async_trait]
impl HealthDataSource for MockHealthSource {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn get_health_data(&self, date: Date) -> Result<DailyMetrics> {
        self.read_count.fetch_add(1, Ordering::SeqCst);
        write(&self.requested).push(date);
        simulate_latency(&self.latency_ms).await;

        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("mock source disabled".into()));
        }
        if read(&self.failing_dates).contains(&date) {
            return Err(Error::Unavailable(format!(
                "no samples for {}",
                format_date_key(date)
            )));
        }

        Ok(read(&self.data)
            .get(&date)
            .cloned()
            .unwrap_or_else(|| Self::generated(date)))
    }

    async fn os_permission(&self) -> Option<bool> {
        *read(&self.os_permission)
    }
}

// ==========================================================================
// Backend
// ==========================================================================

/// An in-memory backend covering all three remote services.
#[derive(Debug, Default)]
pub struct MockBackend {
    devices: RwLock<HashMap<(String, String), RegisteredDevice>>,
    permissions: RwLock<HashMap<String, RemotePermission>>,
    uploads: RwLock<Vec<MetricsUpload>>,
    failing_push_dates: RwLock<HashSet<Date>>,
    offline: AtomicBool,
    permission_offline: AtomicBool,
    next_row: AtomicU32,
    register_count: AtomicU32,
    validate_count: AtomicU32,
    push_count: AtomicU32,
    latency_ms: AtomicU64,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail only permission-record calls with a network error.
    pub fn set_permission_offline(&self, offline: bool) {
        self.permission_offline.store(offline, Ordering::SeqCst);
    }

    /// Make uploads for `date` fail with a network error.
    pub fn fail_push_for(&self, date: Date) {
        write(&self.failing_push_dates).insert(date);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Seed the permission record for a user.
    pub fn set_permission(&self, user_id: &str, granted: bool, platform: Option<Platform>) {
        write(&self.permissions).insert(
            user_id.to_string(),
            RemotePermission {
                success: true,
                health_permission_granted: granted,
                health_permission_platform: platform,
                health_permission_granted_at: granted.then(OffsetDateTime::now_utc),
            },
        );
    }

    /// Devices registered for `user_id`.
    pub fn devices_for(&self, user_id: &str) -> Vec<RegisteredDevice> {
        let mut devices: Vec<_> = read(&self.devices)
            .iter()
            .filter(|((user, _), _)| user == user_id)
            .map(|(_, device)| device.clone())
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Every accepted upload, in arrival order.
    pub fn uploads(&self) -> Vec<MetricsUpload> {
        read(&self.uploads).clone()
    }

    pub fn register_count(&self) -> u32 {
        self.register_count.load(Ordering::SeqCst)
    }

    pub fn validate_count(&self) -> u32 {
        self.validate_count.load(Ordering::SeqCst)
    }

    /// Upload attempts, including failed ones.
    pub fn push_count(&self) -> u32 {
        self.push_count.load(Ordering::SeqCst)
    }

    async fn enter(&self, endpoint: &str) -> Result<()> {
        simulate_latency(&self.latency_ms).await;
        if self.offline.load(Ordering::SeqCst) {
            Err(Error::network(endpoint, "mock backend offline"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DeviceAuthority for MockBackend {
    async fn register_device(
        &self,
        request: &RegisterDeviceRequest,
    ) -> Result<RegisterDeviceResponse> {
        self.register_count.fetch_add(1, Ordering::SeqCst);
        self.enter("/devices/register").await?;

        let key = (
            request.user_id.clone(),
            request.fingerprint.device_id.clone(),
        );
        let now = OffsetDateTime::now_utc();
        let mut devices = write(&self.devices);
        let is_new_device = !devices.contains_key(&key);

        let device = devices
            .entry(key)
            .and_modify(|d| {
                d.health_data_enabled = request.health_data_requested;
                d.last_active_at = Some(now);
            })
            .or_insert_with(|| RegisteredDevice {
                id: format!("row-{}", self.next_row.fetch_add(1, Ordering::SeqCst) + 1),
                user_id: request.user_id.clone(),
                device_id: request.fingerprint.device_id.clone(),
                device_name: request.fingerprint.model.clone(),
                platform: request.fingerprint.platform,
                health_data_enabled: request.health_data_requested,
                registered_at: now,
                last_active_at: None,
            })
            .clone();

        Ok(RegisterDeviceResponse {
            success: true,
            device: Some(device),
            is_new_device,
            message: None,
        })
    }

    async fn validate_device(&self, user_id: &str, device_id: &str) -> Result<DeviceValidation> {
        self.validate_count.fetch_add(1, Ordering::SeqCst);
        let endpoint = format!("/devices/validate/{}/{}", user_id, device_id);
        self.enter(&endpoint).await?;

        let key = (user_id.to_string(), device_id.to_string());
        match read(&self.devices).get(&key) {
            Some(device) => Ok(DeviceValidation {
                is_registered: true,
                is_health_data_enabled: device.health_data_enabled,
                device: Some(device.clone()),
                requires_registration: false,
                message: None,
            }),
            None => Err(Error::NotFound(endpoint)),
        }
    }

    async fn set_health_permission(
        &self,
        device_id: &str,
        user_id: &str,
        enabled: bool,
    ) -> Result<()> {
        let endpoint = format!("/devices/{}/health-permission", device_id);
        self.enter(&endpoint).await?;

        let key = (user_id.to_string(), device_id.to_string());
        match write(&self.devices).get_mut(&key) {
            Some(device) => {
                device.health_data_enabled = enabled;
                Ok(())
            }
            None => Err(Error::NotFound(endpoint)),
        }
    }

    async fn unregister_device(&self, device_id: &str, user_id: &str) -> Result<()> {
        let endpoint = format!("/devices/{}", device_id);
        self.enter(&endpoint).await?;

        let key = (user_id.to_string(), device_id.to_string());
        match write(&self.devices).remove(&key) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(endpoint)),
        }
    }

    async fn list_user_devices(&self, user_id: &str) -> Result<Vec<RegisteredDevice>> {
        self.enter(&format!("/devices/user/{}", user_id)).await?;
        Ok(self.devices_for(user_id))
    }
}

#[async_trait]
impl PermissionRecords for MockBackend {
    async fn permission_status(&self, user_id: &str) -> Result<RemotePermission> {
        let endpoint = format!("/health-permission/status/{}", user_id);
        self.enter(&endpoint).await?;
        if self.permission_offline.load(Ordering::SeqCst) {
            return Err(Error::network(endpoint, "permission service offline"));
        }

        Ok(read(&self.permissions)
            .get(user_id)
            .cloned()
            .unwrap_or(RemotePermission {
                success: true,
                health_permission_granted: false,
                health_permission_platform: None,
                health_permission_granted_at: None,
            }))
    }

    async fn update_permission(&self, user_id: &str, update: &PermissionUpdate) -> Result<()> {
        let endpoint = format!("/health-permission/update/{}", user_id);
        self.enter(&endpoint).await?;
        if self.permission_offline.load(Ordering::SeqCst) {
            return Err(Error::network(endpoint, "permission service offline"));
        }

        self.set_permission(user_id, update.granted, Some(update.platform));
        Ok(())
    }
}

#[async_trait]
impl MetricsStore for MockBackend {
    async fn push_metrics(&self, _token: &str, upload: &MetricsUpload) -> Result<()> {
        self.push_count.fetch_add(1, Ordering::SeqCst);
        self.enter("/health-data").await?;

        if read(&self.failing_push_dates).contains(&upload.date) {
            return Err(Error::network(
                "/health-data",
                format!("connection reset uploading {}", format_date_key(upload.date)),
            ));
        }

        let mut uploads = write(&self.uploads);
        uploads.retain(|u| !(u.user_id == upload.user_id && u.date == upload.date));
        uploads.push(upload.clone());
        Ok(())
    }

    async fn fetch_metrics(
        &self,
        _token: &str,
        user_id: &str,
        date: Date,
        device_identifier: &str,
    ) -> Result<Option<DailyMetrics>> {
        self.enter("/health-data").await?;
        Ok(read(&self.uploads)
            .iter()
            .find(|u| {
                u.user_id == user_id && u.date == date && u.device_identifier == device_identifier
            })
            .map(|u| u.metrics.clone()))
    }
}
