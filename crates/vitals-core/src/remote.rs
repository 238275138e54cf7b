//! Remote service interfaces and wire types.
//!
//! Three services sit behind the engine: the device authority, the
//! permission record and the metrics store. Each is an async trait so the
//! HTTP client ([`crate::ApiClient`]) and the in-process mock
//! ([`crate::mock::MockBackend`]) are interchangeable.
//!
//! Wire types use camelCase field names. Deserializing a response that lacks
//! a required field is an [`Error::InvalidResponse`](crate::Error), never a
//! silently defaulted value.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use vitals_types::{DailyMetrics, DeviceFingerprint, Platform, RegisteredDevice, date_key};

use crate::error::Result;

// ==========================================================================
// Device authority
// ==========================================================================

/// Body of `POST /devices/register`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceRequest {
    pub user_id: String,
    pub fingerprint: DeviceFingerprint,
    pub health_data_requested: bool,
}

/// Response of `POST /devices/register`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceResponse {
    pub success: bool,
    #[serde(default)]
    pub device: Option<RegisteredDevice>,
    #[serde(default)]
    pub is_new_device: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Response of `GET /devices/validate/{userId}/{deviceId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceValidation {
    pub is_registered: bool,
    pub is_health_data_enabled: bool,
    #[serde(default)]
    pub device: Option<RegisteredDevice>,
    #[serde(default)]
    pub requires_registration: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl DeviceValidation {
    /// The fail-closed answer used whenever the authority cannot be trusted.
    pub fn not_registered(requires_registration: bool, message: impl Into<String>) -> Self {
        Self {
            is_registered: false,
            is_health_data_enabled: false,
            device: None,
            requires_registration,
            message: Some(message.into()),
        }
    }

    /// Whether this answer permits syncing.
    #[must_use]
    pub fn allows_sync(&self) -> bool {
        self.is_registered && self.is_health_data_enabled
    }
}

/// Body of `PUT /devices/{deviceId}/health-permission`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthPermissionToggle {
    pub user_id: String,
    pub health_data_enabled: bool,
}

/// Body of `DELETE /devices/{deviceId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterRequest {
    pub user_id: String,
}

/// Minimal `{success}` acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// The remote device authorization service.
#[async_trait]
pub trait DeviceAuthority: Send + Sync {
    /// Register (or re-register) a device for a user.
    async fn register_device(&self, request: &RegisterDeviceRequest)
    -> Result<RegisterDeviceResponse>;

    /// Look up a device registration. Unknown devices are
    /// [`Error::NotFound`](crate::Error::NotFound).
    async fn validate_device(&self, user_id: &str, device_id: &str) -> Result<DeviceValidation>;

    /// Toggle the health-data flag on a registered device.
    async fn set_health_permission(
        &self,
        device_id: &str,
        user_id: &str,
        enabled: bool,
    ) -> Result<()>;

    /// Delete a device registration.
    async fn unregister_device(&self, device_id: &str, user_id: &str) -> Result<()>;

    /// Every device registered for a user.
    async fn list_user_devices(&self, user_id: &str) -> Result<Vec<RegisteredDevice>>;
}

// ==========================================================================
// Permission record
// ==========================================================================

/// Response of `GET /health-permission/status/{userId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePermission {
    pub success: bool,
    pub health_permission_granted: bool,
    #[serde(default)]
    pub health_permission_platform: Option<Platform>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub health_permission_granted_at: Option<OffsetDateTime>,
}

/// Body of `POST /health-permission/update/{userId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionUpdate {
    pub granted: bool,
    pub platform: Platform,
}

/// The remote per-user permission record.
#[async_trait]
pub trait PermissionRecords: Send + Sync {
    async fn permission_status(&self, user_id: &str) -> Result<RemotePermission>;

    async fn update_permission(&self, user_id: &str, update: &PermissionUpdate) -> Result<()>;
}

// ==========================================================================
// Metrics store
// ==========================================================================

/// Body of `POST /health-data`: one day of metrics, flattened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsUpload {
    pub user_id: String,
    #[serde(with = "date_key")]
    pub date: Date,
    #[serde(flatten)]
    pub metrics: DailyMetrics,
    pub source_platform: Platform,
    pub device_identifier: String,
}

/// Response of `GET /health-data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsLookupResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Option<DailyMetrics>,
}

/// The remote per-day metrics store.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Upload one day. The bearer `token` comes from the sync config.
    async fn push_metrics(&self, token: &str, upload: &MetricsUpload) -> Result<()>;

    /// Fetch one day previously uploaded from a device.
    async fn fetch_metrics(
        &self,
        token: &str,
        user_id: &str,
        date: Date,
        device_identifier: &str,
    ) -> Result<Option<DailyMetrics>>;
}
