//! HTTP client for the remote authorization, permission and metrics services.
//!
//! [`ApiClient`] implements [`DeviceAuthority`], [`PermissionRecords`] and
//! [`MetricsStore`] against a single base URL.
//!
//! # Example
//!
//! ```no_run
//! use vitals_core::{ApiClient, DeviceAuthority};
//!
//! # async fn example() -> Result<(), vitals_core::Error> {
//! let client = ApiClient::new("https://health.example.com/api")?;
//! let devices = client.list_user_devices("42").await?;
//! println!("{} devices", devices.len());
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::Date;
use tracing::debug;

use vitals_types::{DailyMetrics, RegisteredDevice, format_date_key};

use crate::context::AuthContext;
use crate::error::{Error, Result};
use crate::remote::{
    DeviceAuthority, DeviceValidation, HealthPermissionToggle, MetricsLookupResponse,
    MetricsStore, MetricsUpload, PermissionRecords, PermissionUpdate, RegisterDeviceRequest,
    RegisterDeviceResponse, RemotePermission, SuccessResponse, UnregisterRequest,
};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// HTTP client for the vitals backend.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    base: Url,
    timeout: Duration,
    context: Option<AuthContext>,
}

impl ApiClient {
    /// Create a client with the default timeout.
    ///
    /// `base_url` must start with `http://` or `https://`; a trailing slash
    /// is dropped.
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    /// Create a client with an explicit per-request timeout.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::invalid_config(format!("failed to build HTTP client: {e}")))?;
        Self::with_client(base_url, client, timeout)
    }

    /// Create a client around an existing reqwest `Client`.
    pub fn with_client(base_url: &str, client: Client, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::invalid_config(format!(
                "URL must start with http:// or https://, got: {}",
                base_url
            )));
        }
        let base = Url::parse(&base_url)
            .map_err(|e| Error::invalid_config(format!("invalid URL {}: {}", base_url, e)))?;

        Ok(Self {
            client,
            base_url,
            base,
            timeout,
            context: None,
        })
    }

    /// Attach the session context; its token is sent as a bearer credential
    /// on calls that do not carry their own.
    #[must_use]
    pub fn with_context(mut self, context: AuthContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    // ======================================================================
    // Internal HTTP helpers
    // ======================================================================

    fn session_token(&self) -> Option<String> {
        self.context.as_ref().and_then(AuthContext::token)
    }

    /// Base URL extended by `segments`, each percent-encoded as one path
    /// segment.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| Error::invalid_config(format!("{} cannot be a base URL", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn request<T, B>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&B>,
        query: Option<&[(&str, &str)]>,
        token: Option<&str>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let endpoint = endpoint_label(segments);
        let endpoint = endpoint.as_str();
        let url = self.url(segments)?;
        debug!("{} {}", method, url);

        let mut builder = self.client.request(method, url);
        if let Some(query) = query {
            builder = builder.query(query);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let session_token = self.session_token();
        let token = token.filter(|t| !t.is_empty()).or(session_token.as_deref());
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::timeout(endpoint, self.timeout)
            } else {
                Error::network(endpoint, e.to_string())
            }
        })?;

        self.handle_response(endpoint, response).await
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                Error::timeout(endpoint, self.timeout)
            } else {
                Error::network(endpoint, e.to_string())
            }
        })?;

        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(endpoint.to_string()));
        }

        if !status.is_success() {
            let message = serde_json::from_slice::<serde_json::Value>(&bytes)
                .ok()
                .and_then(|v| {
                    v.get("error")
                        .or_else(|| v.get("message"))
                        .and_then(|e| e.as_str())
                        .map(String::from)
                })
                .unwrap_or_else(|| status.to_string());

            return Err(Error::Api {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_slice(&bytes).map_err(|e| Error::invalid_response(endpoint, e.to_string()))
    }

    fn expect_success(endpoint: &str, response: SuccessResponse) -> Result<()> {
        if response.success {
            Ok(())
        } else {
            Err(Error::Api {
                endpoint: endpoint.to_string(),
                status: StatusCode::OK.as_u16(),
                message: "request reported success: false".to_string(),
            })
        }
    }
}

/// Unencoded endpoint path, for logs and error messages.
fn endpoint_label(segments: &[&str]) -> String {
    format!("/{}", segments.join("/"))
}

#[async_trait]
impl DeviceAuthority for ApiClient {
    async fn register_device(
        &self,
        request: &RegisterDeviceRequest,
    ) -> Result<RegisterDeviceResponse> {
        let endpoint = "/devices/register";
        let response: RegisterDeviceResponse = self
            .request(Method::POST, &["devices", "register"], Some(request), None, None)
            .await?;

        if !response.success {
            return Err(Error::Api {
                endpoint: endpoint.to_string(),
                status: StatusCode::OK.as_u16(),
                message: response
                    .message
                    .unwrap_or_else(|| "registration rejected".to_string()),
            });
        }
        Ok(response)
    }

    async fn validate_device(&self, user_id: &str, device_id: &str) -> Result<DeviceValidation> {
        let segments = ["devices", "validate", user_id, device_id];
        self.request::<_, ()>(Method::GET, &segments, None, None, None)
            .await
    }

    async fn set_health_permission(
        &self,
        device_id: &str,
        user_id: &str,
        enabled: bool,
    ) -> Result<()> {
        let segments = ["devices", device_id, "health-permission"];
        let body = HealthPermissionToggle {
            user_id: user_id.to_string(),
            health_data_enabled: enabled,
        };
        let response = self
            .request(Method::PUT, &segments, Some(&body), None, None)
            .await?;
        Self::expect_success(&endpoint_label(&segments), response)
    }

    async fn unregister_device(&self, device_id: &str, user_id: &str) -> Result<()> {
        let segments = ["devices", device_id];
        let body = UnregisterRequest {
            user_id: user_id.to_string(),
        };
        let response = self
            .request(Method::DELETE, &segments, Some(&body), None, None)
            .await?;
        Self::expect_success(&endpoint_label(&segments), response)
    }

    async fn list_user_devices(&self, user_id: &str) -> Result<Vec<RegisteredDevice>> {
        self.request::<_, ()>(Method::GET, &["devices", "user", user_id], None, None, None)
            .await
    }
}

#[async_trait]
impl PermissionRecords for ApiClient {
    async fn permission_status(&self, user_id: &str) -> Result<RemotePermission> {
        let segments = ["health-permission", "status", user_id];
        self.request::<_, ()>(Method::GET, &segments, None, None, None)
            .await
    }

    async fn update_permission(&self, user_id: &str, update: &PermissionUpdate) -> Result<()> {
        let segments = ["health-permission", "update", user_id];
        let response = self
            .request(Method::POST, &segments, Some(update), None, None)
            .await?;
        Self::expect_success(&endpoint_label(&segments), response)
    }
}

#[async_trait]
impl MetricsStore for ApiClient {
    async fn push_metrics(&self, token: &str, upload: &MetricsUpload) -> Result<()> {
        let response = self
            .request(Method::POST, &["health-data"], Some(upload), None, Some(token))
            .await?;
        Self::expect_success("/health-data", response)
    }

    async fn fetch_metrics(
        &self,
        token: &str,
        user_id: &str,
        date: Date,
        device_identifier: &str,
    ) -> Result<Option<DailyMetrics>> {
        let date = format_date_key(date);
        let query = [
            ("userId", user_id),
            ("date", date.as_str()),
            ("deviceIdentifier", device_identifier),
        ];
        let response: MetricsLookupResponse = match self
            .request::<_, ()>(Method::GET, &["health-data"], None, Some(&query[..]), Some(token))
            .await
        {
            Ok(response) => response,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        if response.success {
            Ok(response.data)
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;
    use vitals_types::{DeviceFingerprint, Platform};
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::context::Session;

    fn fingerprint() -> DeviceFingerprint {
        DeviceFingerprint {
            device_id: "dev-1".into(),
            installation_id: "inst-1".into(),
            platform: Platform::Ios,
            model: "iPhone15,2".into(),
            manufacturer: "Apple".into(),
            hash: "abc".into(),
        }
    }

    fn device_json() -> serde_json::Value {
        serde_json::json!({
            "id": "row-1",
            "userId": "42",
            "deviceId": "dev-1",
            "deviceName": "Phone",
            "platform": "ios",
            "healthDataEnabled": true,
            "registeredAt": "2024-05-01T10:00:00Z",
            "lastActiveAt": null
        })
    }

    #[test]
    fn test_client_normalizes_url() {
        let client = ApiClient::new("http://localhost:3000/api/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:3000/api");
        assert_eq!(client.timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_client_invalid_url() {
        let result = ApiClient::new("localhost:3000");
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_register_device() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/devices/register"))
            .and(body_partial_json(serde_json::json!({
                "userId": "42",
                "healthDataRequested": true,
                "fingerprint": { "deviceId": "dev-1" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "device": device_json(),
                "isNewDevice": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri()).unwrap();
        let response = client
            .register_device(&RegisterDeviceRequest {
                user_id: "42".into(),
                fingerprint: fingerprint(),
                health_data_requested: true,
            })
            .await
            .unwrap();

        assert!(response.is_new_device);
        assert_eq!(response.device.unwrap().device_id, "dev-1");
    }

    #[tokio::test]
    async fn test_validate_unknown_device_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/devices/validate/42/dev-1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri()).unwrap();
        let err = client.validate_device("42", "dev-1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_missing_field_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/devices/validate/42/dev-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "isRegistered": true })),
            )
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri()).unwrap();
        let err = client.validate_device("42", "dev-1").await.unwrap_err();
        assert!(matches!(err, Error::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn test_server_error_carries_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health-permission/status/42"))
            .respond_with(
                ResponseTemplate::new(503)
                    .set_body_json(serde_json::json!({ "error": "maintenance" })),
            )
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri()).unwrap();
        match client.permission_status("42").await {
            Err(Error::Api {
                status, message, ..
            }) => {
                assert_eq!(status, 503);
                assert_eq!(message, "maintenance");
            }
            other => panic!("expected API error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_error() {
        // Nothing listens on the discard port.
        let client = ApiClient::with_timeout("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = client.list_user_devices("42").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Network { .. } | Error::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn test_push_metrics_uses_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/health-data"))
            .and(header("authorization", "Bearer sync-token"))
            .and(body_partial_json(serde_json::json!({
                "userId": "42",
                "date": "2024-05-03",
                "steps": 1200
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri()).unwrap();
        let upload = MetricsUpload {
            user_id: "42".into(),
            date: date!(2024 - 05 - 03),
            metrics: DailyMetrics {
                steps: 1200,
                ..Default::default()
            },
            source_platform: Platform::Android,
            device_identifier: "dev-1".into(),
        };
        client.push_metrics("sync-token", &upload).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_push_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/health-data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": false
            })))
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri()).unwrap();
        let upload = MetricsUpload {
            user_id: "42".into(),
            date: date!(2024 - 05 - 03),
            metrics: DailyMetrics::default(),
            source_platform: Platform::Ios,
            device_identifier: "dev-1".into(),
        };
        let err = client.push_metrics("t", &upload).await.unwrap_err();
        assert!(matches!(err, Error::Api { status: 200, .. }));
    }

    #[tokio::test]
    async fn test_fetch_metrics_query_and_session_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health-data"))
            .and(query_param("userId", "42"))
            .and(query_param("date", "2024-05-03"))
            .and(query_param("deviceIdentifier", "dev-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "data": {
                    "steps": 500,
                    "calories": 20.0,
                    "activeMinutes": 4,
                    "distance": 0.4
                }
            })))
            .mount(&server)
            .await;

        let context = AuthContext::signed_in(Session::new("42", "session-token"));
        let client = ApiClient::new(&server.uri()).unwrap().with_context(context);
        let metrics = client
            .fetch_metrics("t", "42", date!(2024 - 05 - 03), "dev-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(metrics.steps, 500);
        assert_eq!(metrics.heart_rate, None);
    }

    #[tokio::test]
    async fn test_session_token_sent_on_device_calls() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/devices/user/42"))
            .and(header("authorization", "Bearer session-token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!([device_json()])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let context = AuthContext::signed_in(Session::new("42", "session-token"));
        let client = ApiClient::new(&server.uri()).unwrap().with_context(context);
        let devices = client.list_user_devices("42").await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].platform, Platform::Ios);
    }

    #[tokio::test]
    async fn test_unregister_sends_body() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/devices/dev-1"))
            .and(body_partial_json(serde_json::json!({ "userId": "42" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri()).unwrap();
        client.unregister_device("dev-1", "42").await.unwrap();
    }

    #[tokio::test]
    async fn test_path_segments_are_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/devices/validate/a%2Fb%3Fc%23d/dev%201"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "isRegistered": true,
                "isHealthDataEnabled": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(&format!("{}/api", server.uri())).unwrap();
        let validation = client.validate_device("a/b?c#d", "dev 1").await.unwrap();
        assert!(validation.allows_sync());
    }

    #[tokio::test]
    async fn test_empty_token_falls_back_to_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/health-data"))
            .and(header("authorization", "Bearer session-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let context = AuthContext::signed_in(Session::new("42", "session-token"));
        let client = ApiClient::new(&server.uri()).unwrap().with_context(context);
        let upload = MetricsUpload {
            user_id: "42".into(),
            date: date!(2024 - 05 - 03),
            metrics: DailyMetrics::default(),
            source_platform: Platform::Ios,
            device_identifier: "dev-1".into(),
        };
        client.push_metrics("", &upload).await.unwrap();
    }
}
