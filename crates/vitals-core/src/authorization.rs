//! Device registration and the authorization gate in front of every sync.
//!
//! A device may sync only while it is registered with the remote authority
//! *and* has health data enabled. Remote calls fail closed: if the
//! authority cannot be reached, the device is treated as not authorized.
//!
//! Status transitions:
//!
//! ```text
//! Checking --register(enabled)--> Registered
//! Checking --register(disabled)-> Unregistered
//! any      --validate 404------> Unregistered
//! any      --network failure---> Error
//! any      --user changed------> Checking
//! ```

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use vitals_store::KeyValueStore;
use vitals_types::{RegisteredDevice, RegistrationStatus};

use crate::context::AuthContext;
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, SyncEvent};
use crate::identity::DeviceIdentity;
use crate::remote::{DeviceAuthority, DeviceValidation, RegisterDeviceRequest};

const REGISTERED_DEVICE_KEY: &str = "registered_device";

/// What a successful registration returned.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationOutcome {
    pub device: RegisteredDevice,
    pub is_new_device: bool,
    pub message: Option<String>,
}

#[derive(Debug)]
struct GateState {
    /// Auth context generation the status was recorded under.
    generation: u64,
    status: RegistrationStatus,
    health_data_enabled: bool,
}

/// Registers, validates and unregisters this device.
pub struct DeviceAuthorizationGate {
    authority: Arc<dyn DeviceAuthority>,
    identity: Arc<DeviceIdentity>,
    store: Arc<dyn KeyValueStore>,
    context: AuthContext,
    events: EventDispatcher,
    state: Mutex<GateState>,
}

impl std::fmt::Debug for DeviceAuthorizationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAuthorizationGate")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl DeviceAuthorizationGate {
    pub fn new(
        authority: Arc<dyn DeviceAuthority>,
        identity: Arc<DeviceIdentity>,
        store: Arc<dyn KeyValueStore>,
        context: AuthContext,
        events: EventDispatcher,
    ) -> Self {
        let generation = context.generation();
        Self {
            authority,
            identity,
            store,
            context,
            events,
            state: Mutex::new(GateState {
                generation,
                status: RegistrationStatus::Checking,
                health_data_enabled: false,
            }),
        }
    }

    /// Current registration status.
    ///
    /// Reads as [`RegistrationStatus::Checking`] once the signed-in user
    /// changes, until the next validation or registration.
    pub fn status(&self) -> RegistrationStatus {
        let state = self.lock();
        if state.generation == self.context.generation() {
            state.status
        } else {
            RegistrationStatus::Checking
        }
    }

    /// Whether health data is enabled according to the last remote answer.
    pub fn health_data_enabled(&self) -> bool {
        let state = self.lock();
        state.generation == self.context.generation() && state.health_data_enabled
    }

    /// The locally mirrored registration, if any.
    pub fn local_device(&self) -> Option<RegisteredDevice> {
        match self.store.get_json(REGISTERED_DEVICE_KEY) {
            Ok(device) => device,
            Err(e) => {
                debug!("Registered device mirror unreadable: {}", e);
                None
            }
        }
    }

    /// Register this device for `user_id`.
    ///
    /// Re-registering an already known device updates its record.
    pub async fn register_device(
        &self,
        user_id: &str,
        enable_health_data: bool,
    ) -> Result<RegistrationOutcome> {
        let generation = self.context.generation();
        let request = RegisterDeviceRequest {
            user_id: user_id.to_string(),
            fingerprint: self.identity.fingerprint(),
            health_data_requested: enable_health_data,
        };

        let response = match self.authority.register_device(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Device registration failed: {}", e);
                self.record(generation, RegistrationStatus::Error, false);
                return Err(e);
            }
        };

        let Some(device) = response.device else {
            self.record(generation, RegistrationStatus::Error, false);
            return Err(Error::invalid_response(
                "/devices/register",
                "registration succeeded without a device record",
            ));
        };

        self.mirror(Some(&device));
        let status = if device.health_data_enabled {
            RegistrationStatus::Registered
        } else {
            RegistrationStatus::Unregistered
        };
        self.record(generation, status, device.health_data_enabled);

        info!(
            "Device {} registered for user {} (new: {})",
            device.device_id, user_id, response.is_new_device
        );
        Ok(RegistrationOutcome {
            device,
            is_new_device: response.is_new_device,
            message: response.message,
        })
    }

    /// Ask the authority whether this device is registered for `user_id`.
    ///
    /// Never fails: an unknown device reports `requires_registration`, and
    /// any other failure reports not registered.
    pub async fn validate_device_registration(&self, user_id: &str) -> DeviceValidation {
        let generation = self.context.generation();
        let device_id = self.identity.device_id();

        match self.authority.validate_device(user_id, &device_id).await {
            Ok(validation) => {
                if validation.is_registered {
                    if let Some(device) = &validation.device {
                        self.mirror(Some(device));
                    }
                } else {
                    self.mirror(None);
                }
                let status = if validation.allows_sync() {
                    RegistrationStatus::Registered
                } else {
                    RegistrationStatus::Unregistered
                };
                self.record(generation, status, validation.is_health_data_enabled);
                validation
            }
            Err(e) if e.is_not_found() => {
                debug!("Device {} unknown to authority", device_id);
                self.mirror(None);
                self.record(generation, RegistrationStatus::Unregistered, false);
                DeviceValidation::not_registered(true, "Device not registered")
            }
            Err(e) => {
                warn!("Device validation failed, treating as unregistered: {}", e);
                self.record(generation, RegistrationStatus::Error, false);
                DeviceValidation::not_registered(false, e.to_string())
            }
        }
    }

    /// Enable or disable health data for this device.
    pub async fn update_health_data_permission(&self, user_id: &str, enabled: bool) -> Result<()> {
        let generation = self.context.generation();
        let device_id = self.identity.device_id();

        match self
            .authority
            .set_health_permission(&device_id, user_id, enabled)
            .await
        {
            Ok(()) => {
                if let Some(mut device) = self.local_device() {
                    device.health_data_enabled = enabled;
                    self.mirror(Some(&device));
                }
                let status = if enabled {
                    RegistrationStatus::Registered
                } else {
                    RegistrationStatus::Unregistered
                };
                self.record(generation, status, enabled);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                self.mirror(None);
                self.record(generation, RegistrationStatus::Unregistered, false);
                Err(e)
            }
            Err(e) => {
                warn!("Health data toggle failed: {}", e);
                self.record(generation, RegistrationStatus::Error, false);
                Err(e)
            }
        }
    }

    /// Remove this device's registration.
    ///
    /// A device the authority no longer knows counts as unregistered.
    pub async fn unregister_device(&self, user_id: &str) -> Result<()> {
        let generation = self.context.generation();
        let device_id = self.identity.device_id();

        match self.authority.unregister_device(&device_id, user_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("Device {} already unregistered", device_id),
            Err(e) => {
                warn!("Device unregistration failed: {}", e);
                return Err(e);
            }
        }

        self.mirror(None);
        self.record(generation, RegistrationStatus::Unregistered, false);
        info!("Device {} unregistered for user {}", device_id, user_id);
        Ok(())
    }

    /// Every device the authority knows for `user_id`.
    pub async fn list_user_devices(&self, user_id: &str) -> Result<Vec<RegisteredDevice>> {
        self.authority.list_user_devices(user_id).await
    }

    /// Validate, then report whether syncing is allowed.
    pub async fn is_sync_allowed(&self, user_id: &str) -> bool {
        self.validate_device_registration(user_id)
            .await
            .allows_sync()
    }

    /// Like [`is_sync_allowed`](Self::is_sync_allowed), with the reason on
    /// refusal.
    pub async fn authorize_sync(&self, user_id: &str) -> Result<()> {
        let validation = self.validate_device_registration(user_id).await;
        if validation.allows_sync() {
            return Ok(());
        }

        let reason = if !validation.is_registered {
            match validation.message {
                Some(message) if !validation.requires_registration => {
                    format!("device registration could not be verified ({message})")
                }
                _ => "device is not registered".to_string(),
            }
        } else {
            "health data is disabled for this device".to_string()
        };
        Err(Error::Authorization(reason))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a status observed under `generation`. Observations from a
    /// previous signed-in user are dropped.
    fn record(&self, generation: u64, status: RegistrationStatus, health_data_enabled: bool) {
        if generation != self.context.generation() {
            debug!("Dropping registration status from a previous session");
            return;
        }

        let changed = {
            let mut state = self.lock();
            let previous = if state.generation == generation {
                state.status
            } else {
                RegistrationStatus::Checking
            };
            state.generation = generation;
            state.status = status;
            state.health_data_enabled = health_data_enabled;
            previous != status
        };

        if changed {
            debug!("Registration status -> {}", status);
            self.events.send(SyncEvent::RegistrationChanged { status });
        }
    }

    fn mirror(&self, device: Option<&RegisteredDevice>) {
        let result = match device {
            Some(device) => self.store.set_json(REGISTERED_DEVICE_KEY, device),
            None => self.store.remove(REGISTERED_DEVICE_KEY),
        };
        if let Err(e) = result {
            warn!("Failed to update registered device mirror: {}", e);
        }
    }
}
