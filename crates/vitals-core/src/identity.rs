//! Stable device identity.
//!
//! The device id is derived once from a per-installation UUID and the
//! device's static characteristics, then persisted. It must never change
//! for the lifetime of an installation, because the remote authority keys
//! registrations on it.

use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use vitals_store::KeyValueStore;
use vitals_types::{DeviceFingerprint, Platform};

use crate::error::Result;

const DEVICE_ID_KEY: &str = "device_id";
const INSTALLATION_ID_KEY: &str = "installation_id";
const FINGERPRINT_KEY: &str = "device_fingerprint";

/// Length of the derived device id in hex characters.
const DEVICE_ID_LEN: usize = 32;

/// Static facts about the device, supplied by the host platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCharacteristics {
    pub platform: Platform,
    pub model: String,
    pub manufacturer: String,
    /// Human-readable name shown in device lists.
    pub device_name: String,
}

impl DeviceCharacteristics {
    pub fn new(
        platform: Platform,
        model: impl Into<String>,
        manufacturer: impl Into<String>,
    ) -> Self {
        let model = model.into();
        Self {
            platform,
            device_name: model.clone(),
            model,
            manufacturer: manufacturer.into(),
        }
    }

    #[must_use]
    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }
}

impl Default for DeviceCharacteristics {
    fn default() -> Self {
        Self::new(Platform::Unknown, "unknown", "unknown")
    }
}

/// Where the current device id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityOrigin {
    /// Read from or written to the persistent store.
    Persisted,
    /// Storage failed; the id lives only as long as this process.
    Ephemeral,
}

#[derive(Debug, Default)]
struct IdentityState {
    device_id: Option<String>,
    origin: Option<IdentityOrigin>,
    fingerprint: Option<DeviceFingerprint>,
}

/// Generates, persists and serves this device's identity.
pub struct DeviceIdentity {
    store: Arc<dyn KeyValueStore>,
    characteristics: DeviceCharacteristics,
    state: Mutex<IdentityState>,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("characteristics", &self.characteristics)
            .finish_non_exhaustive()
    }
}

impl DeviceIdentity {
    pub fn new(store: Arc<dyn KeyValueStore>, characteristics: DeviceCharacteristics) -> Self {
        Self {
            store,
            characteristics,
            state: Mutex::new(IdentityState::default()),
        }
    }

    pub fn characteristics(&self) -> &DeviceCharacteristics {
        &self.characteristics
    }

    /// The stable device id.
    ///
    /// The first call in an installation derives and persists the id; later
    /// calls return the same value. If the store cannot be used, an
    /// `ephemeral-` id is generated and kept in memory instead.
    pub fn device_id(&self) -> String {
        let mut state = self.lock();
        if let Some(id) = &state.device_id {
            return id.clone();
        }

        let (id, origin) = match self.load_or_derive() {
            Ok(id) => (id, IdentityOrigin::Persisted),
            Err(e) => {
                let id = format!("ephemeral-{}", Uuid::new_v4().simple());
                warn!("Device id storage failed ({}), using {}", e, id);
                (id, IdentityOrigin::Ephemeral)
            }
        };

        state.device_id = Some(id.clone());
        state.origin = Some(origin);
        id
    }

    /// Where the current id came from, once [`device_id`](Self::device_id)
    /// has run.
    pub fn origin(&self) -> Option<IdentityOrigin> {
        self.lock().origin
    }

    /// The fingerprint sent with registration requests.
    pub fn fingerprint(&self) -> DeviceFingerprint {
        let device_id = self.device_id();

        if let Some(fp) = &self.lock().fingerprint {
            return fp.clone();
        }

        let fingerprint = match self.store.get_json::<DeviceFingerprint>(FINGERPRINT_KEY) {
            Ok(Some(fp)) if fp.device_id == device_id => fp,
            Ok(_) => self.compute_fingerprint(device_id),
            Err(e) => {
                debug!("Stored fingerprint unreadable: {}", e);
                self.compute_fingerprint(device_id)
            }
        };

        self.lock().fingerprint = Some(fingerprint.clone());
        fingerprint
    }

    /// Forget the persisted identity.
    ///
    /// The next [`device_id`](Self::device_id) call behaves like a fresh
    /// installation.
    pub fn clear(&self) -> Result<()> {
        for key in [DEVICE_ID_KEY, INSTALLATION_ID_KEY, FINGERPRINT_KEY] {
            self.store.remove(key)?;
        }
        *self.lock() = IdentityState::default();
        info!("Device identity cleared");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IdentityState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load_or_derive(&self) -> vitals_store::Result<String> {
        if let Some(id) = self.store.get(DEVICE_ID_KEY)? {
            return Ok(id);
        }

        let installation_id = self.installation_id()?;
        let c = &self.characteristics;
        let digest = sha256_hex(&format!(
            "{}|{}|{}|{}",
            installation_id, c.platform, c.model, c.manufacturer
        ));
        let id = digest[..DEVICE_ID_LEN].to_string();

        self.store.set(DEVICE_ID_KEY, &id)?;
        info!("Derived new device id {}", id);
        Ok(id)
    }

    fn installation_id(&self) -> vitals_store::Result<String> {
        if let Some(id) = self.store.get(INSTALLATION_ID_KEY)? {
            return Ok(id);
        }
        let id = Uuid::new_v4().to_string();
        self.store.set(INSTALLATION_ID_KEY, &id)?;
        Ok(id)
    }

    fn compute_fingerprint(&self, device_id: String) -> DeviceFingerprint {
        let installation_id = match self.store.get(INSTALLATION_ID_KEY) {
            Ok(Some(id)) => id,
            _ => String::new(),
        };
        let c = &self.characteristics;
        let hash = sha256_hex(&format!(
            "{}|{}|{}|{}|{}",
            device_id, installation_id, c.platform, c.model, c.manufacturer
        ));

        let fingerprint = DeviceFingerprint {
            device_id,
            installation_id,
            platform: c.platform,
            model: c.model.clone(),
            manufacturer: c.manufacturer.clone(),
            hash,
        };

        if let Err(e) = self.store.set_json(FINGERPRINT_KEY, &fingerprint) {
            warn!("Failed to persist device fingerprint: {}", e);
        }
        fingerprint
    }
}

fn sha256_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitals_store::MemoryStore;

    fn phone() -> DeviceCharacteristics {
        DeviceCharacteristics::new(Platform::Android, "Pixel 8", "Google").device_name("Work phone")
    }

    #[test]
    fn test_device_id_is_stable() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let identity = DeviceIdentity::new(Arc::clone(&store), phone());

        let first = identity.device_id();
        assert_eq!(first.len(), DEVICE_ID_LEN);
        assert_eq!(identity.device_id(), first);
        assert_eq!(identity.origin(), Some(IdentityOrigin::Persisted));

        // A new instance over the same store reads the persisted id.
        let again = DeviceIdentity::new(store, phone());
        assert_eq!(again.device_id(), first);
    }

    #[test]
    fn test_installations_get_distinct_ids() {
        let a = DeviceIdentity::new(Arc::new(MemoryStore::new()), phone());
        let b = DeviceIdentity::new(Arc::new(MemoryStore::new()), phone());
        assert_ne!(a.device_id(), b.device_id());
    }

    #[test]
    fn test_storage_failure_falls_back_to_ephemeral() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_reads(true);
        let identity = DeviceIdentity::new(store, phone());

        let id = identity.device_id();
        assert!(id.starts_with("ephemeral-"));
        assert_eq!(identity.origin(), Some(IdentityOrigin::Ephemeral));
        // Kept for the process lifetime.
        assert_eq!(identity.device_id(), id);
    }

    #[test]
    fn test_fingerprint_matches_identity() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let identity = DeviceIdentity::new(Arc::clone(&store), phone());

        let fp = identity.fingerprint();
        assert_eq!(fp.device_id, identity.device_id());
        assert_eq!(fp.platform, Platform::Android);
        assert_eq!(fp.model, "Pixel 8");
        assert_eq!(fp.hash.len(), 64);
        assert!(!fp.installation_id.is_empty());

        let persisted: Option<DeviceFingerprint> = store.get_json(FINGERPRINT_KEY).unwrap();
        assert_eq!(persisted, Some(fp.clone()));
        assert_eq!(identity.fingerprint(), fp);
    }

    #[test]
    fn test_clear_resets_identity() {
        let identity = DeviceIdentity::new(Arc::new(MemoryStore::new()), phone());
        let before = identity.device_id();
        identity.clear().unwrap();
        assert_eq!(identity.origin(), None);
        assert_ne!(identity.device_id(), before);
    }
}
