//! Local key-value persistence for the vitals sync engine.
//!
//! The engine persists small documents (device identity, sync config, last
//! sync result, per-day metric snapshots) under flat string keys. This crate
//! provides the [`KeyValueStore`] trait plus two implementations:
//!
//! - [`SqliteStore`]: durable storage in a single SQLite file
//! - [`MemoryStore`]: volatile storage with failure injection for tests
//!
//! # Example
//!
//! ```no_run
//! use vitals_store::{KeyValueStore, SqliteStore};
//!
//! let store = SqliteStore::open_default()?;
//! store.set("last_daily_sync", "2024-05-01T08:30:00Z")?;
//! let value = store.get("last_daily_sync")?;
//! # Ok::<(), vitals_store::Error>(())
//! ```

mod error;
mod memory;
mod schema;
mod store;

use serde::Serialize;
use serde::de::DeserializeOwned;

pub use error::{Error, Result};
pub use memory::MemoryStore;
pub use store::SqliteStore;

/// A flat string key-value store.
///
/// Implementations must be safe to share across tasks. Operations on
/// different keys are independent; a crash between two writes can leave
/// related keys partially updated.
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or overwrite a value.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value. Deleting a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// List keys starting with `prefix`, in ascending order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

impl dyn KeyValueStore {
    /// Read and deserialize a JSON value.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| Error::Serialization {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Serialize and store a JSON value.
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value).map_err(|source| Error::Serialization {
            key: key.to_string(),
            source,
        })?;
        self.set(key, &raw)
    }
}

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/vitals/kv.db`
/// - macOS: `~/Library/Application Support/vitals/kv.db`
/// - Windows: `C:\Users\<user>\AppData\Local\vitals\kv.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("vitals")
        .join("kv.db")
}
