// Durable key-value store seam
// Document-shaped replace-whole-value semantics: reads and writes swap
// entire serialized values, so exactly one process may own the store.

pub mod json_file;
pub mod memory;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::errors::StoreError;

/// Generic durable key-value store. Values are serialized JSON strings;
/// typed access goes through the helpers on `dyn DurableStore`.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read the raw serialized value for a key, if present.
    async fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Replace the whole value for a key.
    async fn set_raw(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Remove a key. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

impl dyn DurableStore {
    /// Read a typed value. An absent key or malformed stored JSON
    /// degrades to the supplied default rather than raising; corruption
    /// is logged and the caller keeps running.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        let raw = match self.get_raw(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return default,
            Err(e) => {
                warn!(key = key, error = %e, "Store read failed, using default");
                return default;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = key, error = %e, "Malformed stored JSON, using default");
                default
            }
        }
    }

    /// Write a typed value as JSON.
    pub async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value).map_err(|e| StoreError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.set_raw(key, raw).await
    }

    /// Read a boolean flag, defaulting when absent or malformed.
    pub async fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get_json(key, default).await
    }

    /// Write a boolean flag.
    pub async fn set_bool(&self, key: &str, value: bool) -> Result<(), StoreError> {
        self.set_json(key, &value).await
    }

    /// Read a string value, defaulting when absent or malformed.
    pub async fn get_string(&self, key: &str, default: &str) -> String {
        self.get_json(key, default.to_string()).await
    }

    /// Write a string value.
    pub async fn set_string(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.set_json(key, &value).await
    }
}
