// In-memory store used by tests and as a fallback when no durable
// backing is configured.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::errors::StoreError;
use crate::store::DurableStore;

/// Volatile in-memory implementation of `DurableStore`.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set_raw(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
