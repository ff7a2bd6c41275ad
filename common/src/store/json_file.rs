// File-backed durable store: one JSON document holding every key.
// Writes go through a temp file + rename so a crash mid-write never
// truncates the document.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::errors::StoreError;
use crate::store::DurableStore;

/// Durable store persisting all keys in a single JSON file.
pub struct JsonFileStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, String>>,
}

impl JsonFileStore {
    /// Open (or create) the store at `path`. An unreadable or corrupt
    /// document starts the store empty rather than failing: the process
    /// must come up even after a bad shutdown.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<HashMap<String, String>>(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, "Corrupt store document, starting empty");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!(keys = entries.len(), "Durable store opened");

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Serialize the whole document and swap it in atomically.
    async fn flush(&self, entries: &HashMap<String, String>) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(entries).map_err(|e| StoreError::Serialization {
            key: "<document>".to_string(),
            reason: e.to_string(),
        })?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl DurableStore for JsonFileStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set_raw(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), value);
        self.flush(&entries).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        if entries.remove(key).is_some() {
            self.flush(&entries).await?;
        }
        Ok(())
    }
}
