//! Object store abstraction.

use std::path::Path;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StorageResult;

/// Overwrite-by-key object storage.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put_bytes(&self, key: &str, data: Vec<u8>, content_type: &str) -> StorageResult<()>;

    async fn put_file(&self, path: &Path, key: &str, content_type: &str) -> StorageResult<()>;

    /// Fails with `NotFound` for a missing key.
    async fn get_bytes(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Download an object to `path`, creating parent directories.
    async fn download_file(&self, key: &str, path: &Path) -> StorageResult<()> {
        let bytes = self.get_bytes(key).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool>;
}

/// Serialize `value` as JSON under `key`.
pub async fn put_json<T: Serialize + Sync>(
    store: &dyn ArtifactStore,
    key: &str,
    value: &T,
) -> StorageResult<()> {
    let data = serde_json::to_vec_pretty(value)?;
    store.put_bytes(key, data, "application/json").await
}

/// Read a JSON document; `Ok(None)` if the key does not exist.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn ArtifactStore,
    key: &str,
) -> StorageResult<Option<T>> {
    match store.get_bytes(key).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
