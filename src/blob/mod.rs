//! C2 — Blob Service: content-addressed put/get/move/delete over C1, with a
//! process-local signed-URL cache. Grounded on `clawd::update::Updater`'s
//! `Arc<Mutex<Option<PendingUpdate>>>` for the shared-mutable-cache idiom.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::object_store::{ObjectStore, StoreError};

const SIGN_TTL: Duration = Duration::from_secs(3600);
const CACHE_TTL: Duration = Duration::from_secs(1800);

#[derive(Clone)]
struct CachedUrl {
    url: String,
    cached_at: Instant,
}

pub struct BlobService {
    store: Arc<dyn ObjectStore>,
    url_cache: Mutex<HashMap<String, CachedUrl>>,
}

impl BlobService {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            url_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Writes `bytes` under `key` with a `size` metadata entry and returns
    /// the key unchanged (the canonical identity of the stored blob).
    pub async fn add_blob(&self, key: &str, bytes: Vec<u8>, size: u64) -> Result<String, StoreError> {
        let mut metadata = HashMap::new();
        metadata.insert("size".to_string(), size.to_string());
        self.store
            .put(key, bytes, metadata)
            .await
            .map_err(|e| StoreError::TransientIo(e.to_string()))?;
        Ok(key.to_string())
    }

    /// Returns a short-lived signed URL for `key`, serving from the
    /// 30-minute cache when possible.
    pub async fn get_blob_url(&self, key: &str) -> Result<String, StoreError> {
        {
            let cache = self.url_cache.lock().await;
            if let Some(entry) = cache.get(key) {
                if entry.cached_at.elapsed() < CACHE_TTL {
                    return Ok(entry.url.clone());
                }
            }
        }
        let url = self
            .store
            .sign_url(key, SIGN_TTL)
            .await
            .map_err(|e| StoreError::TransientIo(e.to_string()))?;
        let mut cache = self.url_cache.lock().await;
        cache.insert(
            key.to_string(),
            CachedUrl {
                url: url.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(url)
    }

    /// Fetches the raw bytes stored under `key`.
    pub async fn get_blob(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.store.get(key).await
    }

    /// Copies bytes from `src` to `dst`, then deletes `src`. The destination
    /// write is the commit point; if it fails, nothing moved. The source
    /// delete is best-effort — a stale source key is acceptable, a partially
    /// written destination is not.
    pub async fn move_blob(&self, src: &str, dst: &str) -> Result<(), StoreError> {
        let bytes = self.store.get(src).await?;
        let size = bytes.len() as u64;
        self.add_blob(dst, bytes, size).await?;
        if let Err(e) = self.store.delete(&[src.to_string()]).await {
            tracing::warn!(src, error = %e, "move_blob: best-effort source delete failed");
        }
        self.invalidate(src).await;
        Ok(())
    }

    pub async fn remove_blob(&self, key: &str) -> Result<(), StoreError> {
        self.store.delete(&[key.to_string()]).await?;
        self.invalidate(key).await;
        Ok(())
    }

    /// Deletes every key under `prefix`, in batches of at most 1000.
    pub async fn delete_path(&self, prefix: &str) -> Result<(), StoreError> {
        let keys = self.store.list(prefix).await?;
        for chunk in keys.chunks(1000) {
            self.store.delete(chunk).await?;
        }
        let mut cache = self.url_cache.lock().await;
        cache.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }

    async fn invalidate(&self, key: &str) {
        let mut cache = self.url_cache.lock().await;
        cache.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::FsObjectStore;

    fn service() -> BlobService {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> =
            Arc::new(FsObjectStore::new(dir.into_path(), b"secret".to_vec()));
        BlobService::new(store)
    }

    #[tokio::test]
    async fn add_then_get_url_caches() {
        let svc = service();
        svc.add_blob("apps/a1/p.zip", b"data".to_vec(), 4)
            .await
            .unwrap();
        let url1 = svc.get_blob_url("apps/a1/p.zip").await.unwrap();
        let url2 = svc.get_blob_url("apps/a1/p.zip").await.unwrap();
        assert_eq!(url1, url2);
    }

    #[tokio::test]
    async fn move_blob_deletes_source() {
        let svc = service();
        svc.add_blob("src.zip", b"data".to_vec(), 4).await.unwrap();
        svc.move_blob("src.zip", "dst.zip").await.unwrap();
        assert!(svc.store.get("src.zip").await.is_err());
        assert_eq!(svc.store.get("dst.zip").await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn delete_path_removes_prefix() {
        let svc = service();
        svc.add_blob("apps/a1/one.zip", b"1".to_vec(), 1).await.unwrap();
        svc.add_blob("apps/a1/two.zip", b"2".to_vec(), 1).await.unwrap();
        svc.add_blob("apps/a2/three.zip", b"3".to_vec(), 1).await.unwrap();
        svc.delete_path("apps/a1").await.unwrap();
        assert!(svc.store.get("apps/a1/one.zip").await.is_err());
        assert!(svc.store.get("apps/a1/two.zip").await.is_err());
        assert_eq!(svc.store.get("apps/a2/three.zip").await.unwrap(), b"3");
    }
}
