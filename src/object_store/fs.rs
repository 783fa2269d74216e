use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;

use super::{ObjectMeta, ObjectStore, StoreError, StoreResult};

type HmacSha256 = Hmac<Sha256>;

/// Local-filesystem-backed object store. Keys become relative paths under
/// `root`; "signed URLs" are `file://` paths carrying an HMAC-signed expiry
/// query parameter, verified by the same secret at read time. This is the
/// default backend for `codepushd serve` when no object-store credentials
/// are configured.
pub struct FsObjectStore {
    root: PathBuf,
    sign_key: Vec<u8>,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, sign_key: impl Into<Vec<u8>>) -> Self {
        Self {
            root: root.into(),
            sign_key: sign_key.into(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }

    fn sign(&self, key: &str, expires_at: u64) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.sign_key).expect("HMAC accepts any key length");
        mac.update(format!("{key}|{expires_at}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify a signature produced by `sign_url`. Exposed so the HTTP
    /// adapter's local-file download endpoint can check a presented URL.
    pub fn verify(&self, key: &str, expires_at: u64, signature: &str) -> bool {
        if expires_at
            < SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        {
            return false;
        }
        self.sign(key, expires_at) == signature
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> StoreResult<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::TransientIo(e.to_string()))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| StoreError::TransientIo(e.to_string()))?;
        if !metadata.is_empty() {
            let meta_path = path.with_extension(format!(
                "{}.meta.json",
                path.extension().and_then(|e| e.to_str()).unwrap_or("")
            ));
            let json = serde_json::to_vec(&metadata).unwrap_or_default();
            let _ = tokio::fs::write(&meta_path, json).await;
        }
        debug!(key, bytes = bytes.len(), "fs object store: put");
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        let path = self.path_for(key);
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(key.to_string())
            } else {
                StoreError::TransientIo(e.to_string())
            }
        })
    }

    async fn head(&self, key: &str) -> StoreResult<Option<ObjectMeta>> {
        let path = self.path_for(key);
        match tokio::fs::metadata(&path).await {
            Ok(m) => Ok(Some(ObjectMeta {
                size: m.len(),
                metadata: HashMap::new(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::TransientIo(e.to_string())),
        }
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let base = self.path_for(prefix);
        let mut out = Vec::new();
        let mut stack = vec![base.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::TransientIo(e.to_string())),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::TransientIo(e.to_string()))?
            {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    let rel = rel.to_string_lossy().replace('\\', "/");
                    if !rel.ends_with(".meta.json") {
                        out.push(rel);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        for key in keys {
            let path = self.path_for(key);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::TransientIo(e.to_string())),
            }
        }
        Ok(())
    }

    async fn sign_url(&self, key: &str, ttl: Duration) -> StoreResult<String> {
        let expires_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            + ttl.as_secs();
        let sig = self.sign(key, expires_at);
        Ok(format!("file://{key}?expires={expires_at}&sig={sig}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> FsObjectStore {
        let dir = tempfile::tempdir().unwrap();
        FsObjectStore::new(dir.into_path(), b"test-secret".to_vec())
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let store = store();
        store
            .put("apps/a1/blob.zip", b"hello".to_vec(), HashMap::new())
            .await
            .unwrap();
        let bytes = store.get("apps/a1/blob.zip").await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn get_missing_key_is_not_found() {
        let store = store();
        let err = store.get("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn sign_url_verifies_with_matching_signature() {
        let store = store();
        let url = store
            .sign_url("apps/a1/blob.zip", Duration::from_secs(3600))
            .await
            .unwrap();
        let parsed: HashMap<_, _> = url
            .split('?')
            .nth(1)
            .unwrap()
            .split('&')
            .map(|kv| {
                let mut it = kv.splitn(2, '=');
                (it.next().unwrap(), it.next().unwrap())
            })
            .collect();
        let expires: u64 = parsed["expires"].parse().unwrap();
        assert!(store.verify("apps/a1/blob.zip", expires, parsed["sig"]));
        assert!(!store.verify("apps/a1/blob.zip", expires, "wrong-signature"));
    }

    #[tokio::test]
    async fn expired_signature_fails_verification() {
        let store = store();
        let sig = store.sign("apps/a1/blob.zip", 0);
        assert!(!store.verify("apps/a1/blob.zip", 0, &sig));
    }

    #[tokio::test]
    async fn delete_missing_key_is_not_an_error() {
        let store = store();
        store.delete(&["nope".to_string()]).await.unwrap();
    }
}
