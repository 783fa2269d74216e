use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use sha2::Sha256;
use tracing::debug;

use super::{ObjectMeta, ObjectStore, StoreError, StoreResult};

type HmacSha256 = Hmac<Sha256>;

/// Speaks the S3-compatible HTTP API directly: `PUT`/`GET`/`HEAD`/`DELETE`
/// against `{endpoint}/{bucket}/{key}`. Download URLs are signed with a
/// simplified HMAC-SHA256 query-string scheme (`HMAC(secret, "key|expiry")`),
/// not full AWS SigV4 — adequate for an operator-controlled S3-compatible
/// backend, not for AWS itself.
pub struct S3ObjectStore {
    endpoint: String,
    bucket: String,
    access_key: String,
    secret_key: String,
    client: Client,
}

impl S3ObjectStore {
    pub fn new(endpoint: impl Into<String>, bucket: impl Into<String>, access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builds with default TLS backend"),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint.trim_end_matches('/'), self.bucket, key)
    }

    fn sign(&self, key: &str, expires_at: u64) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(format!("{key}|{expires_at}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> StoreResult<()> {
        let mut req = self
            .client
            .put(self.object_url(key))
            .basic_auth(&self.access_key, Some(&self.secret_key))
            .body(bytes);
        for (k, v) in &metadata {
            req = req.header(format!("x-amz-meta-{k}"), v);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| StoreError::TransientIo(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(StoreError::Fatal(format!(
                "PUT {key} failed: {}",
                resp.status()
            )));
        }
        debug!(key, "s3 object store: put");
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        let resp = self
            .client
            .get(self.object_url(key))
            .basic_auth(&self.access_key, Some(&self.secret_key))
            .send()
            .await
            .map_err(|e| StoreError::TransientIo(e.to_string()))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(key.to_string())),
            s if s.is_success() => resp
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| StoreError::TransientIo(e.to_string())),
            s => Err(StoreError::Fatal(format!("GET {key} failed: {s}"))),
        }
    }

    async fn head(&self, key: &str) -> StoreResult<Option<ObjectMeta>> {
        let resp = self
            .client
            .head(self.object_url(key))
            .basic_auth(&self.access_key, Some(&self.secret_key))
            .send()
            .await
            .map_err(|e| StoreError::TransientIo(e.to_string()))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let size = resp
                    .content_length()
                    .unwrap_or(0);
                Ok(Some(ObjectMeta {
                    size,
                    metadata: HashMap::new(),
                }))
            }
            s => Err(StoreError::Fatal(format!("HEAD {key} failed: {s}"))),
        }
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        #[derive(serde::Deserialize)]
        struct ListResponse {
            #[serde(default)]
            keys: Vec<String>,
        }
        let resp = self
            .client
            .get(format!(
                "{}/{}?prefix={}",
                self.endpoint.trim_end_matches('/'),
                self.bucket,
                urlencoding_prefix(prefix)
            ))
            .basic_auth(&self.access_key, Some(&self.secret_key))
            .send()
            .await
            .map_err(|e| StoreError::TransientIo(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(StoreError::Fatal(format!("LIST {prefix} failed: {}", resp.status())));
        }
        let parsed: ListResponse = resp
            .json()
            .await
            .map_err(|e| StoreError::Fatal(e.to_string()))?;
        Ok(parsed.keys)
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        // Batches of <=1000 per the blob service's deletePath contract.
        for chunk in keys.chunks(1000) {
            for key in chunk {
                let resp = self
                    .client
                    .delete(self.object_url(key))
                    .basic_auth(&self.access_key, Some(&self.secret_key))
                    .send()
                    .await
                    .map_err(|e| StoreError::TransientIo(e.to_string()))?;
                if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
                    return Err(StoreError::Fatal(format!(
                        "DELETE {key} failed: {}",
                        resp.status()
                    )));
                }
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
        Ok(format!(
            "{}?expires={expires_at}&access_key={}&sig={sig}",
            self.object_url(key),
            self.access_key
        ))
    }
}

fn urlencoding_prefix(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~' | '/') {
                c.to_string()
            } else {
                format!("%{:02X}", c as u32)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_deterministic_for_same_expiry() {
        let store = S3ObjectStore::new("http://localhost:9000", "bucket", "ak", "sk");
        let a = store.sign("apps/a1/p.zip", 1000);
        let b = store.sign("apps/a1/p.zip", 1000);
        assert_eq!(a, b);
    }

    #[test]
    fn sign_differs_by_key_and_expiry() {
        let store = S3ObjectStore::new("http://localhost:9000", "bucket", "ak", "sk");
        assert_ne!(store.sign("a", 1000), store.sign("b", 1000));
        assert_ne!(store.sign("a", 1000), store.sign("a", 2000));
    }
}
