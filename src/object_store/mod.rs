//! C1 — Object Store: bytes in, bytes out, presigned URLs. The contract
//! every backend implements; `fs` and `s3` are the two concrete variants.

pub mod fs;
pub mod s3;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

pub use fs::FsObjectStore;
pub use s3::S3ObjectStore;

#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub size: u64,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("transient I/O error: {0}")]
    TransientIo(String),
    #[error("fatal object store error: {0}")]
    Fatal(String),
}

impl From<StoreError> for crate::error::ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(key) => crate::error::ApiError::NotFound(key),
            StoreError::TransientIo(msg) | StoreError::Fatal(msg) => {
                crate::error::ApiError::ConnectionFailed(msg)
            }
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The object store contract consumed by the Blob Service (C2). Two
/// implementations exist; callers never depend on which one is active.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Vec<u8>>;

    async fn head(&self, key: &str) -> StoreResult<Option<ObjectMeta>>;

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Delete one or more keys. Missing keys are not an error.
    async fn delete(&self, keys: &[String]) -> StoreResult<()>;

    async fn sign_url(&self, key: &str, ttl: Duration) -> StoreResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_maps_to_api_error() {
        let not_found: crate::error::ApiError = StoreError::NotFound("k".into()).into();
        assert_eq!(not_found.status(), axum::http::StatusCode::NOT_FOUND);

        let transient: crate::error::ApiError = StoreError::TransientIo("timeout".into()).into();
        assert_eq!(transient.status(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }
}
