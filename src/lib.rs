pub mod access;
pub mod blob;
pub mod config;
pub mod error;
pub mod manifest;
pub mod metrics;
pub mod object_store;
pub mod release;
pub mod resolver;
pub mod rest;
pub mod storage;
pub mod util;

use std::sync::Arc;

use access::AccessControl;
use blob::BlobService;
use config::ServerConfig;
use metrics::MetricsCounter;
use object_store::ObjectStore;
use release::ReleaseEngine;
use resolver::UpdateResolver;
use storage::Storage;

/// Shared application state passed to every HTTP handler. One instance per
/// process, wrapped in `Arc` the way `clawd::AppContext` is.
pub struct AppContext {
    pub config: ServerConfig,
    pub storage: Storage,
    pub blobs: Arc<BlobService>,
    pub release: ReleaseEngine,
    pub resolver: UpdateResolver,
    pub metrics: MetricsCounter,
    pub access: AccessControl,
    pub started_at: std::time::Instant,
}

impl AppContext {
    /// Wires C1-C9 together from a loaded config and an already-migrated
    /// store, the way `clawd`'s `run_server` assembles its daemon pieces in
    /// sequence before constructing one `AppContext`.
    pub fn new(config: ServerConfig, storage: Storage, object_store: Arc<dyn ObjectStore>) -> Self {
        let blobs = Arc::new(BlobService::new(object_store));
        let release = ReleaseEngine::new(storage.clone(), blobs.clone());
        let resolver = UpdateResolver::new(storage.clone(), blobs.clone());
        let metrics = MetricsCounter::new(storage.clone());
        let access = AccessControl::new(storage.clone());

        Self {
            config,
            storage,
            blobs,
            release,
            resolver,
            metrics,
            access,
            started_at: std::time::Instant::now(),
        }
    }
}
