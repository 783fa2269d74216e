//! C6 — Update Resolver: the backward history scan that decides, for one
//! client query, whether an update exists and which release to serve. No
//! teacher module does update resolution; the fold-over-history shape is
//! grounded on `clawd::account::AccountRegistry::pick_account`'s
//! filter-then-select-by-priority idiom, and version comparison reuses
//! `clawd::update::Updater::check`'s `semver::Version::parse` usage.

use std::sync::Arc;

use crate::blob::BlobService;
use crate::error::{ApiError, ApiResult};
use crate::storage::{PackageRow, Storage};
use crate::util;

pub struct UpdateResolver {
    storage: Storage,
    blobs: Arc<BlobService>,
}

/// One client `/updateCheck` query (spec.md §4.6).
#[derive(Debug, Clone, Default)]
pub struct UpdateQuery {
    pub deployment_key: String,
    pub app_version: String,
    pub package_hash: Option<String>,
    pub label: Option<String>,
    pub client_unique_id: Option<String>,
    pub is_companion: bool,
}

/// The resolver's output (spec.md §4.6's `updateInfo`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateInfo {
    pub is_available: bool,
    pub is_mandatory: bool,
    pub app_version: String,
    pub package_hash: Option<String>,
    pub label: Option<String>,
    pub package_size: Option<i64>,
    pub description: Option<String>,
    pub download_url: Option<String>,
    pub should_run_binary_version: Option<bool>,
    pub update_app_version: Option<bool>,
}

impl UpdateInfo {
    fn no_update(app_version: &str) -> Self {
        UpdateInfo {
            is_available: false,
            should_run_binary_version: Some(true),
            app_version: app_version.to_string(),
            ..Default::default()
        }
    }
}

/// Accumulator for the backward scan over step 4's history walk.
struct ScanState<'a> {
    found_request: bool,
    latest_enabled: Option<&'a PackageRow>,
    latest_satisfying: Option<&'a PackageRow>,
    mandatory_promotion: bool,
}

impl UpdateResolver {
    pub fn new(storage: Storage, blobs: Arc<BlobService>) -> Self {
        Self { storage, blobs }
    }

    /// Whether `entry` is what the client says it is currently running.
    /// Clients presenting neither `label` nor `packageHash` are in an
    /// "unknown" state and are matched against the newest entry, treating it
    /// as their baseline (spec.md §4.6 step 4).
    fn matches_client_state(entry: &PackageRow, query: &UpdateQuery, is_newest: bool) -> bool {
        if query.label.is_none() && query.package_hash.is_none() {
            return is_newest;
        }
        if let Some(label) = &query.label {
            return &entry.label == label;
        }
        if let Some(hash) = &query.package_hash {
            return &entry.package_hash == hash;
        }
        false
    }

    /// Resolves one client query. An unknown deployment key is a real 404;
    /// any other failure while computing the answer (storage hiccup,
    /// object-store outage) degrades to a safe "no update available"
    /// response instead of propagating, per spec.md §7 — callers on both
    /// transports inherit this without re-implementing the distinction.
    pub async fn resolve(&self, query: &UpdateQuery) -> ApiResult<UpdateInfo> {
        let deployment = self
            .storage
            .get_deployment_by_key(&query.deployment_key)
            .await?
            .ok_or_else(|| ApiError::NotFound("unknown deployment key".into()))?;

        match self.resolve_within_deployment(&deployment.id, query).await {
            Ok(info) => Ok(info),
            Err(e) => {
                tracing::warn!(error = %e, "update resolution failed, degrading to no-update response");
                Ok(UpdateInfo::no_update(&query.app_version))
            }
        }
    }

    async fn resolve_within_deployment(&self, deployment_id: &str, query: &UpdateQuery) -> ApiResult<UpdateInfo> {
        let history = self.storage.list_package_history(deployment_id).await?;
        if history.is_empty() {
            return Ok(UpdateInfo::no_update(&query.app_version));
        }

        let normalized_version = util::normalize_version(&query.app_version);
        let candidate = util::parse_semver(&normalized_version);
        let is_prerelease = util::is_prerelease_string(&normalized_version);

        let mut state = ScanState {
            found_request: false,
            latest_enabled: None,
            latest_satisfying: None,
            mandatory_promotion: false,
        };
        let newest_id = history.last().map(|p| p.id.clone());

        for entry in history.iter().rev() {
            let is_newest = newest_id.as_deref() == Some(entry.id.as_str());
            let found_request_before = state.found_request;
            let is_client_current = Self::matches_client_state(entry, query, is_newest);
            if !state.found_request && is_client_current {
                state.found_request = true;
            }

            let entry_satisfies_client_version = candidate
                .as_ref()
                .map(|v| util::satisfies_range(v, &entry.app_version))
                .unwrap_or(false);

            if !entry.is_disabled {
                if state.latest_enabled.is_none() {
                    state.latest_enabled = Some(entry);
                }
                if state.latest_satisfying.is_none() {
                    let satisfies = query.is_companion || entry_satisfies_client_version || is_prerelease;
                    if satisfies {
                        state.latest_satisfying = Some(entry);
                    }
                }
            }

            // Excludes entries already scanned past the client's own current
            // release, and excludes that release itself — a mandatory entry
            // only promotes the response if it lies strictly between the
            // client's current version and the newest one being served.
            let hits_mandatory_boundary = !entry.is_disabled
                && entry.is_mandatory
                && entry_satisfies_client_version
                && !found_request_before
                && !is_client_current;
            if hits_mandatory_boundary {
                state.mandatory_promotion = true;
            }

            let window_complete = state.found_request
                && state.latest_enabled.is_some()
                && state.latest_satisfying.is_some();
            if window_complete || hits_mandatory_boundary {
                break;
            }
        }

        let latest_enabled = match state.latest_enabled {
            Some(p) => p,
            None => return Ok(UpdateInfo::no_update(&query.app_version)),
        };
        let latest_satisfying = match state.latest_satisfying {
            Some(p) => p,
            None => return Ok(UpdateInfo::no_update(&query.app_version)),
        };

        if let Some(client_hash) = &query.package_hash {
            if &latest_satisfying.package_hash == client_hash {
                let mut info = UpdateInfo {
                    is_available: false,
                    app_version: query.app_version.clone(),
                    ..Default::default()
                };
                let satisfies_latest_enabled = candidate
                    .as_ref()
                    .map(|v| util::satisfies_range(v, &latest_enabled.app_version))
                    .unwrap_or(false);
                let strictly_newer = candidate
                    .as_ref()
                    .and_then(|v| util::parse_semver(&latest_enabled.app_version).map(|e| (v.clone(), e)))
                    .map(|(v, e)| v > e)
                    .unwrap_or(false);
                if strictly_newer {
                    info.app_version = latest_enabled.app_version.clone();
                } else if !satisfies_latest_enabled {
                    info.update_app_version = Some(true);
                    info.app_version = latest_enabled.app_version.clone();
                }
                return Ok(info);
            }
        }

        let (mut download_url_key, mut package_size) =
            (latest_satisfying.blob_path.clone(), latest_satisfying.size);
        if let Some(client_hash) = &query.package_hash {
            let diffs = self.storage.list_package_diffs(&latest_satisfying.id).await?;
            if let Some(d) = diffs.iter().find(|d| &d.source_package_hash == client_hash) {
                download_url_key = d.blob_path.clone();
                package_size = d.size;
            }
        }

        if let Some(rollout) = latest_satisfying.rollout {
            if rollout < 100 {
                match &query.client_unique_id {
                    None => return Ok(UpdateInfo::no_update(&query.app_version)),
                    Some(client_id) => {
                        if !util::is_in_rollout(client_id, &latest_satisfying.package_hash, rollout as u8) {
                            return Ok(UpdateInfo::no_update(&query.app_version));
                        }
                    }
                }
            }
        }

        let download_url = self
            .blobs
            .get_blob_url(&download_url_key)
            .await
            .map_err(|e| ApiError::ConnectionFailed(e.to_string()))?;

        Ok(UpdateInfo {
            is_available: true,
            is_mandatory: state.mandatory_promotion || latest_satisfying.is_mandatory,
            app_version: query.app_version.clone(),
            package_hash: Some(latest_satisfying.package_hash.clone()),
            label: Some(latest_satisfying.label.clone()),
            package_size: Some(package_size),
            description: latest_satisfying.description.clone(),
            download_url: Some(download_url),
            should_run_binary_version: None,
            update_app_version: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::FsObjectStore;
    use crate::release::{ReleaseEngine, ReleaseInfo};

    async fn setup() -> (UpdateResolver, ReleaseEngine, String) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(&dir.path().join("data")).await.unwrap();
        let store: Arc<dyn crate::object_store::ObjectStore> =
            Arc::new(FsObjectStore::new(dir.path().join("blobs"), b"secret".to_vec()));
        std::mem::forget(dir);
        let blobs = Arc::new(BlobService::new(store));

        let account = storage.create_account("a@example.com", "A").await.unwrap();
        let app = storage.add_app(&account.id, "MyApp").await.unwrap();
        let deployment = storage
            .add_deployment(&app.id, "Production", "dk_test")
            .await
            .unwrap();

        let resolver = UpdateResolver::new(storage.clone(), blobs.clone());
        let engine = ReleaseEngine::new(storage, blobs);
        (resolver, engine, deployment.key)
    }

    fn zip(contents: &[u8]) -> Vec<u8> {
        use std::io::{Cursor, Write};
        use zip::write::SimpleFileOptions;
        let mut buf = Vec::new();
        let mut writer = zip::ZipWriter::new(Cursor::new(&mut buf));
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        writer.start_file("index.js", options).unwrap();
        writer.write_all(contents).unwrap();
        writer.finish().unwrap();
        drop(writer);
        buf
    }

    #[tokio::test]
    async fn no_history_reports_no_update() {
        let (resolver, _engine, key) = setup().await;
        let info = resolver
            .resolve(&UpdateQuery {
                deployment_key: key,
                app_version: "1.0.0".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!info.is_available);
        assert_eq!(info.should_run_binary_version, Some(true));
    }

    #[tokio::test]
    async fn unknown_deployment_key_is_not_found() {
        let (resolver, _engine, _key) = setup().await;
        let err = resolver
            .resolve(&UpdateQuery {
                deployment_key: "dk_nonexistent".into(),
                app_version: "1.0.0".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn happy_path_update_available() {
        let (resolver, engine, key) = setup().await;
        let package = engine
            .commit_package(
                &engine_deployment_id(&resolver, &key).await,
                zip(b"v1 contents"),
                ReleaseInfo {
                    app_version: "1.0.0".into(),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();

        let info = resolver
            .resolve(&UpdateQuery {
                deployment_key: key,
                app_version: "1.0.0".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(info.is_available);
        assert_eq!(info.package_hash, Some(package.package_hash));
        assert_eq!(info.label, Some("v1".into()));
    }

    #[tokio::test]
    async fn client_already_current_reports_no_update() {
        let (resolver, engine, key) = setup().await;
        let deployment_id = engine_deployment_id(&resolver, &key).await;
        let package = engine
            .commit_package(
                &deployment_id,
                zip(b"v1 contents"),
                ReleaseInfo {
                    app_version: "1.0.0".into(),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();

        let info = resolver
            .resolve(&UpdateQuery {
                deployment_key: key,
                app_version: "1.0.0".into(),
                package_hash: Some(package.package_hash),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!info.is_available);
    }

    #[tokio::test]
    async fn partial_rollout_excludes_client_without_unique_id() {
        let (resolver, engine, key) = setup().await;
        let deployment_id = engine_deployment_id(&resolver, &key).await;
        engine
            .commit_package(
                &deployment_id,
                zip(b"v1 contents"),
                ReleaseInfo {
                    app_version: "1.0.0".into(),
                    rollout: Some(50),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();

        let info = resolver
            .resolve(&UpdateQuery {
                deployment_key: key,
                app_version: "1.0.0".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!info.is_available);
    }

    async fn engine_deployment_id(resolver: &UpdateResolver, key: &str) -> String {
        resolver
            .storage
            .get_deployment_by_key(key)
            .await
            .unwrap()
            .unwrap()
            .id
    }
}
