//! C5 — Release Engine: commit / promote / rollback / patch a deployment's
//! package history, enforcing P1-P4. Orchestrates C2 (blobs), C3 (manifest
//! and diffing) and C4 (storage) inside one `sqlx::Transaction` per
//! operation, grounded on `clawd::storage::Storage::create_message_and_increment_count`'s
//! begin/insert/insert/commit shape — the same transactional envelope, just
//! wrapping blob writes instead of a second row insert.

use std::sync::Arc;

use crate::blob::BlobService;
use crate::error::{ApiError, ApiResult};
use crate::manifest::{self, PackageManifest};
use crate::storage::{PackageRow, ReleaseMethod, Storage};
use crate::util;

/// Diff generation looks back at most this many prior releases (§4.3).
const MAX_DIFF_SOURCES: usize = 5;

pub struct ReleaseEngine {
    storage: Storage,
    blobs: Arc<BlobService>,
}

/// Caller-supplied metadata for a new upload; mirrors the fields of
/// `commitPackage(..., info)` in spec.md §4.5.
#[derive(Debug, Clone, Default)]
pub struct ReleaseInfo {
    pub app_version: String,
    pub description: Option<String>,
    pub is_disabled: bool,
    pub is_mandatory: bool,
    pub rollout: Option<i64>,
}

/// Fields `promote`/`updateRelease` may override; `None` means "inherit".
#[derive(Debug, Clone, Default)]
pub struct ReleaseOverrides {
    pub app_version: Option<String>,
    pub description: Option<String>,
    pub is_disabled: Option<bool>,
    pub is_mandatory: Option<bool>,
    pub rollout: Option<Option<i64>>,
}

impl ReleaseEngine {
    pub fn new(storage: Storage, blobs: Arc<BlobService>) -> Self {
        Self { storage, blobs }
    }

    /// P3: at most one live release may have a partial rollout at a time,
    /// unless that release is disabled.
    fn check_rollout_conflict(latest: &PackageRow) -> ApiResult<()> {
        if let Some(rollout) = latest.rollout {
            if rollout > 0 && rollout < 100 && !latest.is_disabled {
                return Err(ApiError::Conflict(
                    "deployment has an unfinished rollout; disable it or wait for completion".into(),
                ));
            }
        }
        Ok(())
    }

    fn next_label(count: i64) -> String {
        format!("v{}", count + 1)
    }

    /// Upload a new bundle. `bytes` is the raw ZIP; diffs are generated
    /// against up to the last five releases with a matching `appVersion`.
    pub async fn commit_package(
        &self,
        deployment_id: &str,
        bytes: Vec<u8>,
        info: ReleaseInfo,
        released_by: Option<&str>,
    ) -> ApiResult<PackageRow> {
        let manifest = manifest::generate_manifest(&bytes);
        let package_hash = manifest::package_hash(&manifest);
        let bytes_for_diff = bytes.clone();

        let mut tx = self.storage.begin().await?;

        // Read the history, run P2/P3, and compute the label all against the
        // open transaction so a concurrent commit on the same deployment
        // can't read the same "latest" row before either side writes; the
        // `(deployment_id, label)` unique index is the backstop if SQLite's
        // locking still lets two BEGINs interleave.
        let history = Storage::list_package_history_with(&mut *tx, deployment_id).await?;
        if let Some(latest) = history.last() {
            Self::check_rollout_conflict(latest)?;
            if latest.package_hash == package_hash {
                return Err(ApiError::AlreadyExists(
                    "this package is identical to the current release".into(),
                ));
            }
        }

        let label = Self::next_label(history.len() as i64);
        let id_hint = util::generate_key("");
        let size = bytes.len() as i64;
        let blob_path = format!("apps/{deployment_id}/{id_hint}.zip");
        self.blobs
            .add_blob(&blob_path, bytes, size as u64)
            .await
            .map_err(|e| ApiError::ConnectionFailed(e.to_string()))?;

        let manifest_blob_path = if manifest.len() > 1 || !manifest.contains_key("/") {
            let path = format!("apps/{deployment_id}/{id_hint}-manifest.json");
            let json = serde_json::to_vec(&manifest).unwrap_or_default();
            let manifest_size = json.len() as u64;
            self.blobs
                .add_blob(&path, json, manifest_size)
                .await
                .map_err(|e| ApiError::ConnectionFailed(e.to_string()))?;
            Some(path)
        } else {
            None
        };

        let package = Storage::insert_package(
            &mut *tx,
            deployment_id,
            &label,
            &info.app_version,
            info.description.as_deref(),
            info.is_disabled,
            info.is_mandatory,
            info.rollout,
            size,
            &package_hash,
            &blob_path,
            manifest_blob_path.as_deref(),
            ReleaseMethod::Upload,
            None,
            None,
            released_by,
        )
        .await?;

        tx.commit().await?;

        self.generate_diffs(&history, &package, &manifest, &bytes_for_diff)
            .await;
        Ok(package)
    }

    /// Builds diff archives against up to `MAX_DIFF_SOURCES` prior releases
    /// whose `appVersion` matches the new release's, skipping priors with no
    /// stored manifest. Runs after the commit transaction: diffs are an
    /// optimization, not part of P1-P4, so a failure here never rolls back
    /// the committed package — errors are logged and swallowed.
    async fn generate_diffs(
        &self,
        history: &[PackageRow],
        new_package: &PackageRow,
        new_manifest: &PackageManifest,
        new_zip_bytes: &[u8],
    ) {
        let candidates: Vec<&PackageRow> = history
            .iter()
            .rev()
            .filter(|p| util::versions_equivalent(&p.app_version, &new_package.app_version))
            .filter(|p| p.manifest_blob_path.is_some())
            .take(MAX_DIFF_SOURCES)
            .collect();

        for prior in candidates {
            if let Err(e) = self
                .generate_one_diff(prior, new_package, new_manifest, new_zip_bytes)
                .await
            {
                tracing::warn!(
                    source_label = %prior.label,
                    new_label = %new_package.label,
                    error = %e,
                    "diff generation failed; clients will fall back to the full package"
                );
            }
        }
    }

    async fn generate_one_diff(
        &self,
        prior: &PackageRow,
        new_package: &PackageRow,
        new_manifest: &PackageManifest,
        new_zip_bytes: &[u8],
    ) -> ApiResult<()> {
        let manifest_path = prior.manifest_blob_path.as_ref().unwrap();
        let old_manifest_json = self
            .blobs
            .get_blob(manifest_path)
            .await
            .map_err(|e| ApiError::ConnectionFailed(e.to_string()))?;
        let old_manifest: PackageManifest = serde_json::from_slice(&old_manifest_json)
            .map_err(|e| ApiError::Internal(format!("corrupt manifest blob: {e}")))?;

        let delta = manifest::diff(&old_manifest, new_manifest);
        let archive = manifest::build_diff_archive(new_zip_bytes, &delta)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let size = archive.len() as u64;

        let diff_path = format!(
            "apps/{}/diffs/{}-from-{}.zip",
            new_package.deployment_id, new_package.label, prior.package_hash
        );
        self.blobs
            .add_blob(&diff_path, archive, size)
            .await
            .map_err(|e| ApiError::ConnectionFailed(e.to_string()))?;

        Storage::insert_package_diff(
            &self.storage.pool(),
            &new_package.id,
            &prior.package_hash,
            size as i64,
            &diff_path,
        )
        .await
    }

    /// Copies a release from `src_deployment` into `dst_deployment` without
    /// moving bytes (P4): the new row shares `blobPath`/`manifestBlobPath`/
    /// `packageHash`/`size` with the source.
    pub async fn promote(
        &self,
        src_deployment_id: &str,
        dst_deployment_id: &str,
        overrides: ReleaseOverrides,
        released_by: Option<&str>,
    ) -> ApiResult<PackageRow> {
        let src = self
            .storage
            .get_latest_package(src_deployment_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("source deployment has no release to promote".into()))?;

        let mut tx = self.storage.begin().await?;

        // Same reasoning as `commit_package`: read the destination's history
        // through the open transaction so the P3 check and label computation
        // can't race a concurrent write to the same deployment.
        let dst_history = Storage::list_package_history_with(&mut *tx, dst_deployment_id).await?;
        if let Some(latest) = dst_history.last() {
            Self::check_rollout_conflict(latest)?;
        }

        let src_deployment = self
            .storage
            .get_deployment(src_deployment_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("source deployment".into()))?;

        let label = Self::next_label(dst_history.len() as i64);
        let package = Storage::insert_package(
            &mut *tx,
            dst_deployment_id,
            &label,
            overrides.app_version.as_deref().unwrap_or(&src.app_version),
            overrides.description.as_deref().or(src.description.as_deref()),
            overrides.is_disabled.unwrap_or(src.is_disabled),
            overrides.is_mandatory.unwrap_or(src.is_mandatory),
            overrides.rollout.unwrap_or(src.rollout),
            src.size,
            &src.package_hash,
            &src.blob_path,
            src.manifest_blob_path.as_deref(),
            ReleaseMethod::Promote,
            Some(&src.label),
            Some(&src_deployment.name),
            released_by,
        )
        .await?;

        tx.commit().await?;
        Ok(package)
    }

    /// Rolls a deployment back to an earlier release within the same binary
    /// version. Never moves bytes: the new row copies `blobPath` etc. from
    /// `target`.
    pub async fn rollback(
        &self,
        deployment_id: &str,
        target_label: Option<&str>,
        released_by: Option<&str>,
    ) -> ApiResult<PackageRow> {
        let mut tx = self.storage.begin().await?;

        let history = Storage::list_package_history_with(&mut *tx, deployment_id).await?;
        if history.len() < 2 {
            return Err(ApiError::Conflict("no prior release to roll back to".into()));
        }
        let current = history.last().unwrap();

        let target = match target_label {
            None => &history[history.len() - 2],
            Some(label) => history
                .iter()
                .find(|p| p.label == label)
                .ok_or_else(|| ApiError::NotFound(format!("release '{label}' not found")))?,
        };
        if target.id == current.id {
            return Err(ApiError::Conflict("cannot roll back to the current release".into()));
        }
        if target.app_version != current.app_version {
            return Err(ApiError::Conflict(
                "cannot rollback across binary versions".into(),
            ));
        }

        let label = Self::next_label(history.len() as i64);
        let package = Storage::insert_package(
            &mut *tx,
            deployment_id,
            &label,
            &target.app_version,
            target.description.as_deref(),
            target.is_disabled,
            target.is_mandatory,
            target.rollout,
            target.size,
            &target.package_hash,
            &target.blob_path,
            target.manifest_blob_path.as_deref(),
            ReleaseMethod::Rollback,
            Some(&target.label),
            None,
            released_by,
        )
        .await?;
        tx.commit().await?;
        Ok(package)
    }

    /// Patches `appVersion`/`description`/`isDisabled`/`isMandatory`/
    /// `rollout` on a named (or, if omitted, latest) release. Never writes a
    /// new Package row or blob.
    pub async fn update_release(
        &self,
        deployment_id: &str,
        label: Option<&str>,
        patch: ReleaseOverrides,
    ) -> ApiResult<()> {
        let target = match label {
            Some(label) => self
                .storage
                .get_package_by_label(deployment_id, label)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("release '{label}' not found")))?,
            None => self
                .storage
                .get_latest_package(deployment_id)
                .await?
                .ok_or_else(|| ApiError::NotFound("deployment has no release".into()))?,
        };

        // P3 is re-checked here, not just at commit time: a patch can turn a
        // fully-rolled-out release back into a partial one.
        let effective_rollout = patch.rollout.unwrap_or(target.rollout);
        let effective_disabled = patch.is_disabled.unwrap_or(target.is_disabled);
        if let Some(rollout) = effective_rollout {
            if rollout > 0 && rollout < 100 && !effective_disabled {
                let history = self.storage.list_package_history(deployment_id).await?;
                let conflicts = history.iter().any(|p| {
                    p.id != target.id
                        && !p.is_disabled
                        && matches!(p.rollout, Some(r) if r > 0 && r < 100)
                });
                if conflicts {
                    return Err(ApiError::Conflict(
                        "deployment has an unfinished rollout; disable it or wait for completion".into(),
                    ));
                }
            }
        }

        self.storage
            .update_package(
                &target.id,
                patch.app_version.as_deref(),
                patch.description.as_deref(),
                patch.is_disabled,
                patch.is_mandatory,
                patch.rollout,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::FsObjectStore;
    use std::sync::Arc as StdArc;

    async fn engine() -> (ReleaseEngine, String, String) {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let storage = Storage::new(&data_dir).await.unwrap();
        let blob_dir = dir.path().join("blobs");
        let store: StdArc<dyn crate::object_store::ObjectStore> =
            StdArc::new(FsObjectStore::new(blob_dir, b"secret".to_vec()));
        let blobs = Arc::new(BlobService::new(store));
        std::mem::forget(dir);

        let account = storage.create_account("a@example.com", "A").await.unwrap();
        let app = storage.add_app(&account.id, "MyApp").await.unwrap();
        let deployment = storage
            .add_deployment(&app.id, "Production", "dk_test")
            .await
            .unwrap();

        (ReleaseEngine::new(storage, blobs), deployment.id, account.id)
    }

    fn zip_with(contents: &[u8]) -> Vec<u8> {
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
    async fn commit_package_assigns_sequential_labels() {
        let (engine, deployment_id, account_id) = engine().await;
        let p1 = engine
            .commit_package(
                &deployment_id,
                zip_with(b"v1"),
                ReleaseInfo {
                    app_version: "1.0.0".into(),
                    ..Default::default()
                },
                Some(&account_id),
            )
            .await
            .unwrap();
        assert_eq!(p1.label, "v1");

        let p2 = engine
            .commit_package(
                &deployment_id,
                zip_with(b"v2"),
                ReleaseInfo {
                    app_version: "1.0.0".into(),
                    ..Default::default()
                },
                Some(&account_id),
            )
            .await
            .unwrap();
        assert_eq!(p2.label, "v2");
    }

    #[tokio::test]
    async fn commit_package_rejects_duplicate_hash() {
        let (engine, deployment_id, account_id) = engine().await;
        engine
            .commit_package(
                &deployment_id,
                zip_with(b"same"),
                ReleaseInfo {
                    app_version: "1.0.0".into(),
                    ..Default::default()
                },
                Some(&account_id),
            )
            .await
            .unwrap();
        let err = engine
            .commit_package(
                &deployment_id,
                zip_with(b"same"),
                ReleaseInfo {
                    app_version: "1.0.0".into(),
                    ..Default::default()
                },
                Some(&account_id),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn commit_package_rejects_while_rollout_unfinished() {
        let (engine, deployment_id, account_id) = engine().await;
        engine
            .commit_package(
                &deployment_id,
                zip_with(b"v1"),
                ReleaseInfo {
                    app_version: "1.0.0".into(),
                    rollout: Some(50),
                    ..Default::default()
                },
                Some(&account_id),
            )
            .await
            .unwrap();
        let err = engine
            .commit_package(
                &deployment_id,
                zip_with(b"v2"),
                ReleaseInfo {
                    app_version: "1.0.0".into(),
                    ..Default::default()
                },
                Some(&account_id),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn promote_copies_blob_fields_without_new_upload() {
        let (engine, deployment_id, account_id) = engine().await;
        // Build a second, independent deployment under the same app for the promote source.
        let production = engine.storage.get_deployment(&deployment_id).await.unwrap().unwrap();
        let staging_deployment = engine
            .storage
            .add_deployment(&production.app_id, "Staging", "dk_staging")
            .await
            .unwrap();

        let src = engine
            .commit_package(
                &staging_deployment.id,
                zip_with(b"promoted"),
                ReleaseInfo {
                    app_version: "1.0.0".into(),
                    ..Default::default()
                },
                Some(&account_id),
            )
            .await
            .unwrap();

        let promoted = engine
            .promote(&staging_deployment.id, &deployment_id, ReleaseOverrides::default(), Some(&account_id))
            .await
            .unwrap();
        assert_eq!(promoted.package_hash, src.package_hash);
        assert_eq!(promoted.blob_path, src.blob_path);
        assert_eq!(promoted.original_label.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn rollback_rejects_cross_binary_version() {
        let (engine, deployment_id, account_id) = engine().await;
        engine
            .commit_package(
                &deployment_id,
                zip_with(b"v1"),
                ReleaseInfo {
                    app_version: "1.0.0".into(),
                    ..Default::default()
                },
                Some(&account_id),
            )
            .await
            .unwrap();
        engine
            .commit_package(
                &deployment_id,
                zip_with(b"v2"),
                ReleaseInfo {
                    app_version: "2.0.0".into(),
                    ..Default::default()
                },
                Some(&account_id),
            )
            .await
            .unwrap();
        let err = engine.rollback(&deployment_id, None, Some(&account_id)).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_release_patches_latest_without_new_blob() {
        let (engine, deployment_id, account_id) = engine().await;
        engine
            .commit_package(
                &deployment_id,
                zip_with(b"v1"),
                ReleaseInfo {
                    app_version: "1.0.0".into(),
                    ..Default::default()
                },
                Some(&account_id),
            )
            .await
            .unwrap();
        engine
            .update_release(
                &deployment_id,
                None,
                ReleaseOverrides {
                    is_disabled: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let latest = engine.storage.get_latest_package(&deployment_id).await.unwrap().unwrap();
        assert!(latest.is_disabled);
    }
}
