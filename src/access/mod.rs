//! C8 — Access Control: bearer-token resolution and permission checks that
//! sit in front of every mutating C4/C5 call. Grounded on
//! `clawd::ipc::auth::validate_bearer`/`get_or_create_token` for the
//! token-resolution shape — generalized from a single-account daemon token
//! to per-account access keys resolved through the relational store.

use crate::error::{ApiError, ApiResult};
use crate::storage::{AccessKeyRow, CollaboratorRow, Permission, Storage};

/// The secret `name` field is never returned to a listing; it always reads
/// `"(hidden)"` (spec.md §4.8).
pub const MASKED_ACCESS_KEY_NAME: &str = "(hidden)";

pub struct AccessControl {
    storage: Storage,
}

impl AccessControl {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Resolves a bearer token to an account id, propagating `NotFound`/
    /// `Expired` from the store unchanged.
    pub async fn authenticate(&self, token: &str) -> ApiResult<String> {
        self.storage.get_account_id_from_access_key(token).await
    }

    /// Throws `Forbidden` unless `account_id` is a collaborator on `app_id`
    /// with permission at least `required` (Owner >= Collaborator).
    pub async fn throw_if_invalid_permissions(
        &self,
        app_id: &str,
        account_id: &str,
        required: Permission,
    ) -> ApiResult<CollaboratorRow> {
        let collaborator = self
            .storage
            .get_collaborator(app_id, account_id)
            .await?
            .ok_or_else(|| ApiError::Forbidden("not a collaborator on this app".into()))?;
        if !collaborator.permission()?.satisfies(required) {
            return Err(ApiError::Forbidden(format!(
                "requires {} permission",
                required.as_str()
            )));
        }
        Ok(collaborator)
    }

    /// A collaborator may always remove themselves; removing the Owner is
    /// forbidden regardless of who initiates it (enforced again at the store
    /// layer — see `Storage::remove_collaborator`).
    pub async fn can_remove_self(&self, app_id: &str, account_id: &str) -> ApiResult<bool> {
        let collaborator = self
            .storage
            .get_collaborator(app_id, account_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("collaborator".into()))?;
        Ok(collaborator.permission()? != Permission::Owner)
    }

    /// Lists access keys for `account_id` with the secret `name` replaced by
    /// `MASKED_ACCESS_KEY_NAME`.
    pub async fn list_masked_access_keys(&self, account_id: &str) -> ApiResult<Vec<AccessKeyRow>> {
        let mut keys = self.storage.list_access_keys(account_id).await?;
        for key in &mut keys {
            key.name = MASKED_ACCESS_KEY_NAME.to_string();
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (AccessControl, Storage, String, String) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(&dir.path().join("data")).await.unwrap();
        std::mem::forget(dir);
        let owner = storage.create_account("owner@example.com", "Owner").await.unwrap();
        let app = storage.add_app(&owner.id, "MyApp").await.unwrap();
        (AccessControl::new(storage.clone()), storage, app.id, owner.id)
    }

    #[tokio::test]
    async fn owner_satisfies_collaborator_requirement() {
        let (access, _storage, app_id, owner_id) = setup().await;
        let result = access
            .throw_if_invalid_permissions(&app_id, &owner_id, Permission::Collaborator)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn non_collaborator_is_forbidden() {
        let (access, storage, app_id, _owner_id) = setup().await;
        let outsider = storage.create_account("outsider@example.com", "Outsider").await.unwrap();
        let err = access
            .throw_if_invalid_permissions(&app_id, &outsider.id, Permission::Collaborator)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[tokio::test]
    async fn collaborator_does_not_satisfy_owner_requirement() {
        let (access, storage, app_id, _owner_id) = setup().await;
        let collaborator = storage.create_account("c@example.com", "C").await.unwrap();
        storage
            .add_collaborator(&app_id, &collaborator.id, Permission::Collaborator)
            .await
            .unwrap();
        let err = access
            .throw_if_invalid_permissions(&app_id, &collaborator.id, Permission::Owner)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[tokio::test]
    async fn owner_cannot_remove_self_but_collaborator_can() {
        let (access, storage, app_id, owner_id) = setup().await;
        assert!(!access.can_remove_self(&app_id, &owner_id).await.unwrap());

        let collaborator = storage.create_account("c@example.com", "C").await.unwrap();
        storage
            .add_collaborator(&app_id, &collaborator.id, Permission::Collaborator)
            .await
            .unwrap();
        assert!(access.can_remove_self(&app_id, &collaborator.id).await.unwrap());
    }

    #[tokio::test]
    async fn listing_access_keys_masks_the_name() {
        let (access, storage, _app_id, owner_id) = setup().await;
        storage
            .create_access_key(&owner_id, "ck_secrettoken", "CLI", None, i64::MAX, false)
            .await
            .unwrap();
        let keys = access.list_masked_access_keys(&owner_id).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].name, MASKED_ACCESS_KEY_NAME);
    }
}
