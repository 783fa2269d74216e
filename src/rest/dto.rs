//! JSON wire shapes for the REST adapter. Kept separate from the storage
//! row types so C4 never has to know about camelCase or which fields a
//! client is allowed to see.

use serde::{Deserialize, Serialize};

use crate::resolver::UpdateInfo;
use crate::storage::{AccessKeyRow, AppRow, DeploymentRow, PackageRow};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDto {
    pub name: String,
}

impl From<&AppRow> for AppDto {
    fn from(row: &AppRow) -> Self {
        Self { name: row.name.clone() }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaboratorDto {
    pub email: String,
    pub permission: String,
    pub is_current_account: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageDto {
    pub label: String,
    pub app_version: String,
    pub description: Option<String>,
    pub is_disabled: bool,
    pub is_mandatory: bool,
    pub rollout: Option<i64>,
    pub package_hash: String,
    pub size: i64,
    pub release_method: String,
    pub original_label: Option<String>,
    pub original_deployment: Option<String>,
    pub released_by: Option<String>,
    pub upload_time: i64,
}

impl From<&PackageRow> for PackageDto {
    fn from(row: &PackageRow) -> Self {
        Self {
            label: row.label.clone(),
            app_version: row.app_version.clone(),
            description: row.description.clone(),
            is_disabled: row.is_disabled,
            is_mandatory: row.is_mandatory,
            rollout: row.rollout,
            package_hash: row.package_hash.clone(),
            size: row.size,
            release_method: row.release_method.clone(),
            original_label: row.original_label.clone(),
            original_deployment: row.original_deployment.clone(),
            released_by: row.released_by.clone(),
            upload_time: row.upload_time,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentDto {
    pub name: String,
    pub key: String,
    pub package: Option<PackageDto>,
}

impl DeploymentDto {
    pub fn new(row: &DeploymentRow, latest: Option<&PackageRow>) -> Self {
        Self {
            name: row.name.clone(),
            key: row.key.clone(),
            package: latest.map(PackageDto::from),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessKeyDto {
    pub name: String,
    pub friendly_name: String,
    pub created_time: i64,
    pub expires: i64,
    pub is_session: bool,
}

impl From<&AccessKeyRow> for AccessKeyDto {
    fn from(row: &AccessKeyRow) -> Self {
        Self {
            name: row.name.clone(),
            friendly_name: row.friendly_name.clone(),
            created_time: row.created_time,
            expires: row.expires,
            is_session: row.is_session,
        }
    }
}

#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfoDto {
    pub is_available: bool,
    pub is_mandatory: bool,
    pub app_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "downloadURL")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub should_run_binary_version: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_app_version: Option<bool>,
}

impl From<UpdateInfo> for UpdateInfoDto {
    fn from(info: UpdateInfo) -> Self {
        Self {
            is_available: info.is_available,
            is_mandatory: info.is_mandatory,
            app_version: info.app_version,
            package_hash: info.package_hash,
            label: info.label,
            package_size: info.package_size,
            description: info.description,
            download_url: info.download_url,
            should_run_binary_version: info.should_run_binary_version,
            update_app_version: info.update_app_version,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseInfoBody {
    pub app_version: String,
    pub description: Option<String>,
    #[serde(default)]
    pub is_disabled: bool,
    #[serde(default)]
    pub is_mandatory: bool,
    pub rollout: Option<i64>,
}
