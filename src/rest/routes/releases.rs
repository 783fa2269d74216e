//! `/apps/:name/deployments/:dep/release[...]`, `promote`, `rollback` —
//! the write side of the release history (spec.md §4.5, §6).

use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::release::{ReleaseInfo, ReleaseOverrides};
use crate::rest::auth::authenticate;
use crate::rest::dto::{PackageDto, ReleaseInfoBody};
use crate::storage::{AppRow, DeploymentRow, Permission};
use crate::AppContext;

async fn app_for_account(ctx: &AppContext, account_id: &str, name: &str) -> ApiResult<AppRow> {
    ctx.storage
        .get_app_by_name(account_id, name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("app '{name}' not found")))
}

async fn deployment_for_app(ctx: &AppContext, app_id: &str, name: &str) -> ApiResult<DeploymentRow> {
    ctx.storage
        .get_deployment_by_name(app_id, name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("deployment '{name}' not found")))
}

async fn authorize_collaborator(ctx: &AppContext, app_name: &str, account_id: &str) -> ApiResult<AppRow> {
    let app = app_for_account(ctx, account_id, app_name).await?;
    ctx.access
        .throw_if_invalid_permissions(&app.id, account_id, Permission::Collaborator)
        .await?;
    Ok(app)
}

pub async fn release_package(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path((app_name, dep_name)): Path<(String, String)>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let account_id = authenticate(&ctx, &headers).await?;
    let app = authorize_collaborator(&ctx, &app_name, &account_id).await?;
    let deployment = deployment_for_app(&ctx, &app.id, &dep_name).await?;

    let mut package_bytes: Option<Vec<u8>> = None;
    let mut package_info: Option<ReleaseInfoBody> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Invalid(format!("malformed multipart body: {e}")))?
    {
        match field.name() {
            Some("package") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::Invalid(format!("failed to read package: {e}")))?;
                package_bytes = Some(bytes.to_vec());
            }
            Some("packageInfo") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::Invalid(format!("failed to read packageInfo: {e}")))?;
                package_info = Some(
                    serde_json::from_str(&text)
                        .map_err(|e| ApiError::Invalid(format!("invalid packageInfo: {e}")))?,
                );
            }
            _ => {}
        }
    }

    let bytes = package_bytes.ok_or_else(|| ApiError::Invalid("missing 'package' part".into()))?;
    let info = package_info.ok_or_else(|| ApiError::Invalid("missing 'packageInfo' part".into()))?;

    let release_info = ReleaseInfo {
        app_version: info.app_version,
        description: info.description,
        is_disabled: info.is_disabled,
        is_mandatory: info.is_mandatory,
        rollout: info.rollout,
    };

    let package = ctx
        .release
        .commit_package(&deployment.id, bytes, release_info, Some(&account_id))
        .await?;

    Ok((StatusCode::CREATED, Json(json!({ "package": PackageDto::from(&package) }))))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PromoteBody {
    pub app_version: Option<String>,
    pub description: Option<String>,
    pub is_disabled: Option<bool>,
    pub is_mandatory: Option<bool>,
    pub rollout: Option<i64>,
}

pub async fn promote(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path((app_name, src_name, dst_name)): Path<(String, String, String)>,
    Json(body): Json<PromoteBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let account_id = authenticate(&ctx, &headers).await?;
    let app = authorize_collaborator(&ctx, &app_name, &account_id).await?;
    let src = deployment_for_app(&ctx, &app.id, &src_name).await?;
    let dst = deployment_for_app(&ctx, &app.id, &dst_name).await?;

    let overrides = ReleaseOverrides {
        app_version: body.app_version,
        description: body.description,
        is_disabled: body.is_disabled,
        is_mandatory: body.is_mandatory,
        rollout: body.rollout.map(Some),
    };

    let package = ctx
        .release
        .promote(&src.id, &dst.id, overrides, Some(&account_id))
        .await?;

    Ok((StatusCode::CREATED, Json(json!({ "package": PackageDto::from(&package) }))))
}

pub async fn rollback(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path((app_name, dep_name)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let account_id = authenticate(&ctx, &headers).await?;
    let app = authorize_collaborator(&ctx, &app_name, &account_id).await?;
    let deployment = deployment_for_app(&ctx, &app.id, &dep_name).await?;

    let package = ctx
        .release
        .rollback(&deployment.id, None, Some(&account_id))
        .await?;

    Ok((StatusCode::CREATED, Json(json!({ "package": PackageDto::from(&package) }))))
}

pub async fn rollback_to_label(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path((app_name, dep_name, label)): Path<(String, String, String)>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let account_id = authenticate(&ctx, &headers).await?;
    let app = authorize_collaborator(&ctx, &app_name, &account_id).await?;
    let deployment = deployment_for_app(&ctx, &app.id, &dep_name).await?;

    let package = ctx
        .release
        .rollback(&deployment.id, Some(&label), Some(&account_id))
        .await?;

    Ok((StatusCode::CREATED, Json(json!({ "package": PackageDto::from(&package) }))))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReleaseBody {
    pub label: Option<String>,
    pub app_version: Option<String>,
    pub description: Option<String>,
    pub is_disabled: Option<bool>,
    pub is_mandatory: Option<bool>,
    pub rollout: Option<Option<i64>>,
}

pub async fn update_release(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path((app_name, dep_name)): Path<(String, String)>,
    Json(body): Json<UpdateReleaseBody>,
) -> ApiResult<StatusCode> {
    let account_id = authenticate(&ctx, &headers).await?;
    let app = authorize_collaborator(&ctx, &app_name, &account_id).await?;
    let deployment = deployment_for_app(&ctx, &app.id, &dep_name).await?;

    let patch = ReleaseOverrides {
        app_version: body.app_version,
        description: body.description,
        is_disabled: body.is_disabled,
        is_mandatory: body.is_mandatory,
        rollout: body.rollout,
    };

    ctx.release
        .update_release(&deployment.id, body.label.as_deref(), patch)
        .await?;

    Ok(StatusCode::OK)
}
