//! `/apps/:name/deployments[...]` — deployment CRUD, history, and metrics
//! (spec.md §6, §4.7, §4.8).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::rest::auth::authenticate;
use crate::rest::dto::{DeploymentDto, PackageDto};
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

async fn dto_for(ctx: &AppContext, row: &DeploymentRow) -> ApiResult<DeploymentDto> {
    let latest = ctx
        .storage
        .list_package_history(&row.id)
        .await?
        .into_iter()
        .last();
    Ok(DeploymentDto::new(row, latest.as_ref()))
}

pub async fn list_deployments(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(app_name): Path<String>,
) -> ApiResult<Json<Value>> {
    let account_id = authenticate(&ctx, &headers).await?;
    let app = app_for_account(&ctx, &account_id, &app_name).await?;
    ctx.access
        .throw_if_invalid_permissions(&app.id, &account_id, Permission::Collaborator)
        .await?;
    let rows = ctx.storage.list_deployments(&app.id).await?;
    let mut dtos = Vec::with_capacity(rows.len());
    for row in &rows {
        dtos.push(dto_for(&ctx, row).await?);
    }
    Ok(Json(json!({ "deployments": dtos })))
}

#[derive(Debug, Deserialize)]
pub struct CreateDeploymentBody {
    pub name: String,
}

pub async fn create_deployment(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(app_name): Path<String>,
    Json(body): Json<CreateDeploymentBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let account_id = authenticate(&ctx, &headers).await?;
    let app = app_for_account(&ctx, &account_id, &app_name).await?;
    ctx.access
        .throw_if_invalid_permissions(&app.id, &account_id, Permission::Owner)
        .await?;
    if body.name.trim().is_empty() {
        return Err(ApiError::Invalid("deployment name is required".into()));
    }
    let key = crate::util::generate_deployment_key();
    let row = ctx.storage.add_deployment(&app.id, &body.name, &key).await?;
    let dto = dto_for(&ctx, &row).await?;
    Ok((StatusCode::CREATED, Json(json!({ "deployment": dto }))))
}

pub async fn get_deployment(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path((app_name, dep_name)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let account_id = authenticate(&ctx, &headers).await?;
    let app = app_for_account(&ctx, &account_id, &app_name).await?;
    ctx.access
        .throw_if_invalid_permissions(&app.id, &account_id, Permission::Collaborator)
        .await?;
    let row = deployment_for_app(&ctx, &app.id, &dep_name).await?;
    let dto = dto_for(&ctx, &row).await?;
    Ok(Json(json!({ "deployment": dto })))
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateDeploymentBody {
    pub name: Option<String>,
}

pub async fn update_deployment(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path((app_name, dep_name)): Path<(String, String)>,
    Json(body): Json<UpdateDeploymentBody>,
) -> ApiResult<Json<Value>> {
    let account_id = authenticate(&ctx, &headers).await?;
    let app = app_for_account(&ctx, &account_id, &app_name).await?;
    ctx.access
        .throw_if_invalid_permissions(&app.id, &account_id, Permission::Owner)
        .await?;
    let row = deployment_for_app(&ctx, &app.id, &dep_name).await?;
    let updated = ctx
        .storage
        .update_deployment(&row.id, body.name.as_deref(), None)
        .await?;
    let dto = dto_for(&ctx, &updated).await?;
    Ok(Json(json!({ "deployment": dto })))
}

pub async fn delete_deployment(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path((app_name, dep_name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let account_id = authenticate(&ctx, &headers).await?;
    let app = app_for_account(&ctx, &account_id, &app_name).await?;
    ctx.access
        .throw_if_invalid_permissions(&app.id, &account_id, Permission::Owner)
        .await?;
    let row = deployment_for_app(&ctx, &app.id, &dep_name).await?;
    ctx.storage.remove_deployment(&row.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_history(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path((app_name, dep_name)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let account_id = authenticate(&ctx, &headers).await?;
    let app = app_for_account(&ctx, &account_id, &app_name).await?;
    ctx.access
        .throw_if_invalid_permissions(&app.id, &account_id, Permission::Collaborator)
        .await?;
    let row = deployment_for_app(&ctx, &app.id, &dep_name).await?;
    let packages = ctx.storage.list_package_history(&row.id).await?;
    let dtos: Vec<PackageDto> = packages.iter().map(PackageDto::from).collect();
    Ok(Json(json!({ "history": dtos })))
}

pub async fn get_metrics(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path((app_name, dep_name)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let account_id = authenticate(&ctx, &headers).await?;
    let app = app_for_account(&ctx, &account_id, &app_name).await?;
    ctx.access
        .throw_if_invalid_permissions(&app.id, &account_id, Permission::Collaborator)
        .await?;
    let row = deployment_for_app(&ctx, &app.id, &dep_name).await?;
    let metrics = ctx.metrics.get_metrics(&row.key).await?;
    Ok(Json(json!({ "metrics": metrics })))
}
