//! `/apps[...]` — app CRUD, ownership transfer, and collaborator management
//! (spec.md §6, §4.8).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::rest::auth::authenticate;
use crate::rest::dto::{AppDto, CollaboratorDto};
use crate::storage::Permission;
use crate::AppContext;

async fn app_for_account(ctx: &AppContext, account_id: &str, name: &str) -> ApiResult<crate::storage::AppRow> {
    ctx.storage
        .get_app_by_name(account_id, name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("app '{name}' not found")))
}

pub async fn list_apps(State(ctx): State<Arc<AppContext>>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    let account_id = authenticate(&ctx, &headers).await?;
    let apps = ctx.storage.list_apps_for_account(&account_id).await?;
    let dtos: Vec<AppDto> = apps.iter().map(AppDto::from).collect();
    Ok(Json(json!({ "apps": dtos })))
}

#[derive(Debug, Deserialize)]
pub struct CreateAppBody {
    pub name: String,
}

pub async fn create_app(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<CreateAppBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let account_id = authenticate(&ctx, &headers).await?;
    if body.name.trim().is_empty() {
        return Err(ApiError::Invalid("app name is required".into()));
    }
    let app = ctx.storage.add_app(&account_id, &body.name).await?;
    Ok((StatusCode::CREATED, Json(json!({ "app": AppDto::from(&app) }))))
}

pub async fn get_app(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let account_id = authenticate(&ctx, &headers).await?;
    let app = app_for_account(&ctx, &account_id, &name).await?;
    ctx.access
        .throw_if_invalid_permissions(&app.id, &account_id, Permission::Collaborator)
        .await?;
    Ok(Json(json!({ "app": AppDto::from(&app) })))
}

#[derive(Debug, Deserialize)]
pub struct RenameAppBody {
    pub name: String,
}

pub async fn update_app(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(body): Json<RenameAppBody>,
) -> ApiResult<Json<Value>> {
    let account_id = authenticate(&ctx, &headers).await?;
    let app = app_for_account(&ctx, &account_id, &name).await?;
    ctx.access
        .throw_if_invalid_permissions(&app.id, &account_id, Permission::Owner)
        .await?;
    let renamed = ctx.storage.rename_app(&app.id, &body.name).await?;
    Ok(Json(json!({ "app": AppDto::from(&renamed) })))
}

pub async fn delete_app(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    let account_id = authenticate(&ctx, &headers).await?;
    let app = app_for_account(&ctx, &account_id, &name).await?;
    ctx.access
        .throw_if_invalid_permissions(&app.id, &account_id, Permission::Owner)
        .await?;
    ctx.storage.remove_app(&app.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn transfer_app(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path((name, email)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let account_id = authenticate(&ctx, &headers).await?;
    let app = app_for_account(&ctx, &account_id, &name).await?;
    ctx.access
        .throw_if_invalid_permissions(&app.id, &account_id, Permission::Owner)
        .await?;
    ctx.storage.transfer_app(&app.id, &email).await?;
    Ok(StatusCode::CREATED)
}

pub async fn list_collaborators(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let account_id = authenticate(&ctx, &headers).await?;
    let app = app_for_account(&ctx, &account_id, &name).await?;
    ctx.access
        .throw_if_invalid_permissions(&app.id, &account_id, Permission::Collaborator)
        .await?;
    let collaborators = ctx.storage.list_collaborators(&app.id).await?;
    let mut dtos = Vec::with_capacity(collaborators.len());
    for c in &collaborators {
        let email = ctx
            .storage
            .get_account(&c.account_id)
            .await
            .ok()
            .flatten()
            .map(|a| a.email)
            .unwrap_or_default();
        dtos.push(CollaboratorDto {
            email,
            permission: c.permission.clone(),
            is_current_account: c.account_id == account_id,
        });
    }
    Ok(Json(json!({ "collaborators": dtos })))
}

pub async fn add_collaborator(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path((name, email)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let account_id = authenticate(&ctx, &headers).await?;
    let app = app_for_account(&ctx, &account_id, &name).await?;
    ctx.access
        .throw_if_invalid_permissions(&app.id, &account_id, Permission::Owner)
        .await?;
    let collaborator = ctx
        .storage
        .get_or_create_account_by_email(&email, &email)
        .await
        .map_err(ApiError::from)?;
    ctx.storage
        .add_collaborator(&app.id, &collaborator.id, Permission::Collaborator)
        .await?;
    Ok(StatusCode::CREATED)
}

pub async fn remove_collaborator(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path((name, email)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let account_id = authenticate(&ctx, &headers).await?;
    let app = app_for_account(&ctx, &account_id, &name).await?;
    let target = ctx
        .storage
        .get_account_by_email(&email)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::NotFound("collaborator".into()))?;

    if target.id != account_id {
        ctx.access
            .throw_if_invalid_permissions(&app.id, &account_id, Permission::Owner)
            .await?;
    } else if !ctx.access.can_remove_self(&app.id, &account_id).await? {
        return Err(ApiError::Forbidden("the app owner cannot remove themselves".into()));
    }

    ctx.storage.remove_collaborator(&app.id, &target.id).await?;
    Ok(StatusCode::NO_CONTENT)
}
