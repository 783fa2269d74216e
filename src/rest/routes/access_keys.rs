//! `/accessKeys[...]` — personal access key management (spec.md §4.8, §6).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::access::MASKED_ACCESS_KEY_NAME;
use crate::error::{ApiError, ApiResult};
use crate::rest::auth::authenticate;
use crate::rest::dto::AccessKeyDto;
use crate::util;
use crate::AppContext;

/// Access keys never expire unless the caller says so.
const DEFAULT_TTL_SECONDS: i64 = 60 * 60 * 24 * 365;

pub async fn list_access_keys(State(ctx): State<Arc<AppContext>>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    let account_id = authenticate(&ctx, &headers).await?;
    let keys = ctx.access.list_masked_access_keys(&account_id).await?;
    let dtos: Vec<AccessKeyDto> = keys.iter().map(AccessKeyDto::from).collect();
    Ok(Json(json!({ "accessKeys": dtos })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccessKeyBody {
    pub friendly_name: String,
    pub ttl: Option<i64>,
}

pub async fn create_access_key(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<CreateAccessKeyBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let account_id = authenticate(&ctx, &headers).await?;
    if body.friendly_name.trim().is_empty() {
        return Err(ApiError::Invalid("friendlyName is required".into()));
    }
    let token = util::generate_access_key();
    let expires = chrono::Utc::now().timestamp() + body.ttl.unwrap_or(DEFAULT_TTL_SECONDS);
    let row = ctx
        .storage
        .create_access_key(&account_id, &token, &body.friendly_name, Some(&account_id), expires, false)
        .await?;
    // The raw token is only ever returned here; subsequent reads mask `name`.
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "accessKey": AccessKeyDto::from(&row),
            "token": row.name,
        })),
    ))
}

async fn key_for_account(ctx: &AppContext, account_id: &str, friendly_name: &str) -> ApiResult<crate::storage::AccessKeyRow> {
    let row = ctx
        .storage
        .get_access_key_by_friendly_name(account_id, friendly_name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("access key '{friendly_name}' not found")))?;
    Ok(row)
}

pub async fn get_access_key(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(friendly_name): Path<String>,
) -> ApiResult<Json<Value>> {
    let account_id = authenticate(&ctx, &headers).await?;
    let mut row = key_for_account(&ctx, &account_id, &friendly_name).await?;
    row.name = MASKED_ACCESS_KEY_NAME.to_string();
    Ok(Json(json!({ "accessKey": AccessKeyDto::from(&row) })))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAccessKeyBody {
    pub friendly_name: Option<String>,
    pub ttl: Option<i64>,
}

pub async fn update_access_key(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(friendly_name): Path<String>,
    Json(body): Json<UpdateAccessKeyBody>,
) -> ApiResult<Json<Value>> {
    let account_id = authenticate(&ctx, &headers).await?;
    let row = key_for_account(&ctx, &account_id, &friendly_name).await?;
    let new_expires = body.ttl.map(|ttl| chrono::Utc::now().timestamp() + ttl);
    let mut updated = ctx
        .storage
        .update_access_key(&row.id, body.friendly_name.as_deref(), new_expires)
        .await?;
    updated.name = MASKED_ACCESS_KEY_NAME.to_string();
    Ok(Json(json!({ "accessKey": AccessKeyDto::from(&updated) })))
}

pub async fn delete_access_key(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(friendly_name): Path<String>,
) -> ApiResult<StatusCode> {
    let account_id = authenticate(&ctx, &headers).await?;
    let row = key_for_account(&ctx, &account_id, &friendly_name).await?;
    ctx.storage.remove_access_key(&row.id).await?;
    Ok(StatusCode::NO_CONTENT)
}
