//! `GET /updateCheck` and its legacy snake_case transport variant
//! (spec.md §4.6 / §6). Both consume the same resolver output; only field
//! casing and the on-error contract differ.

use std::sync::Arc;

use axum::{extract::Query, extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::resolver::UpdateQuery;
use crate::rest::dto::UpdateInfoDto;
use crate::AppContext;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheckParams {
    pub deployment_key: String,
    pub app_version: String,
    pub package_hash: Option<String>,
    pub label: Option<String>,
    pub client_unique_id: Option<String>,
    #[serde(default)]
    pub is_companion: bool,
}

impl From<UpdateCheckParams> for UpdateQuery {
    fn from(p: UpdateCheckParams) -> Self {
        UpdateQuery {
            deployment_key: p.deployment_key,
            app_version: p.app_version,
            package_hash: p.package_hash,
            label: p.label,
            client_unique_id: p.client_unique_id,
            is_companion: p.is_companion,
        }
    }
}

pub async fn update_check(
    State(ctx): State<Arc<AppContext>>,
    Query(params): Query<UpdateCheckParams>,
) -> Result<Json<Value>, ApiError> {
    if params.deployment_key.is_empty() || params.app_version.is_empty() {
        return Err(ApiError::Invalid("deploymentKey and appVersion are required".into()));
    }
    let info = ctx.resolver.resolve(&params.into()).await?;
    Ok(Json(json!({ "updateInfo": UpdateInfoDto::from(info) })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateCheckParamsSnake {
    pub deployment_key: String,
    pub app_version: String,
    pub package_hash: Option<String>,
    pub label: Option<String>,
    pub client_unique_id: Option<String>,
    #[serde(default)]
    pub is_companion: bool,
}

/// The legacy transport: identical semantics and snake_case response keys.
/// An unknown deployment key is still a real 404 — `UpdateResolver::resolve`
/// already degrades every other failure to a safe `{is_available: false}`
/// response, so nothing here needs to swallow those separately (spec.md §6).
pub async fn update_check_snake(
    State(ctx): State<Arc<AppContext>>,
    Query(params): Query<UpdateCheckParamsSnake>,
) -> Result<Json<Value>, ApiError> {
    let query = UpdateQuery {
        deployment_key: params.deployment_key,
        app_version: params.app_version,
        package_hash: params.package_hash,
        label: params.label,
        client_unique_id: params.client_unique_id,
        is_companion: params.is_companion,
    };
    let info = ctx.resolver.resolve(&query).await?;
    Ok(Json(json!({
        "update_info": {
            "is_available": info.is_available,
            "is_mandatory": info.is_mandatory,
            "app_version": info.app_version,
            "package_hash": info.package_hash,
            "label": info.label,
            "package_size": info.package_size,
            "description": info.description,
            "download_url": info.download_url,
            "should_run_binary_version": info.should_run_binary_version,
            "update_app_version": info.update_app_version,
        }
    })))
}
