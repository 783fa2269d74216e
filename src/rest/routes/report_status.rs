//! `POST /reportStatus/deploy` and `/reportStatus/download` (spec.md §4.7).

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::metrics::DeploymentStatus;
use crate::AppContext;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDeployBody {
    pub deployment_key: String,
    pub label: String,
    pub client_unique_id: String,
    pub status: String,
    pub previous_deployment_key: Option<String>,
    pub previous_label: Option<String>,
}

pub async fn report_deploy(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<ReportDeployBody>,
) -> ApiResult<Json<Value>> {
    match body.status.as_str() {
        "DeploymentSucceeded" => {
            ctx.metrics
                .record_deployment_status(
                    &body.deployment_key,
                    &body.label,
                    DeploymentStatus::Succeeded,
                    &body.client_unique_id,
                )
                .await?;
        }
        "DeploymentFailed" => {
            ctx.metrics
                .record_deployment_status(
                    &body.deployment_key,
                    &body.label,
                    DeploymentStatus::Failed,
                    &body.client_unique_id,
                )
                .await?;
        }
        _ => {
            ctx.metrics
                .record_deployment(
                    &body.deployment_key,
                    &body.label,
                    &body.client_unique_id,
                    body.previous_deployment_key.as_deref(),
                    body.previous_label.as_deref(),
                )
                .await?;
        }
    }
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDownloadBody {
    pub deployment_key: String,
    pub label: String,
    pub client_unique_id: String,
}

pub async fn report_download(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<ReportDownloadBody>,
) -> ApiResult<Json<Value>> {
    if body.deployment_key.is_empty() || body.label.is_empty() {
        return Err(ApiError::Invalid("deploymentKey and label are required".into()));
    }
    ctx.metrics
        .record_download(&body.deployment_key, &body.label, &body.client_unique_id)
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}
