//! The HTTP adapter: routes every endpoint in the external interface onto
//! C1-C9, and is the only layer that turns an `ApiError` into a status code
//! (via its `IntoResponse` impl in `crate::error`). Grounded on
//! `clawd::rest::build_router`'s `Router::new().route(...).with_state(ctx)`
//! shape and its `TraceLayer`/`CorsLayer` wiring.

pub mod auth;
pub mod dto;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppContext;

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    let cors = cors_layer(&ctx);

    Router::new()
        .route("/api/v1/health", get(routes::health::health))
        .route("/updateCheck", get(routes::update_check::update_check))
        .route(
            "/v0.1/public/codepush/update_check",
            get(routes::update_check::update_check_snake),
        )
        .route("/reportStatus/deploy", post(routes::report_status::report_deploy))
        .route("/reportStatus/download", post(routes::report_status::report_download))
        .route(
            "/apps",
            get(routes::apps::list_apps).post(routes::apps::create_app),
        )
        .route(
            "/apps/:name",
            get(routes::apps::get_app)
                .patch(routes::apps::update_app)
                .delete(routes::apps::delete_app),
        )
        .route("/apps/:name/transfer/:email", post(routes::apps::transfer_app))
        .route("/apps/:name/collaborators", get(routes::apps::list_collaborators))
        .route(
            "/apps/:name/collaborators/:email",
            post(routes::apps::add_collaborator).delete(routes::apps::remove_collaborator),
        )
        .route(
            "/apps/:name/deployments",
            get(routes::deployments::list_deployments).post(routes::deployments::create_deployment),
        )
        .route(
            "/apps/:name/deployments/",
            get(routes::deployments::list_deployments).post(routes::deployments::create_deployment),
        )
        .route(
            "/apps/:name/deployments/:dep",
            get(routes::deployments::get_deployment)
                .patch(routes::deployments::update_deployment)
                .delete(routes::deployments::delete_deployment),
        )
        .route("/apps/:name/deployments/:dep/history", get(routes::deployments::get_history))
        .route("/apps/:name/deployments/:dep/metrics", get(routes::deployments::get_metrics))
        .route(
            "/apps/:name/deployments/:dep/release",
            post(routes::releases::release_package).patch(routes::releases::update_release),
        )
        .route(
            "/apps/:name/deployments/:src/promote/:dst",
            post(routes::releases::promote),
        )
        .route("/apps/:name/deployments/:dep/rollback", post(routes::releases::rollback))
        .route(
            "/apps/:name/deployments/:dep/rollback/:target",
            post(routes::releases::rollback_to_label),
        )
        .route(
            "/accessKeys",
            get(routes::access_keys::list_access_keys).post(routes::access_keys::create_access_key),
        )
        .route(
            "/accessKeys/:friendlyName",
            get(routes::access_keys::get_access_key)
                .patch(routes::access_keys::update_access_key)
                .delete(routes::access_keys::delete_access_key),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(ctx)
}

/// CORS origins come from config; an empty list means same-origin only, no
/// silent wildcard default.
fn cors_layer(ctx: &AppContext) -> CorsLayer {
    let origins: Vec<_> = ctx
        .config
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
        .max_age(Duration::from_secs(3600))
}

pub async fn start_rest_server(ctx: Arc<AppContext>) -> Result<()> {
    let port = ctx.config.port;
    let bind = format!("0.0.0.0:{port}");
    let addr: SocketAddr = bind.parse()?;
    let router = build_router(ctx);

    info!("codepush server listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
