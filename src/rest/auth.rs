//! Bearer-token resolution shared by every authenticated route. Grounded on
//! `clawd::ipc::auth::validate_bearer`'s header-parsing shape, generalized
//! to resolve through C8 instead of a single daemon-wide token.

use axum::http::HeaderMap;

use crate::error::{ApiError, ApiResult};
use crate::AppContext;

/// Extracts the bearer token from `Authorization: Bearer <token>` and
/// resolves it to an account id via C8. Every mutating and every
/// collaborator-scoped route calls this first.
pub async fn authenticate(ctx: &AppContext, headers: &HeaderMap) -> ApiResult<String> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or(ApiError::Unauthorized)?;
    ctx.access.authenticate(token).await
}
