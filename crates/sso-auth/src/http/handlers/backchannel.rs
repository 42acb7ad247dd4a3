use std::collections::BTreeSet;

use axum::{
    Form, Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use sso_core::session::{RefreshedTokens, SessionState};

use crate::http::{SharedContext, epoch_seconds, error::AppError, require_proxy_auth};

#[derive(Deserialize)]
pub struct RedeemForm {
    pub code: String,
}

/// Proxy back channel: exchange an auth code for the full session so the
/// proxy can seal its own cookie. The session round-trips byte-identically.
pub async fn redeem(
    headers: HeaderMap,
    State(ctx): State<SharedContext>,
    Form(form): Form<RedeemForm>,
) -> Result<Json<SessionState>, AppError> {
    require_proxy_auth(&ctx, &headers)?;
    let claims = ctx.auth_codes.redeem(&form.code, epoch_seconds())?;
    Ok(Json(claims.session))
}

#[derive(Deserialize)]
pub struct RefreshForm {
    pub refresh_token: String,
}

pub async fn refresh(
    headers: HeaderMap,
    State(ctx): State<SharedContext>,
    Form(form): Form<RefreshForm>,
) -> Result<Json<RefreshedTokens>, AppError> {
    require_proxy_auth(&ctx, &headers)?;
    let tokens = ctx.provider.refresh(&form.refresh_token).await?;
    Ok(Json(tokens))
}

pub async fn validate(
    headers: HeaderMap,
    State(ctx): State<SharedContext>,
) -> Result<Response, AppError> {
    require_proxy_auth(&ctx, &headers)?;
    let access_token = headers
        .get("X-Access-Token")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::bad_request("missing X-Access-Token header"))?;

    if ctx.provider.validate(access_token).await? {
        Ok((StatusCode::OK, "ok\n").into_response())
    } else {
        Ok((StatusCode::UNAUTHORIZED, "invalid\n").into_response())
    }
}

#[derive(Deserialize)]
pub struct ProfileQuery {
    pub email: String,
    #[serde(default)]
    pub groups: Option<String>,
}

#[derive(Serialize)]
pub struct ProfileResponse {
    pub email: String,
    pub groups: BTreeSet<String>,
}

/// Re-check group authorization for a user without touching their tokens.
/// Returns the intersection of the requested groups with actual membership.
pub async fn profile(
    Query(query): Query<ProfileQuery>,
    headers: HeaderMap,
    State(ctx): State<SharedContext>,
) -> Result<Json<ProfileResponse>, AppError> {
    require_proxy_auth(&ctx, &headers)?;
    let allowed: BTreeSet<String> = query
        .groups
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|group| !group.is_empty())
        .map(str::to_string)
        .collect();

    let email = query.email.to_ascii_lowercase();
    let groups = ctx.provider.group_membership(&email, &allowed).await?;
    Ok(Json(ProfileResponse { email, groups }))
}
