use std::collections::BTreeSet;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use serde::Deserialize;
use sso_core::provider::ProviderErrorKind;
use sso_core::session::{SessionState, SessionStatus};
use tracing::{info, warn};
use url::Url;

use crate::code::StateClaims;
use crate::http::{SharedContext, epoch_seconds, error::AppError};

pub async fn ping() -> impl IntoResponse {
    (StatusCode::OK, "OK\n")
}

#[derive(Deserialize)]
pub struct SignInQuery {
    pub redirect_uri: String,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Entry point for browsers bounced off a proxy. Only registered proxies
/// may start a flow, so the client_id must always match. A still-fresh
/// authenticator session skips the provider round trip entirely.
pub async fn sign_in(
    Query(query): Query<SignInQuery>,
    headers: HeaderMap,
    State(ctx): State<SharedContext>,
) -> Result<Response, AppError> {
    if query.client_id.as_deref() != Some(ctx.config.proxy_client_id.as_str()) {
        return Err(AppError::bad_request("missing or unknown client_id"));
    }
    let redirect = parse_proxy_redirect(&ctx, &query.redirect_uri)?;

    let now = epoch_seconds();
    if let Some(session) = session_from_cookie(&ctx, &headers)
        && session.status(now) == SessionStatus::Fresh
        && ctx.validator.matches(&session.email)
    {
        let code = ctx.auth_codes.mint(&session, redirect.as_str(), now)?;
        let target = append_code(&redirect, &code);
        return found(target.as_str());
    }

    if ctx.config.skip_provider_button {
        let query_string = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("redirect_uri", &query.redirect_uri)
            .finish();
        return found(&format!("/start?{query_string}"));
    }

    Ok(Html(sign_in_page(&ctx, &query.redirect_uri)).into_response())
}

#[derive(Deserialize)]
pub struct StartQuery {
    pub redirect_uri: String,
}

/// Bind the return URL and a nonce into a signed state token, then hand the
/// browser to the provider.
pub async fn start(
    Query(query): Query<StartQuery>,
    State(ctx): State<SharedContext>,
) -> Result<Response, AppError> {
    let redirect = parse_proxy_redirect(&ctx, &query.redirect_uri)?;
    let claims = StateClaims::new(redirect.as_str(), epoch_seconds());
    let state = ctx.states.seal("state", &claims)?;
    found(ctx.provider.sign_in_url(&state).as_str())
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

pub async fn callback(
    Query(query): Query<CallbackQuery>,
    State(ctx): State<SharedContext>,
) -> Result<Response, AppError> {
    if let Some(message) = query.error {
        return Err(AppError::bad_request(format!(
            "provider returned error: {message}"
        )));
    }
    let state_token = query
        .state
        .ok_or_else(|| AppError::bad_request("missing state"))?;
    let code = query
        .code
        .ok_or_else(|| AppError::bad_request("missing code"))?;

    let now = epoch_seconds();
    let claims: StateClaims = ctx
        .states
        .open("state", &state_token, now)
        .map_err(|_| AppError::bad_request("state validation failed"))?;
    let redirect = parse_proxy_redirect(&ctx, &claims.redirect_uri)?;

    let redemption = ctx.provider.redeem(&code).await?;
    if !ctx.validator.matches(&redemption.email) {
        info!(email = %redemption.email, "rejected sign-in for unauthorized email");
        return Err(AppError::forbidden("email address not authorized"));
    }

    let groups = match ctx
        .provider
        .group_membership(&redemption.email, &BTreeSet::new())
        .await
    {
        Ok(groups) => groups,
        Err(err) if err.kind() == ProviderErrorKind::Unsupported => BTreeSet::new(),
        Err(err) => {
            warn!(email = %redemption.email, error = %err, "group lookup failed at callback");
            BTreeSet::new()
        }
    };

    let session = SessionState::mint(
        &redemption.email,
        &redemption.user,
        groups,
        redemption.access_token,
        redemption.refresh_token,
        redemption.id_token,
        &ctx.config.session_ttls(),
        now,
    );

    let auth_code = ctx.auth_codes.mint(&session, redirect.as_str(), now)?;
    let target = append_code(&redirect, &auth_code);
    let sealed = ctx.cookie_store.seal(&session, now)?;

    info!(email = %session.email, "session minted");
    let mut response = found(target.as_str())?;
    set_cookie(&mut response, &ctx.cookies.set_header(&sealed))?;
    Ok(response)
}

#[derive(Deserialize)]
pub struct SignOutQuery {
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

/// Revoke tokens and clear the cookie. Idempotent: with no session left the
/// handler only clears and redirects.
pub async fn sign_out(
    Query(query): Query<SignOutQuery>,
    headers: HeaderMap,
    State(ctx): State<SharedContext>,
) -> Result<Response, AppError> {
    if let Some(session) = session_from_cookie(&ctx, &headers) {
        if let Err(err) = ctx
            .provider
            .revoke(&session.access_token, &session.refresh_token)
            .await
        {
            warn!(email = %session.email, error = %err, "token revocation failed");
        } else {
            info!(email = %session.email, "session revoked");
        }
    }

    let mut response = match query.redirect_uri.as_deref() {
        Some(uri) if !uri.is_empty() => {
            let redirect = parse_proxy_redirect(&ctx, uri)?;
            found(redirect.as_str())?
        }
        _ => (StatusCode::OK, "signed out\n").into_response(),
    };
    set_cookie(&mut response, &ctx.cookies.clear_header())?;
    Ok(response)
}

fn parse_proxy_redirect(ctx: &SharedContext, raw: &str) -> Result<Url, AppError> {
    let url = Url::parse(raw).map_err(|_| AppError::bad_request("invalid redirect_uri"))?;
    if !ctx.config.redirect_host_allowed(&url) {
        return Err(AppError::bad_request(
            "redirect_uri is not under a configured proxy root domain",
        ));
    }
    Ok(url)
}

fn session_from_cookie(ctx: &SharedContext, headers: &HeaderMap) -> Option<SessionState> {
    let header = headers.get(header::COOKIE)?.to_str().ok()?;
    let value = ctx.cookies.read(header)?;
    ctx.cookie_store.open(value).ok()
}

fn append_code(redirect: &Url, code: &str) -> Url {
    let mut target = redirect.clone();
    target.query_pairs_mut().append_pair("code", code);
    target
}

/// 302 Found. `axum::response::Redirect` only offers 303/307/308.
fn found(location: &str) -> Result<Response, AppError> {
    let value = HeaderValue::from_str(location)
        .map_err(|_| AppError::bad_request("unrepresentable redirect target"))?;
    Ok((StatusCode::FOUND, [(header::LOCATION, value)]).into_response())
}

fn set_cookie(response: &mut Response, header_value: &str) -> Result<(), AppError> {
    let value = HeaderValue::from_str(header_value)
        .map_err(|_| AppError::internal("unrepresentable cookie header"))?;
    response.headers_mut().insert(header::SET_COOKIE, value);
    Ok(())
}

fn sign_in_page(ctx: &SharedContext, redirect_uri: &str) -> String {
    let provider = ctx.provider.kind();
    let label = match provider {
        "google" => "Google",
        "okta" => "Okta",
        other => other,
    };
    format!(
        "<!doctype html><html><body>\
         <form method=\"get\" action=\"/start\">\
         <input type=\"hidden\" name=\"redirect_uri\" value=\"{}\">\
         <button type=\"submit\">Sign in with {label}</button>\
         </form></body></html>",
        html_escape(redirect_uri)
    )
}

fn html_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
