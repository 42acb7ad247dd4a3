use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    Json, Router,
    body::{Body, to_bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use serde::{Deserialize, Serialize};
use sso_core::cookie::CookieSettings;
use sso_core::sealed::SealedStore;
use sso_core::session::{AuthorityError, SessionState, SessionTtls, Verdict, revalidate};
use sso_core::validator::EmailValidator;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, warn};
use url::Url;

use crate::backchannel::{AuthClient, BackchannelError};
use crate::config::{ProxyConfig, Route, UpstreamConfig};
use crate::error::AppError;
use crate::hostmux::HostMux;
use crate::metrics::HttpMetricsLayer;
use crate::signer::{RequestSigner, SIGNATURE_HEADER, SIGNATURE_KID_HEADER};

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const CALLBACK_STATE_TTL_SECS: u64 = 300;

/// One upstream plus the cookie settings its handler uses (the cookie name
/// may be overridden per upstream).
pub struct UpstreamHandler {
    pub upstream: UpstreamConfig,
    pub cookies: CookieSettings,
}

/// Immutable per-process proxy state: routing table, sealing keys, signing
/// key, and the back channel to the authenticator.
pub struct ProxyApp {
    config: ProxyConfig,
    mux: HostMux<UpstreamHandler>,
    auth: AuthClient,
    signer: Option<RequestSigner>,
    upstream_http: reqwest::Client,
    cookie_store: SealedStore,
    validator: EmailValidator,
    ttls: SessionTtls,
}

impl ProxyApp {
    pub fn new(config: ProxyConfig, upstreams: Vec<UpstreamConfig>) -> anyhow::Result<Arc<Self>> {
        let cookie_store = SealedStore::new(
            &config.cookie_secret,
            config.cookie_secret_fallback.as_deref(),
        )?;
        let validator =
            EmailValidator::from_config(&config.email_addresses, &config.email_domains);
        let signer = match &config.request_signing_key {
            Some(seed) => Some(RequestSigner::new(
                config.request_signing_key_id.clone(),
                seed,
            )?),
            None => None,
        };

        let backchannel_http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let auth = AuthClient::new(
            backchannel_http,
            config.provider_url.clone(),
            config.proxy_client_id.clone(),
            config.proxy_client_secret.clone(),
        );
        let upstream_http = reqwest::Client::builder()
            .timeout(config.tcp_read_timeout.max(config.tcp_write_timeout))
            .build()?;

        let mut mux = HostMux::new();
        for upstream in upstreams {
            let cookies = CookieSettings {
                name: upstream
                    .cookie_name
                    .clone()
                    .unwrap_or_else(|| config.cookie_name.clone()),
                domain: config.cookie_domain.clone(),
                expire: config.cookie_expire,
                secure: config.cookie_secure,
                http_only: config.cookie_http_only,
            };
            match upstream.route.clone() {
                Route::Simple(_) => {
                    let host = upstream.from.clone();
                    mux.handle_static(&host, UpstreamHandler { upstream, cookies });
                }
                Route::Rewrite { pattern, .. } => {
                    mux.handle_regex(pattern, UpstreamHandler { upstream, cookies });
                }
            }
        }
        anyhow::ensure!(!mux.is_empty(), "no upstreams configured");

        let ttls = config.session_ttls();
        Ok(Arc::new(Self {
            config,
            mux,
            auth,
            signer,
            upstream_http,
            cookie_store,
            validator,
            ttls,
        }))
    }

    pub fn cookie_store(&self) -> &SealedStore {
        &self.cookie_store
    }

    pub fn signer(&self) -> Option<&RequestSigner> {
        self.signer.as_ref()
    }
}

pub fn router(app: Arc<ProxyApp>) -> Router {
    Router::new()
        .route("/ping", any(ping))
        .route("/oauth2/v1/certs", get(certs))
        .fallback(handle)
        .layer(
            TraceLayer::new_for_http()
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(HttpMetricsLayer::new("sso_proxy"))
        .with_state(app)
}

/// Load-balancer health check, answered for any host.
async fn ping() -> impl IntoResponse {
    (StatusCode::OK, "OK\n")
}

/// JWKS with the request-signing public key, for upstream verification.
async fn certs(State(app): State<Arc<ProxyApp>>) -> Result<Json<serde_json::Value>, AppError> {
    match &app.signer {
        Some(signer) => Ok(Json(signer.jwks_document())),
        None => Err(AppError::not_found("request signing is not configured")),
    }
}

async fn handle(State(app): State<Arc<ProxyApp>>, request: Request) -> Response {
    match route_request(&app, request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

/// Claims sealed into the proxy's own OAuth state parameter, binding the
/// original URL across the authenticator round trip.
#[derive(Serialize, Deserialize)]
struct CallbackState {
    return_url: String,
    expires_at: u64,
}

async fn route_request(app: &Arc<ProxyApp>, request: Request) -> Result<Response, AppError> {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let Some((handler, captures)) = app.mux.route(&host) else {
        return Err(AppError::not_found("no upstream configured for host"));
    };
    let target_base = match (&handler.upstream.route, captures) {
        (Route::Simple(url), _) => url.clone(),
        (Route::Rewrite { template, .. }, Some(captures)) => {
            let mut expanded = String::new();
            captures.expand(template, &mut expanded);
            Url::parse(&expanded)
                .map_err(|err| AppError::internal(format!("rewrite produced invalid url: {err}")))?
        }
        (Route::Rewrite { .. }, None) => {
            return Err(AppError::not_found("no upstream configured for host"));
        }
    };

    let path = request.uri().path().to_string();

    if path == "/oauth2/callback" {
        let query = request.uri().query().unwrap_or_default().to_string();
        return oauth_callback(app, handler, &query).await;
    }
    if path == "/oauth2/sign_out" {
        let query = request.uri().query().unwrap_or_default().to_string();
        return proxy_sign_out(app, handler, &host, &query);
    }

    if handler
        .upstream
        .skip_auth
        .iter()
        .any(|pattern| pattern.is_match(&path))
    {
        return forward(app, handler, &target_base, request, None, None).await;
    }

    let original_url = format!(
        "{}://{host}{}",
        external_scheme(app),
        request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    );

    let sealed = request
        .headers()
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|header| handler.cookies.read(header))
        .map(str::to_string);
    let Some(sealed) = sealed else {
        return sign_in_redirect(app, handler, &host, &original_url, false);
    };
    // A cookie that fails to open is indistinguishable from no cookie.
    let Ok(mut session) = app.cookie_store.open::<SessionState>(&sealed) else {
        return sign_in_redirect(app, handler, &host, &original_url, true);
    };

    let now = epoch_seconds();
    let verdict = match revalidate(
        &mut session,
        &app.auth,
        &app.ttls,
        app.config.grace_period,
        now,
    )
    .await
    {
        Ok(verdict) => verdict,
        Err(AuthorityError::Transient(message)) => {
            warn!(%message, "authenticator unavailable past grace period");
            return Err(AppError::bad_gateway("authentication service unavailable"));
        }
        Err(AuthorityError::Rejected(_)) => Verdict::Expired,
    };

    let pending_cookie = match verdict {
        Verdict::Expired => {
            info!(email = %session.email, "session expired; forcing re-auth");
            return sign_in_redirect(app, handler, &host, &original_url, true);
        }
        Verdict::Updated => Some(
            app.cookie_store
                .seal(&session, now)
                .map_err(|err| AppError::internal(err.to_string()))?,
        ),
        Verdict::Unchanged => None,
    };

    let validator = handler
        .upstream
        .validator_override
        .as_ref()
        .unwrap_or(&app.validator);
    if !validator.matches(&session.email) {
        return Err(AppError::forbidden("email address not authorized"));
    }

    // Empty allowed-groups means any authenticated user is authorized.
    let groups = if handler.upstream.allowed_groups.is_empty() {
        session.groups.clone()
    } else {
        match app
            .auth
            .profile(&session.email, &handler.upstream.allowed_groups)
            .await
        {
            Ok(groups) if groups.is_empty() => {
                return Err(AppError::forbidden("not a member of a permitted group"));
            }
            Ok(groups) => groups,
            Err(BackchannelError::Transport(message)) => {
                warn!(%message, "group re-check unavailable; using session snapshot");
                let snapshot: BTreeSet<String> = session
                    .groups
                    .intersection(&handler.upstream.allowed_groups)
                    .cloned()
                    .collect();
                if snapshot.is_empty() {
                    return Err(AppError::forbidden("not a member of a permitted group"));
                }
                snapshot
            }
            Err(err) => return Err(err.into()),
        }
    };

    let identity = ForwardIdentity {
        user: session.user.clone(),
        email: session.email.clone(),
        access_token: session.access_token.clone(),
        groups,
    };
    forward(
        app,
        handler,
        &target_base,
        request,
        Some(identity),
        pending_cookie,
    )
    .await
}

fn sign_in_redirect(
    app: &ProxyApp,
    handler: &UpstreamHandler,
    host: &str,
    original_url: &str,
    clear_cookie: bool,
) -> Result<Response, AppError> {
    let now = epoch_seconds();
    let state = app
        .cookie_store
        .seal(
            &CallbackState {
                return_url: original_url.to_string(),
                expires_at: now + CALLBACK_STATE_TTL_SECS,
            },
            now,
        )
        .map_err(|err| AppError::internal(err.to_string()))?;

    let callback = format!(
        "{}://{host}/oauth2/callback?state={state}",
        external_scheme(app)
    );
    let target = app.auth.sign_in_url(&callback);

    let mut response = found(target.as_str())?;
    if clear_cookie {
        set_cookie(&mut response, &handler.cookies.clear_header())?;
    }
    Ok(response)
}

async fn oauth_callback(
    app: &ProxyApp,
    handler: &UpstreamHandler,
    query: &str,
) -> Result<Response, AppError> {
    let mut code = None;
    let mut state = None;
    for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match name.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            _ => {}
        }
    }
    let state = state.ok_or_else(|| AppError::new(StatusCode::BAD_REQUEST, "missing state"))?;
    let code = code.ok_or_else(|| AppError::new(StatusCode::BAD_REQUEST, "missing code"))?;

    let claims: CallbackState = app
        .cookie_store
        .open(&state)
        .map_err(|_| AppError::new(StatusCode::BAD_REQUEST, "state validation failed"))?;
    let now = epoch_seconds();
    if now > claims.expires_at {
        return Err(AppError::new(StatusCode::BAD_REQUEST, "state expired"));
    }

    let session = app.auth.redeem(&code).await?;
    let validator = handler
        .upstream
        .validator_override
        .as_ref()
        .unwrap_or(&app.validator);
    if !validator.matches(&session.email) {
        return Err(AppError::forbidden("email address not authorized"));
    }

    let sealed = app
        .cookie_store
        .seal(&session, now)
        .map_err(|err| AppError::internal(err.to_string()))?;

    info!(email = %session.email, "session established from auth code");
    let mut response = found(&claims.return_url)?;
    set_cookie(&mut response, &handler.cookies.set_header(&sealed))?;
    Ok(response)
}

fn proxy_sign_out(
    app: &ProxyApp,
    handler: &UpstreamHandler,
    host: &str,
    query: &str,
) -> Result<Response, AppError> {
    let redirect_uri = url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == "redirect_uri")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_else(|| format!("{}://{host}/", external_scheme(app)));

    let target = app.auth.sign_out_url(&redirect_uri);
    let mut response = found(target.as_str())?;
    set_cookie(&mut response, &handler.cookies.clear_header())?;
    Ok(response)
}

struct ForwardIdentity {
    user: String,
    email: String,
    access_token: String,
    groups: BTreeSet<String>,
}

async fn forward(
    app: &ProxyApp,
    handler: &UpstreamHandler,
    target_base: &Url,
    request: Request,
    identity: Option<ForwardIdentity>,
    pending_cookie: Option<String>,
) -> Result<Response, AppError> {
    let (parts, body) = request.into_parts();
    let body = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| AppError::new(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"))?;

    let mut target = target_base.clone();
    target.set_path(parts.uri.path());
    target.set_query(parts.uri.query());

    let mut headers = HeaderMap::new();
    for (name, value) in parts.headers.iter() {
        if is_hop_by_hop(name) || *name == header::HOST {
            continue;
        }
        if *name == header::COOKIE {
            // The session blob never reaches the upstream.
            if let Some(kept) = value
                .to_str()
                .ok()
                .and_then(|header| handler.cookies.strip(header))
                && let Ok(kept) = HeaderValue::from_str(&kept)
            {
                headers.insert(header::COOKIE, kept);
            }
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if handler.upstream.pass_host_header
        && let Some(host) = parts.headers.get(header::HOST)
    {
        headers.insert(header::HOST, host.clone());
    }

    if let Some(identity) = &identity {
        if handler.upstream.pass_user_headers {
            insert_forwarded(&mut headers, "x-forwarded-user", &identity.user)?;
            insert_forwarded(&mut headers, "x-forwarded-email", &identity.email)?;
            let joined = identity.groups.iter().cloned().collect::<Vec<_>>().join(",");
            insert_forwarded(&mut headers, "x-forwarded-groups", &joined)?;
        }
        if handler.upstream.pass_access_token {
            insert_forwarded(&mut headers, "x-forwarded-access-token", &identity.access_token)?;
        }
    }

    for (name, value) in &handler.upstream.inject_headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| AppError::internal(format!("invalid injected header name {name:?}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| AppError::internal("invalid injected header value"))?;
        headers.insert(name, value);
    }

    // Pin the length before signing so the canonical payload matches what
    // the upstream receives on the wire.
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len() as u64));

    if let Some(signer) = &app.signer
        && !handler.upstream.skip_request_signing
    {
        let signature = signer.sign(parts.method.as_str(), parts.uri.path(), &headers, &body);
        insert_forwarded(&mut headers, SIGNATURE_HEADER, &signature)?;
        insert_forwarded(&mut headers, SIGNATURE_KID_HEADER, signer.kid())?;
    }

    let upstream_response = app
        .upstream_http
        .request(parts.method.clone(), target)
        .headers(headers)
        .body(body.to_vec())
        .timeout(handler.upstream.timeout)
        .send()
        .await
        .map_err(|err| AppError::bad_gateway(format!("upstream unreachable: {err}")))?;

    let status = upstream_response.status();
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream_response.headers().iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        response_headers.append(name.clone(), value.clone());
    }
    let bytes = upstream_response
        .bytes()
        .await
        .map_err(|err| AppError::bad_gateway(format!("upstream read failed: {err}")))?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;

    if handler.upstream.set_xauth_request
        && let Some(identity) = &identity
    {
        let user = HeaderValue::from_str(&identity.user)
            .map_err(|_| AppError::internal("unrepresentable user header"))?;
        let email = HeaderValue::from_str(&identity.email)
            .map_err(|_| AppError::internal("unrepresentable email header"))?;
        response.headers_mut().insert("x-auth-request-user", user);
        response.headers_mut().insert("x-auth-request-email", email);
    }

    if let Some(sealed) = pending_cookie {
        let value = HeaderValue::from_str(&handler.cookies.set_header(&sealed))
            .map_err(|_| AppError::internal("unrepresentable cookie header"))?;
        response.headers_mut().append(header::SET_COOKIE, value);
    }

    Ok(response)
}

fn insert_forwarded(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), AppError> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| AppError::internal(format!("invalid header name {name:?}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| AppError::internal(format!("unrepresentable value for {name:?}")))?;
    headers.insert(name, value);
    Ok(())
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn external_scheme(app: &ProxyApp) -> &'static str {
    if app.config.cookie_secure { "https" } else { "http" }
}

/// 302 Found. `axum::response::Redirect` only offers 303/307/308.
fn found(location: &str) -> Result<Response, AppError> {
    let value = HeaderValue::from_str(location)
        .map_err(|_| AppError::new(StatusCode::BAD_REQUEST, "unrepresentable redirect target"))?;
    Ok((StatusCode::FOUND, [(header::LOCATION, value)]).into_response())
}

fn set_cookie(response: &mut Response, header_value: &str) -> Result<(), AppError> {
    let value = HeaderValue::from_str(header_value)
        .map_err(|_| AppError::internal("unrepresentable cookie header"))?;
    response.headers_mut().insert(header::SET_COOKIE, value);
    Ok(())
}

pub fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
