pub mod error;
pub mod handlers;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::http::{HeaderMap, Request, Response, StatusCode, header};
use axum::{
    Router,
    routing::{get, post},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use metrics::{counter, histogram};
use sso_core::cookie::CookieSettings;
use sso_core::provider::Provider;
use sso_core::sealed::SealedStore;
use sso_core::validator::EmailValidator;
use tower::{Layer, Service};
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::code::{AuthCodeStore, CodeError, StateCodec};
use crate::config::AuthConfig;
use error::AppError;

/// Everything the handlers need, immutable after startup.
pub struct AppContext {
    pub config: AuthConfig,
    pub provider: Arc<dyn Provider>,
    pub cookies: CookieSettings,
    pub cookie_store: SealedStore,
    pub auth_codes: AuthCodeStore,
    pub states: StateCodec,
    pub validator: EmailValidator,
}

pub type SharedContext = Arc<AppContext>;

impl AppContext {
    pub fn new(config: AuthConfig, provider: Arc<dyn Provider>) -> Result<Self, CodeError> {
        let cookies = CookieSettings {
            name: config.cookie_name.clone(),
            domain: config.cookie_domain.clone(),
            expire: config.cookie_expire,
            secure: config.cookie_secure,
            http_only: config.cookie_http_only,
        };
        let cookie_store = SealedStore::new(
            &config.cookie_secret,
            config.cookie_secret_fallback.as_deref(),
        )?;
        let auth_codes = AuthCodeStore::new(&config.auth_code_secret)?;
        let states = StateCodec::new(&config.auth_code_secret)?;
        let validator = EmailValidator::from_config(&config.email_addresses, &config.email_domains);
        Ok(Self {
            config,
            provider,
            cookies,
            cookie_store,
            auth_codes,
            states,
            validator,
        })
    }
}

pub fn router(context: SharedContext) -> Router {
    Router::new()
        .route("/ping", get(handlers::ping))
        .route("/sign_in", get(handlers::sign_in))
        .route("/start", get(handlers::start))
        .route("/callback", get(handlers::callback))
        .route("/sign_out", get(handlers::sign_out))
        .route("/redeem", post(handlers::redeem))
        .route("/refresh", post(handlers::refresh))
        .route("/validate", get(handlers::validate))
        .route("/profile", get(handlers::profile))
        .layer(
            TraceLayer::new_for_http()
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(HttpMetricsLayer::new("sso_auth"))
        .with_state(context)
}

pub fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Guard for the proxy back-channel endpoints: HTTP Basic auth with the
/// proxy client credentials.
pub fn require_proxy_auth(context: &AppContext, headers: &HeaderMap) -> Result<(), AppError> {
    let denied = || AppError::unauthorized("proxy authentication required");

    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(denied)?;
    let encoded = header.strip_prefix("Basic ").ok_or_else(denied)?;
    let decoded = BASE64_STANDARD
        .decode(encoded.as_bytes())
        .map_err(|_| denied())?;
    let decoded = String::from_utf8(decoded).map_err(|_| denied())?;
    let (client_id, client_secret) = decoded.split_once(':').ok_or_else(denied)?;

    if client_id == context.config.proxy_client_id
        && client_secret == context.config.proxy_client_secret
    {
        Ok(())
    } else {
        Err(denied())
    }
}

/// Request count, error count, and latency via the `metrics` facade.
#[derive(Clone)]
pub struct HttpMetricsLayer {
    prefix: &'static str,
}

impl HttpMetricsLayer {
    pub fn new(prefix: &'static str) -> Self {
        Self { prefix }
    }
}

impl<S> Layer<S> for HttpMetricsLayer {
    type Service = HttpMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpMetricsService {
            inner,
            prefix: self.prefix,
        }
    }
}

#[derive(Clone)]
pub struct HttpMetricsService<S> {
    inner: S,
    prefix: &'static str,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for HttpMetricsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let start = Instant::now();
        let prefix = self.prefix;
        let fut = self.inner.call(request);

        Box::pin(async move {
            let result = fut.await;
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            counter!(format!("{prefix}_http_requests_total")).increment(1);
            histogram!(format!("{prefix}_http_latency_ms")).record(elapsed_ms);

            match result {
                Ok(response) => {
                    if response.status() >= StatusCode::INTERNAL_SERVER_ERROR {
                        counter!(format!("{prefix}_http_errors_total")).increment(1);
                    }
                    Ok(response)
                }
                Err(err) => {
                    counter!(format!("{prefix}_http_errors_total")).increment(1);
                    Err(err)
                }
            }
        })
    }
}
