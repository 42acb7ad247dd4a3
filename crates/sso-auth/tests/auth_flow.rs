use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use http_body_util::BodyExt;
use sso_auth::config::AuthConfig;
use sso_auth::http::{self, AppContext};
use sso_core::provider::{
    Profile, Provider, ProviderError, ProviderErrorKind, ProviderResult, Redemption,
};
use sso_core::sealed::SealedStore;
use sso_core::session::{RefreshedTokens, SessionState};
use tower::ServiceExt;
use url::Url;

const COOKIE_SECRET: [u8; 32] = [7u8; 32];

struct FakeProvider {
    email: String,
    groups: BTreeSet<String>,
    valid: AtomicBool,
    revoke_calls: AtomicUsize,
}

impl FakeProvider {
    fn new(email: &str, groups: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            email: email.to_string(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            valid: AtomicBool::new(true),
            revoke_calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn kind(&self) -> &'static str {
        "fake"
    }

    fn sign_in_url(&self, state: &str) -> Url {
        let mut url = Url::parse("https://idp.example.com/authorize").unwrap();
        url.query_pairs_mut().append_pair("state", state);
        url
    }

    async fn redeem(&self, code: &str) -> ProviderResult<Redemption> {
        if code != "provider-code" {
            return Err(ProviderError::new(
                ProviderErrorKind::TokenRevoked,
                "unknown code".to_string(),
            ));
        }
        Ok(Redemption {
            email: self.email.clone(),
            user: "uid-1".into(),
            access_token: "provider-access".into(),
            refresh_token: "provider-refresh".into(),
            id_token: None,
            expires_in: Some(3600),
        })
    }

    async fn refresh(&self, refresh_token: &str) -> ProviderResult<RefreshedTokens> {
        if refresh_token == "provider-refresh" {
            Ok(RefreshedTokens {
                access_token: "rotated-access".into(),
                expires_in: Some(3600),
            })
        } else {
            Err(ProviderError::new(
                ProviderErrorKind::TokenRevoked,
                "invalid_grant".to_string(),
            ))
        }
    }

    async fn revoke(&self, _access: &str, _refresh: &str) -> ProviderResult<()> {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn validate(&self, _access_token: &str) -> ProviderResult<bool> {
        Ok(self.valid.load(Ordering::SeqCst))
    }

    async fn user_profile(&self, _access_token: &str) -> ProviderResult<Profile> {
        Ok(Profile {
            email: self.email.clone(),
            user: "uid-1".into(),
        })
    }

    async fn group_membership(
        &self,
        _email: &str,
        allowed: &BTreeSet<String>,
    ) -> ProviderResult<BTreeSet<String>> {
        if allowed.is_empty() {
            Ok(self.groups.clone())
        } else {
            Ok(self.groups.intersection(allowed).cloned().collect())
        }
    }
}

fn test_config(overrides: &[(&'static str, &str)]) -> AuthConfig {
    let secret = BASE64_STANDARD.encode(COOKIE_SECRET);
    let mut env: HashMap<&'static str, String> = HashMap::from([
        ("REDIRECT_URL", "https://auth.example.com/callback".to_string()),
        ("CLIENT_ID", "client".into()),
        ("CLIENT_SECRET", "client-secret".into()),
        ("PROXY_CLIENT_ID", "proxy-client".into()),
        ("PROXY_CLIENT_SECRET", "proxy-secret".into()),
        ("EMAIL_DOMAIN", "corp.example.com".into()),
        ("PROXY_ROOT_DOMAIN", "example.com".into()),
        ("COOKIE_SECRET", secret.clone()),
        ("AUTH_CODE_SECRET", secret),
    ]);
    for (key, value) in overrides {
        env.insert(key, value.to_string());
    }
    AuthConfig::from_lookup(|key| env.get(key).cloned()).expect("config")
}

fn app(provider: Arc<dyn Provider>) -> Router {
    app_with(provider, &[])
}

fn app_with(provider: Arc<dyn Provider>, overrides: &[(&'static str, &str)]) -> Router {
    let context = AppContext::new(test_config(overrides), provider).expect("context");
    http::router(Arc::new(context))
}

fn proxy_basic_auth() -> String {
    format!(
        "Basic {}",
        BASE64_STANDARD.encode("proxy-client:proxy-secret")
    )
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}

fn location(response: &axum::response::Response) -> Url {
    let raw = response
        .headers()
        .get(header::LOCATION)
        .expect("location header")
        .to_str()
        .expect("location utf8");
    Url::parse(raw).expect("location url")
}

/// Walk the full browser flow and return (auth code, sealed cookie value).
async fn complete_sign_in(router: &Router) -> (String, String) {
    let start = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/start?redirect_uri=https%3A%2F%2Fapp.example.com%2Foauth2%2Fcallback")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("start");
    assert_eq!(start.status(), StatusCode::FOUND);
    let provider_url = location(&start);
    let state = provider_url
        .query_pairs()
        .find(|(name, _)| name == "state")
        .map(|(_, value)| value.into_owned())
        .expect("state param");

    let callback = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/callback?code=provider-code&state={state}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("callback");
    assert_eq!(callback.status(), StatusCode::FOUND);

    let target = location(&callback);
    assert_eq!(target.host_str(), Some("app.example.com"));
    let code = target
        .query_pairs()
        .find(|(name, _)| name == "code")
        .map(|(_, value)| value.into_owned())
        .expect("auth code");

    let set_cookie = callback
        .headers()
        .get(header::SET_COOKIE)
        .expect("set-cookie")
        .to_str()
        .expect("cookie utf8")
        .to_string();
    let sealed = set_cookie
        .split(';')
        .next()
        .and_then(|pair| pair.split_once('='))
        .map(|(_, value)| value.to_string())
        .expect("cookie value");

    (code, sealed)
}

#[tokio::test]
async fn ping_answers_ok() {
    let router = app(FakeProvider::new("a@corp.example.com", &[]));
    let response = router
        .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
        .await
        .expect("ping");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "OK\n");
}

#[tokio::test]
async fn sign_in_without_session_renders_provider_button() {
    let router = app(FakeProvider::new("a@corp.example.com", &[]));
    let response = router
        .oneshot(
            Request::builder()
                .uri("/sign_in?redirect_uri=https%3A%2F%2Fapp.example.com%2F&client_id=proxy-client")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("sign_in");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("action=\"/start\""), "{body}");
}

#[tokio::test]
async fn sign_in_with_skip_provider_button_redirects_to_start() {
    let router = app_with(
        FakeProvider::new("a@corp.example.com", &[]),
        &[("SKIP_PROVIDER_BUTTON", "true")],
    );
    let response = router
        .oneshot(
            Request::builder()
                .uri("/sign_in?redirect_uri=https%3A%2F%2Fapp.example.com%2F&client_id=proxy-client")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("sign_in");
    assert_eq!(response.status(), StatusCode::FOUND);
    let target = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(target.starts_with("/start?redirect_uri="), "{target}");
}

#[tokio::test]
async fn sign_in_rejects_unknown_client_id() {
    let router = app(FakeProvider::new("a@corp.example.com", &[]));
    let response = router
        .oneshot(
            Request::builder()
                .uri("/sign_in?redirect_uri=https%3A%2F%2Fapp.example.com%2F&client_id=imposter")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("sign_in");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sign_in_rejects_missing_client_id() {
    let router = app(FakeProvider::new("a@corp.example.com", &[]));
    let response = router
        .oneshot(
            Request::builder()
                .uri("/sign_in?redirect_uri=https%3A%2F%2Fapp.example.com%2F")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("sign_in");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sign_in_rejects_foreign_redirect_host() {
    let router = app(FakeProvider::new("a@corp.example.com", &[]));
    let response = router
        .oneshot(
            Request::builder()
                .uri("/sign_in?redirect_uri=https%3A%2F%2Fevil.example.net%2F&client_id=proxy-client")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("sign_in");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn callback_rejects_unauthorized_email() {
    let router = app(FakeProvider::new("a@other.example.net", &[]));
    let start = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/start?redirect_uri=https%3A%2F%2Fapp.example.com%2F")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("start");
    let state = location(&start)
        .query_pairs()
        .find(|(name, _)| name == "state")
        .map(|(_, value)| value.into_owned())
        .unwrap();

    let response = router
        .oneshot(
            Request::builder()
                .uri(format!("/callback?code=provider-code&state={state}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("callback");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn callback_rejects_tampered_state() {
    let router = app(FakeProvider::new("a@corp.example.com", &[]));
    let response = router
        .oneshot(
            Request::builder()
                .uri("/callback?code=provider-code&state=state.fake.sig")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("callback");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn redeemed_session_matches_the_sealed_cookie() {
    let router = app(FakeProvider::new("a@corp.example.com", &["eng"]));
    let (code, sealed_cookie) = complete_sign_in(&router).await;

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/redeem")
                .header(header::AUTHORIZATION, proxy_basic_auth())
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(format!("code={code}")))
                .unwrap(),
        )
        .await
        .expect("redeem");
    assert_eq!(response.status(), StatusCode::OK);

    let redeemed: SessionState =
        serde_json::from_str(&body_string(response).await).expect("session json");

    let store = SealedStore::new(&COOKIE_SECRET, None).expect("store");
    let cookie_session: SessionState = store.open(&sealed_cookie).expect("cookie session");
    assert_eq!(redeemed, cookie_session);
    assert_eq!(redeemed.email, "a@corp.example.com");
    assert!(redeemed.groups.contains("eng"));
    assert_eq!(redeemed.access_token, "provider-access");
}

#[tokio::test]
async fn redeem_requires_proxy_credentials() {
    let router = app(FakeProvider::new("a@corp.example.com", &[]));
    let (code, _) = complete_sign_in(&router).await;

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/redeem")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(format!("code={code}")))
                .unwrap(),
        )
        .await
        .expect("redeem");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn redeem_rejects_garbage_codes() {
    let router = app(FakeProvider::new("a@corp.example.com", &[]));
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/redeem")
                .header(header::AUTHORIZATION, proxy_basic_auth())
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("code=not-a-code"))
                .unwrap(),
        )
        .await
        .expect("redeem");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn refresh_returns_rotated_access_token() {
    let router = app(FakeProvider::new("a@corp.example.com", &[]));
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/refresh")
                .header(header::AUTHORIZATION, proxy_basic_auth())
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("refresh_token=provider-refresh"))
                .unwrap(),
        )
        .await
        .expect("refresh");
    assert_eq!(response.status(), StatusCode::OK);
    let tokens: RefreshedTokens =
        serde_json::from_str(&body_string(response).await).expect("tokens");
    assert_eq!(tokens.access_token, "rotated-access");
}

#[tokio::test]
async fn refresh_with_rejected_token_is_unauthorized() {
    let router = app(FakeProvider::new("a@corp.example.com", &[]));
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/refresh")
                .header(header::AUTHORIZATION, proxy_basic_auth())
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("refresh_token=stale"))
                .unwrap(),
        )
        .await
        .expect("refresh");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn validate_reflects_provider_answer() {
    let provider = FakeProvider::new("a@corp.example.com", &[]);
    let router = app(provider.clone());

    let ok = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/validate")
                .header(header::AUTHORIZATION, proxy_basic_auth())
                .header("X-Access-Token", "provider-access")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("validate");
    assert_eq!(ok.status(), StatusCode::OK);

    provider.valid.store(false, Ordering::SeqCst);
    let invalid = router
        .oneshot(
            Request::builder()
                .uri("/validate")
                .header(header::AUTHORIZATION, proxy_basic_auth())
                .header("X-Access-Token", "provider-access")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("validate");
    assert_eq!(invalid.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn profile_returns_group_intersection() {
    let router = app(FakeProvider::new("a@corp.example.com", &["eng", "oncall"]));
    let response = router
        .oneshot(
            Request::builder()
                .uri("/profile?email=a@corp.example.com&groups=eng,sales")
                .header(header::AUTHORIZATION, proxy_basic_auth())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("profile");
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value =
        serde_json::from_str(&body_string(response).await).expect("json");
    assert_eq!(body["groups"], serde_json::json!(["eng"]));
}

#[tokio::test]
async fn repeated_sign_out_is_a_no_op_after_the_first() {
    let provider = FakeProvider::new("a@corp.example.com", &[]);
    let router = app(provider.clone());
    let (_, sealed_cookie) = complete_sign_in(&router).await;

    let first = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/sign_out?redirect_uri=https%3A%2F%2Fapp.example.com%2F")
                .header(header::COOKIE, format!("_sso_auth={sealed_cookie}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("sign_out");
    assert_eq!(first.status(), StatusCode::FOUND);
    let cleared = first
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(cleared.contains("Max-Age=-1"), "{cleared}");
    assert_eq!(provider.revoke_calls.load(Ordering::SeqCst), 1);

    // Second call arrives without a session cookie: nothing left to revoke.
    let second = router
        .oneshot(
            Request::builder()
                .uri("/sign_out?redirect_uri=https%3A%2F%2Fapp.example.com%2F")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("sign_out");
    assert_eq!(second.status(), StatusCode::FOUND);
    assert_eq!(provider.revoke_calls.load(Ordering::SeqCst), 1);
}
