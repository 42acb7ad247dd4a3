use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Deserialize;
use sso_core::session::{AuthorityError, RefreshedTokens, SessionAuthority, SessionState};
use thiserror::Error;
use url::Url;

#[derive(Clone, Debug, Error)]
pub enum BackchannelError {
    #[error("authenticator unreachable: {0}")]
    Transport(String),
    #[error("authenticator rejected the request: {0}")]
    Rejected(String),
    #[error("unexpected authenticator response: {0}")]
    InvalidResponse(String),
}

/// Client for the authenticator's proxy-facing endpoints. Every call is
/// bounded by the request timeout baked into the HTTP client at startup.
pub struct AuthClient {
    http: reqwest::Client,
    base: Url,
    client_id: String,
    client_secret: String,
}

impl AuthClient {
    pub fn new(http: reqwest::Client, base: Url, client_id: String, client_secret: String) -> Self {
        Self {
            http,
            base,
            client_id,
            client_secret,
        }
    }

    fn endpoint(&self, leaf: &str) -> Url {
        self.base.join(leaf).expect("authenticator endpoint join")
    }

    /// Browser-facing sign-in URL carrying the proxy's callback.
    pub fn sign_in_url(&self, redirect_uri: &str) -> Url {
        let mut url = self.endpoint("sign_in");
        url.query_pairs_mut()
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("client_id", &self.client_id);
        url
    }

    /// Browser-facing sign-out URL.
    pub fn sign_out_url(&self, redirect_uri: &str) -> Url {
        let mut url = self.endpoint("sign_out");
        url.query_pairs_mut()
            .append_pair("redirect_uri", redirect_uri);
        url
    }

    /// Exchange an auth code for the full session.
    pub async fn redeem(&self, code: &str) -> Result<SessionState, BackchannelError> {
        let response = self
            .http
            .post(self.endpoint("redeem"))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("code", code)])
            .send()
            .await
            .map_err(|err| BackchannelError::Transport(err.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(BackchannelError::Rejected(format!(
                "redeem returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(BackchannelError::Transport(format!(
                "redeem returned {status}"
            )));
        }
        response
            .json::<SessionState>()
            .await
            .map_err(|err| BackchannelError::InvalidResponse(err.to_string()))
    }

    /// Re-check group authorization; returns the intersection of `allowed`
    /// with the user's actual memberships.
    pub async fn profile(
        &self,
        email: &str,
        allowed: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, BackchannelError> {
        let groups = allowed.iter().cloned().collect::<Vec<_>>().join(",");
        let mut url = self.endpoint("profile");
        url.query_pairs_mut()
            .append_pair("email", email)
            .append_pair("groups", &groups);

        let response = self
            .http
            .get(url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .send()
            .await
            .map_err(|err| BackchannelError::Transport(err.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(BackchannelError::Rejected(format!(
                "profile returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(BackchannelError::Transport(format!(
                "profile returned {status}"
            )));
        }
        let body: ProfileResponse = response
            .json()
            .await
            .map_err(|err| BackchannelError::InvalidResponse(err.to_string()))?;
        Ok(body.groups)
    }
}

#[derive(Deserialize)]
struct ProfileResponse {
    groups: BTreeSet<String>,
}

#[async_trait]
impl SessionAuthority for AuthClient {
    async fn validate(&self, access_token: &str) -> Result<bool, AuthorityError> {
        let response = self
            .http
            .get(self.endpoint("validate"))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header("X-Access-Token", access_token)
            .send()
            .await
            .map_err(|err| AuthorityError::Transient(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(true)
        } else if status == reqwest::StatusCode::UNAUTHORIZED {
            Ok(false)
        } else {
            Err(AuthorityError::Transient(format!(
                "validate returned {status}"
            )))
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, AuthorityError> {
        let response = self
            .http
            .post(self.endpoint("refresh"))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("refresh_token", refresh_token)])
            .send()
            .await
            .map_err(|err| AuthorityError::Transient(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            response
                .json::<RefreshedTokens>()
                .await
                .map_err(|err| AuthorityError::Transient(err.to_string()))
        } else if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            Err(AuthorityError::Rejected(
                "refresh token rejected".to_string(),
            ))
        } else {
            Err(AuthorityError::Transient(format!(
                "refresh returned {status}"
            )))
        }
    }
}
