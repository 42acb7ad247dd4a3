use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Deserialize;
use sso_core::provider::{
    Profile, Provider, ProviderError, ProviderErrorKind, ProviderResult, Redemption,
};
use sso_core::session::RefreshedTokens;
use url::Url;

const DEFAULT_SCOPE: &str = "openid profile email offline_access";

/// Okta OAuth2 binding against a configurable authorization server.
///
/// Group membership is resolved per user through the Okta users API with an
/// `SSWS` token; there is no enumeration, so the on-demand cache wraps this
/// provider.
pub struct OktaProvider {
    http: reqwest::Client,
    org_url: Url,
    server_id: String,
    client_id: String,
    client_secret: String,
    redirect_uri: Url,
    scope: String,
    api_token: Option<String>,
}

impl OktaProvider {
    pub fn new(
        http: reqwest::Client,
        org_url: Url,
        server_id: String,
        client_id: String,
        client_secret: String,
        redirect_uri: Url,
        scope: Option<String>,
        api_token: Option<String>,
    ) -> Result<Self, ProviderError> {
        if client_id.is_empty() || client_secret.is_empty() {
            return Err(ProviderError::new(
                ProviderErrorKind::Configuration,
                "missing Okta client credentials".to_string(),
            ));
        }
        Ok(Self {
            http,
            org_url,
            server_id,
            client_id,
            client_secret,
            redirect_uri,
            scope: scope.unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
            api_token,
        })
    }

    fn oauth_endpoint(&self, leaf: &str) -> Url {
        self.org_url
            .join(&format!("oauth2/{}/v1/{leaf}", self.server_id))
            .expect("okta endpoint join")
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> ProviderResult<TokenResponse> {
        let response = self
            .http
            .post(self.oauth_endpoint("token"))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(params)
            .send()
            .await
            .map_err(|err| ProviderError::transport(err.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ProviderError::transport(format!(
                "token endpoint returned {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let kind = if body.contains("invalid_grant") || body.contains("invalid_token") {
                ProviderErrorKind::TokenRevoked
            } else {
                ProviderErrorKind::InvalidResponse
            };
            return Err(ProviderError::new(
                kind,
                format!("token endpoint returned {status}: {body}"),
            ));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|err| ProviderError::new(ProviderErrorKind::InvalidResponse, err.to_string()))
    }

    async fn userinfo(&self, access_token: &str) -> ProviderResult<UserInfo> {
        let response = self
            .http
            .get(self.oauth_endpoint("userinfo"))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|err| ProviderError::transport(err.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::new(
                ProviderErrorKind::TokenRevoked,
                format!("userinfo endpoint returned {status}"),
            ));
        }
        if !status.is_success() {
            return Err(ProviderError::transport(format!(
                "userinfo endpoint returned {status}"
            )));
        }
        response
            .json()
            .await
            .map_err(|err| ProviderError::new(ProviderErrorKind::InvalidResponse, err.to_string()))
    }
}

#[async_trait]
impl Provider for OktaProvider {
    fn kind(&self) -> &'static str {
        "okta"
    }

    fn sign_in_url(&self, state: &str) -> Url {
        let mut url = self.oauth_endpoint("authorize");
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", self.redirect_uri.as_str())
            .append_pair("scope", &self.scope)
            .append_pair("state", state);
        url
    }

    async fn redeem(&self, code: &str) -> ProviderResult<Redemption> {
        let redirect_uri = self.redirect_uri.to_string();
        let tokens = self
            .token_request(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri.as_str()),
            ])
            .await?;

        let profile = self.userinfo(&tokens.access_token).await?;
        let refresh_token = tokens.refresh_token.ok_or_else(|| {
            ProviderError::new(
                ProviderErrorKind::InvalidResponse,
                "token response missing refresh_token; is offline_access in scope?".to_string(),
            )
        })?;

        Ok(Redemption {
            email: profile.email,
            user: profile.sub,
            access_token: tokens.access_token,
            refresh_token,
            id_token: tokens.id_token,
            expires_in: tokens.expires_in,
        })
    }

    async fn refresh(&self, refresh_token: &str) -> ProviderResult<RefreshedTokens> {
        let tokens = self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("scope", self.scope.as_str()),
            ])
            .await?;
        Ok(RefreshedTokens {
            access_token: tokens.access_token,
            expires_in: tokens.expires_in,
        })
    }

    async fn revoke(&self, access_token: &str, refresh_token: &str) -> ProviderResult<()> {
        for (token, hint) in [
            (refresh_token, "refresh_token"),
            (access_token, "access_token"),
        ] {
            let response = self
                .http
                .post(self.oauth_endpoint("revoke"))
                .basic_auth(&self.client_id, Some(&self.client_secret))
                .form(&[("token", token), ("token_type_hint", hint)])
                .send()
                .await
                .map_err(|err| ProviderError::transport(err.to_string()))?;
            if response.status().is_server_error() {
                return Err(ProviderError::transport(format!(
                    "revoke endpoint returned {}",
                    response.status()
                )));
            }
        }
        Ok(())
    }

    async fn validate(&self, access_token: &str) -> ProviderResult<bool> {
        match self.userinfo(access_token).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ProviderErrorKind::TokenRevoked => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn user_profile(&self, access_token: &str) -> ProviderResult<Profile> {
        let info = self.userinfo(access_token).await?;
        Ok(Profile {
            email: info.email,
            user: info.sub,
        })
    }

    async fn group_membership(
        &self,
        email: &str,
        allowed: &BTreeSet<String>,
    ) -> ProviderResult<BTreeSet<String>> {
        let api_token = self.api_token.as_ref().ok_or_else(|| {
            ProviderError::new(
                ProviderErrorKind::Configuration,
                "OKTA_API_TOKEN is required for group lookups".to_string(),
            )
        })?;

        let url = self
            .org_url
            .join(&format!("api/v1/users/{email}/groups"))
            .expect("okta groups url join");
        let response = self
            .http
            .get(url)
            .header("Authorization", format!("SSWS {api_token}"))
            .send()
            .await
            .map_err(|err| ProviderError::transport(err.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(BTreeSet::new());
        }
        if !status.is_success() {
            return Err(ProviderError::transport(format!(
                "groups endpoint returned {status}"
            )));
        }

        let groups: Vec<OktaGroup> = response
            .json()
            .await
            .map_err(|err| ProviderError::new(ProviderErrorKind::InvalidResponse, err.to_string()))?;
        let memberships: BTreeSet<String> =
            groups.into_iter().map(|g| g.profile.name).collect();

        if allowed.is_empty() {
            Ok(memberships)
        } else {
            Ok(memberships.intersection(allowed).cloned().collect())
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

#[derive(Deserialize)]
struct UserInfo {
    email: String,
    sub: String,
}

#[derive(Deserialize)]
struct OktaGroup {
    profile: OktaGroupProfile,
}

#[derive(Deserialize)]
struct OktaGroupProfile {
    name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> OktaProvider {
        OktaProvider::new(
            reqwest::Client::new(),
            Url::parse("https://corp.okta.com/").unwrap(),
            "default".into(),
            "client".into(),
            "secret".into(),
            Url::parse("https://auth.example.com/callback").unwrap(),
            None,
            None,
        )
        .expect("provider")
    }

    #[test]
    fn endpoints_embed_the_authorization_server_id() {
        let url = provider().sign_in_url("state");
        assert!(
            url.as_str()
                .starts_with("https://corp.okta.com/oauth2/default/v1/authorize")
        );
    }

    #[test]
    fn sign_in_url_carries_offline_access_scope() {
        let url = provider().sign_in_url("state");
        let query: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert!(query.get("scope").unwrap().contains("offline_access"));
    }

    #[test]
    fn group_lookup_without_api_token_is_a_config_error() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let err = rt
            .block_on(provider().group_membership("a@corp.example.com", &BTreeSet::new()))
            .expect_err("no api token");
        assert_eq!(err.kind(), ProviderErrorKind::Configuration);
    }
}
