use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use sso_core::provider::{
    Profile, Provider, ProviderError, ProviderErrorKind, ProviderResult, Redemption,
};
use sso_core::session::RefreshedTokens;
use url::Url;

use crate::groups::{FillCache, GroupMembers};

const DEFAULT_SCOPE: &str = "openid email profile";
const DIRECTORY_SCOPE: &str = "https://www.googleapis.com/auth/admin.directory.group.readonly \
                               https://www.googleapis.com/auth/admin.directory.group.member.readonly";

/// Google OAuth2 binding with offline access. Group membership comes from
/// the admin-impersonating directory client feeding the fill cache.
pub struct GoogleProvider {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    redirect_uri: Url,
    scope: String,
    auth_url: Url,
    token_url: Url,
    revoke_url: Url,
    validate_url: Url,
    userinfo_url: Url,
    groups_cache: Option<Arc<FillCache>>,
}

impl GoogleProvider {
    pub fn new(
        http: reqwest::Client,
        client_id: String,
        client_secret: String,
        redirect_uri: Url,
        scope: Option<String>,
    ) -> Result<Self, ProviderError> {
        if client_id.is_empty() || client_secret.is_empty() {
            return Err(ProviderError::new(
                ProviderErrorKind::Configuration,
                "missing Google client credentials".to_string(),
            ));
        }
        Ok(Self {
            http,
            client_id,
            client_secret,
            redirect_uri,
            scope: scope.unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
            auth_url: static_url("https://accounts.google.com/o/oauth2/v2/auth"),
            token_url: static_url("https://oauth2.googleapis.com/token"),
            revoke_url: static_url("https://oauth2.googleapis.com/revoke"),
            validate_url: static_url("https://www.googleapis.com/oauth2/v1/tokeninfo"),
            userinfo_url: static_url("https://openidconnect.googleapis.com/v1/userinfo"),
            groups_cache: None,
        })
    }

    pub fn with_groups_cache(mut self, cache: Arc<FillCache>) -> Self {
        self.groups_cache = Some(cache);
        self
    }

    /// Point every endpoint at a test double.
    #[doc(hidden)]
    pub fn with_base_url(mut self, base: &Url) -> Self {
        self.auth_url = join(base, "o/oauth2/v2/auth");
        self.token_url = join(base, "token");
        self.revoke_url = join(base, "revoke");
        self.validate_url = join(base, "tokeninfo");
        self.userinfo_url = join(base, "userinfo");
        self
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> ProviderResult<TokenResponse> {
        let response = self
            .http
            .post(self.token_url.clone())
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
}

#[async_trait]
impl Provider for GoogleProvider {
    fn kind(&self) -> &'static str {
        "google"
    }

    fn sign_in_url(&self, state: &str) -> Url {
        let mut url = self.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", self.redirect_uri.as_str())
            .append_pair("scope", &self.scope)
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("state", state);
        url
    }

    async fn redeem(&self, code: &str) -> ProviderResult<Redemption> {
        let tokens = self
            .token_request(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
            ])
            .await?;

        let id_token = tokens.id_token.clone().ok_or_else(|| {
            ProviderError::new(
                ProviderErrorKind::InvalidResponse,
                "token response missing id_token".to_string(),
            )
        })?;
        let claims = decode_id_token(&id_token)?;
        let refresh_token = tokens.refresh_token.ok_or_else(|| {
            ProviderError::new(
                ProviderErrorKind::InvalidResponse,
                "token response missing refresh_token; offline access not granted".to_string(),
            )
        })?;

        Ok(Redemption {
            email: claims.email,
            user: claims.sub,
            access_token: tokens.access_token,
            refresh_token,
            id_token: Some(id_token),
            expires_in: tokens.expires_in,
        })
    }

    async fn refresh(&self, refresh_token: &str) -> ProviderResult<RefreshedTokens> {
        let tokens = self
            .token_request(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .await?;
        Ok(RefreshedTokens {
            access_token: tokens.access_token,
            expires_in: tokens.expires_in,
        })
    }

    async fn revoke(&self, _access_token: &str, refresh_token: &str) -> ProviderResult<()> {
        let response = self
            .http
            .post(self.revoke_url.clone())
            .form(&[("token", refresh_token)])
            .send()
            .await
            .map_err(|err| ProviderError::transport(err.to_string()))?;

        let status = response.status();
        // 400 means the token is already dead, which is the state we want.
        if status.is_success() || status == reqwest::StatusCode::BAD_REQUEST {
            Ok(())
        } else if status.is_server_error() {
            Err(ProviderError::transport(format!(
                "revoke endpoint returned {status}"
            )))
        } else {
            Err(ProviderError::new(
                ProviderErrorKind::InvalidResponse,
                format!("revoke endpoint returned {status}"),
            ))
        }
    }

    async fn validate(&self, access_token: &str) -> ProviderResult<bool> {
        let mut url = self.validate_url.clone();
        url.query_pairs_mut()
            .append_pair("access_token", access_token);
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| ProviderError::transport(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(true)
        } else if status.is_client_error() {
            Ok(false)
        } else {
            Err(ProviderError::transport(format!(
                "tokeninfo endpoint returned {status}"
            )))
        }
    }

    async fn user_profile(&self, access_token: &str) -> ProviderResult<Profile> {
        let response = self
            .http
            .get(self.userinfo_url.clone())
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|err| ProviderError::transport(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::new(
                ProviderErrorKind::TokenRevoked,
                format!("userinfo endpoint returned {}", response.status()),
            ));
        }
        let claims: IdClaims = response
            .json()
            .await
            .map_err(|err| ProviderError::new(ProviderErrorKind::InvalidResponse, err.to_string()))?;
        Ok(Profile {
            email: claims.email,
            user: claims.sub,
        })
    }

    async fn group_membership(
        &self,
        email: &str,
        allowed: &BTreeSet<String>,
    ) -> ProviderResult<BTreeSet<String>> {
        match &self.groups_cache {
            Some(cache) => Ok(cache.groups_for(email, allowed)),
            None => Err(ProviderError::new(
                ProviderErrorKind::Unsupported,
                "directory enumeration not configured".to_string(),
            )),
        }
    }
}

fn static_url(value: &str) -> Url {
    Url::parse(value).expect("static provider url")
}

fn join(base: &Url, path: &str) -> Url {
    base.join(path).expect("provider base url join")
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

#[derive(Debug, Deserialize)]
struct IdClaims {
    email: String,
    sub: String,
}

/// Extract profile claims from the id_token payload. The token arrived over
/// TLS directly from Google's token endpoint, so its signature is not
/// re-verified here.
fn decode_id_token(id_token: &str) -> ProviderResult<IdClaims> {
    let payload = id_token.split('.').nth(1).ok_or_else(|| {
        ProviderError::new(
            ProviderErrorKind::InvalidResponse,
            "id_token is not a JWT".to_string(),
        )
    })?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.as_bytes()).map_err(|_| {
        ProviderError::new(
            ProviderErrorKind::InvalidResponse,
            "id_token payload is not valid base64".to_string(),
        )
    })?;
    serde_json::from_slice(&bytes)
        .map_err(|err| ProviderError::new(ProviderErrorKind::InvalidResponse, err.to_string()))
}

/// Admin-impersonating directory client used to enumerate every group in
/// the organization for the fill cache.
pub struct GoogleDirectory {
    http: reqwest::Client,
    admin_email: String,
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    directory_base: Url,
}

#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    pub token_uri: String,
}

impl GoogleDirectory {
    pub fn from_key_file(
        http: reqwest::Client,
        path: &Path,
        admin_email: String,
    ) -> Result<Self, ProviderError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ProviderError::new(
                ProviderErrorKind::Configuration,
                format!("invalid Google credentials file {}: {err}", path.display()),
            )
        })?;
        let key: ServiceAccountKey = serde_json::from_str(&raw).map_err(|err| {
            ProviderError::new(
                ProviderErrorKind::Configuration,
                format!("malformed service account key: {err}"),
            )
        })?;
        Self::new(http, key, admin_email)
    }

    pub fn new(
        http: reqwest::Client,
        key: ServiceAccountKey,
        admin_email: String,
    ) -> Result<Self, ProviderError> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|err| {
            ProviderError::new(
                ProviderErrorKind::Configuration,
                format!("service account private key rejected: {err}"),
            )
        })?;
        Ok(Self {
            http,
            admin_email,
            key,
            encoding_key,
            directory_base: static_url("https://admin.googleapis.com"),
        })
    }

    #[doc(hidden)]
    pub fn with_directory_base(mut self, base: Url) -> Self {
        self.directory_base = base;
        self
    }

    /// Enumerate every group and its members, for the fill cache.
    pub async fn enumerate(&self) -> ProviderResult<GroupMembers> {
        let token = self.directory_token().await?;
        let mut members = GroupMembers::new();
        for group in self.list_groups(&token).await? {
            let emails = self.list_members(&token, &group).await?;
            members.insert(group, emails);
        }
        Ok(members)
    }

    async fn directory_token(&self) -> ProviderResult<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let claims = GrantClaims {
            iss: &self.key.client_email,
            sub: &self.admin_email,
            aud: &self.key.token_uri,
            scope: DIRECTORY_SCOPE,
            iat: now,
            exp: now + 3600,
        };
        let assertion = jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &self.encoding_key,
        )
        .map_err(|err| {
            ProviderError::new(ProviderErrorKind::Configuration, err.to_string())
        })?;

        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|err| ProviderError::transport(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::transport(format!(
                "service account grant returned {}",
                response.status()
            )));
        }
        let grant: GrantResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::new(ProviderErrorKind::InvalidResponse, err.to_string()))?;
        Ok(grant.access_token)
    }

    async fn list_groups(&self, token: &str) -> ProviderResult<Vec<String>> {
        let mut groups = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = join(&self.directory_base, "admin/directory/v1/groups");
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("customer", "my_customer");
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }
            let page: GroupsPage = self.directory_get(url, token).await?;
            groups.extend(page.groups.into_iter().map(|g| g.email));
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => return Ok(groups),
            }
        }
    }

    async fn list_members(&self, token: &str, group: &str) -> ProviderResult<BTreeSet<String>> {
        let mut members = BTreeSet::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = join(
                &self.directory_base,
                &format!("admin/directory/v1/groups/{group}/members"),
            );
            if let Some(token) = &page_token {
                url.query_pairs_mut().append_pair("pageToken", token);
            }
            let page: MembersPage = self.directory_get(url, token).await?;
            members.extend(
                page.members
                    .into_iter()
                    .filter_map(|m| m.email)
                    .map(|email| email.to_ascii_lowercase()),
            );
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => return Ok(members),
            }
        }
    }

    async fn directory_get<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        token: &str,
    ) -> ProviderResult<T> {
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| ProviderError::transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ProviderError::transport(format!(
                "directory API returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|err| ProviderError::new(ProviderErrorKind::InvalidResponse, err.to_string()))
    }
}

#[derive(Serialize)]
struct GrantClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    scope: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct GrantResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct GroupsPage {
    #[serde(default)]
    groups: Vec<GroupEntry>,
    #[serde(default, rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct GroupEntry {
    email: String,
}

#[derive(Deserialize)]
struct MembersPage {
    #[serde(default)]
    members: Vec<MemberEntry>,
    #[serde(default, rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct MemberEntry {
    #[serde(default)]
    email: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_in_url_requests_offline_access() {
        let provider = GoogleProvider::new(
            reqwest::Client::new(),
            "client".into(),
            "secret".into(),
            Url::parse("https://auth.example.com/callback").unwrap(),
            None,
        )
        .expect("provider");

        let url = provider.sign_in_url("state.abc.def");
        let query: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query.get("access_type"), Some(&"offline".to_string()));
        assert_eq!(query.get("prompt"), Some(&"consent".to_string()));
        assert_eq!(query.get("state"), Some(&"state.abc.def".to_string()));
        assert_eq!(
            query.get("redirect_uri"),
            Some(&"https://auth.example.com/callback".to_string())
        );
    }

    #[test]
    fn id_token_payload_is_decoded_without_verification() {
        let payload = URL_SAFE_NO_PAD
            .encode(serde_json::json!({"email": "a@corp.example.com", "sub": "uid-9"}).to_string());
        let token = format!("eyJhbGciOiJSUzI1NiJ9.{payload}.sig");
        let claims = decode_id_token(&token).expect("claims");
        assert_eq!(claims.email, "a@corp.example.com");
        assert_eq!(claims.sub, "uid-9");
    }

    #[test]
    fn garbage_id_token_is_invalid_response() {
        let err = decode_id_token("not-a-jwt").expect_err("invalid");
        assert_eq!(err.kind(), ProviderErrorKind::InvalidResponse);
    }
}
