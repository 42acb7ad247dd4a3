use std::collections::BTreeSet;
use std::{error::Error, fmt};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

/// Convenience alias for provider interactions.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Identity and tokens returned when an authorization code is redeemed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Redemption {
    pub email: String,
    pub user: String,
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

/// Basic profile claims resolved from an access token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Profile {
    pub email: String,
    pub user: String,
}

/// Capability set every upstream identity provider must offer.
///
/// Implementations perform network I/O bounded by the request timeout and
/// never retry; retry-by-coalescing happens in the single-flight decorator.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short provider name used in logs and metrics labels.
    fn kind(&self) -> &'static str;

    /// Provider authorization URL carrying the given opaque state.
    fn sign_in_url(&self, state: &str) -> Url;

    /// Exchange an authorization code for tokens and a profile.
    async fn redeem(&self, code: &str) -> ProviderResult<Redemption>;

    /// Refresh an access token.
    async fn refresh(&self, refresh_token: &str) -> ProviderResult<crate::session::RefreshedTokens>;

    /// Revoke the session's tokens at the provider.
    async fn revoke(&self, access_token: &str, refresh_token: &str) -> ProviderResult<()>;

    /// Check whether an access token is still honored by the provider.
    async fn validate(&self, access_token: &str) -> ProviderResult<bool>;

    /// Resolve profile claims for an access token.
    async fn user_profile(&self, access_token: &str) -> ProviderResult<Profile>;

    /// Group memberships for a user, intersected with `allowed` when it is
    /// non-empty. An empty `allowed` set asks for every known membership.
    async fn group_membership(
        &self,
        email: &str,
        allowed: &BTreeSet<String>,
    ) -> ProviderResult<BTreeSet<String>>;
}

/// Error type shared by all provider implementations. `Clone` so results can
/// fan out through the single-flight layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    kind: ProviderErrorKind,
    message: Option<String>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<Option<String>>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transport, message.into())
    }

    pub fn kind(&self) -> ProviderErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Transient errors may be ridden out within the grace period.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ProviderErrorKind::Transport)
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.kind, message),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl Error for ProviderError {}

/// Classification of provider failures, mirroring the error taxonomy the
/// request handlers map to HTTP responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Misconfiguration or an invalid request was issued.
    Configuration,
    /// Timeout, connection failure, or provider 5xx.
    Transport,
    /// The provider rejected the token (`invalid_grant`, `invalid_token`).
    TokenRevoked,
    /// Provider returned an unexpected payload.
    InvalidResponse,
    /// The operation is not supported by this provider.
    Unsupported,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProviderErrorKind::Configuration => "configuration error",
            ProviderErrorKind::Transport => "transport error",
            ProviderErrorKind::TokenRevoked => "token revoked",
            ProviderErrorKind::InvalidResponse => "invalid response",
            ProviderErrorKind::Unsupported => "unsupported operation",
        };
        f.write_str(label)
    }
}
