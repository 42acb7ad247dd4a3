use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use sso_core::provider::{Profile, Provider, ProviderResult, Redemption};
use sso_core::session::RefreshedTokens;
use sso_core::singleflight::SingleFlight;
use url::Url;

/// Coalesces concurrent identical provider calls so a thundering herd of
/// requests (post-restart validation storms, simultaneous refreshes for the
/// same user) produces a single upstream call. Wraps any provider variant,
/// outermost in the decorator chain.
pub struct SingleFlightProvider {
    inner: Arc<dyn Provider>,
    redeem: SingleFlight<ProviderResult<Redemption>>,
    refresh: SingleFlight<ProviderResult<RefreshedTokens>>,
    revoke: SingleFlight<ProviderResult<()>>,
    validate: SingleFlight<ProviderResult<bool>>,
    profile: SingleFlight<ProviderResult<Profile>>,
    groups: SingleFlight<ProviderResult<BTreeSet<String>>>,
}

impl SingleFlightProvider {
    pub fn new(inner: Arc<dyn Provider>) -> Self {
        Self {
            inner,
            redeem: SingleFlight::new(),
            refresh: SingleFlight::new(),
            revoke: SingleFlight::new(),
            validate: SingleFlight::new(),
            profile: SingleFlight::new(),
            groups: SingleFlight::new(),
        }
    }
}

#[async_trait]
impl Provider for SingleFlightProvider {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    fn sign_in_url(&self, state: &str) -> Url {
        self.inner.sign_in_url(state)
    }

    async fn redeem(&self, code: &str) -> ProviderResult<Redemption> {
        let inner = Arc::clone(&self.inner);
        let owned = code.to_string();
        self.redeem
            .run(code, async move { inner.redeem(&owned).await })
            .await
    }

    async fn refresh(&self, refresh_token: &str) -> ProviderResult<RefreshedTokens> {
        let inner = Arc::clone(&self.inner);
        let token = refresh_token.to_string();
        self.refresh
            .run(refresh_token, async move { inner.refresh(&token).await })
            .await
    }

    async fn revoke(&self, access_token: &str, refresh_token: &str) -> ProviderResult<()> {
        let inner = Arc::clone(&self.inner);
        let access = access_token.to_string();
        let refresh = refresh_token.to_string();
        let key = format!("{access_token}\n{refresh_token}");
        self.revoke
            .run(&key, async move { inner.revoke(&access, &refresh).await })
            .await
    }

    async fn validate(&self, access_token: &str) -> ProviderResult<bool> {
        let inner = Arc::clone(&self.inner);
        let token = access_token.to_string();
        self.validate
            .run(access_token, async move { inner.validate(&token).await })
            .await
    }

    async fn user_profile(&self, access_token: &str) -> ProviderResult<Profile> {
        let inner = Arc::clone(&self.inner);
        let token = access_token.to_string();
        self.profile
            .run(access_token, async move { inner.user_profile(&token).await })
            .await
    }

    async fn group_membership(
        &self,
        email: &str,
        allowed: &BTreeSet<String>,
    ) -> ProviderResult<BTreeSet<String>> {
        let inner = Arc::clone(&self.inner);
        let owned_email = email.to_string();
        let owned_allowed = allowed.clone();
        let mut key = owned_email.clone();
        for group in allowed {
            key.push('\n');
            key.push_str(group);
        }
        self.groups
            .run(&key, async move {
                inner.group_membership(&owned_email, &owned_allowed).await
            })
            .await
    }
}
