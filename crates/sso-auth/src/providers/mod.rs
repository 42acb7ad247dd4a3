pub mod google;
pub mod group_cache;
pub mod okta;
pub mod single_flight;

use std::sync::Arc;

use sso_core::provider::{Provider, ProviderError, ProviderErrorKind};

use crate::config::{AuthConfig, ProviderKind};
use crate::groups::FillCache;
pub use google::{GoogleDirectory, GoogleProvider};
pub use group_cache::GroupCacheProvider;
pub use okta::OktaProvider;
pub use single_flight::SingleFlightProvider;

/// Assemble the provider chain for the configured variant.
///
/// Google gets the directory-backed fill cache (when admin credentials are
/// configured); Okta gets the on-demand group cache. Both are wrapped in the
/// single-flight decorator. The returned cache handle, when present, must be
/// stopped at shutdown.
pub fn build(
    config: &AuthConfig,
    http: reqwest::Client,
) -> Result<(Arc<dyn Provider>, Option<Arc<FillCache>>), ProviderError> {
    match config.provider {
        ProviderKind::Google => {
            let mut provider = GoogleProvider::new(
                http.clone(),
                config.client_id.clone(),
                config.client_secret.clone(),
                config.redirect_url.clone(),
                config.scope.clone(),
            )?;

            let cache = match (&config.google_service_account_json, &config.google_admin_email) {
                (Some(key_path), Some(admin_email)) => {
                    let directory = Arc::new(GoogleDirectory::from_key_file(
                        http,
                        key_path,
                        admin_email.clone(),
                    )?);
                    let cache = FillCache::new();
                    cache.spawn_refill(
                        move || {
                            let directory = Arc::clone(&directory);
                            async move { directory.enumerate().await }
                        },
                        config.groups_cache_refresh_ttl,
                    );
                    provider = provider.with_groups_cache(Arc::clone(&cache));
                    Some(cache)
                }
                (None, None) => None,
                _ => {
                    return Err(ProviderError::new(
                        ProviderErrorKind::Configuration,
                        "GOOGLE_ADMIN_EMAIL and GOOGLE_SERVICE_ACCOUNT_JSON must be set together"
                            .to_string(),
                    ));
                }
            };

            let provider: Arc<dyn Provider> =
                Arc::new(SingleFlightProvider::new(Arc::new(provider)));
            Ok((provider, cache))
        }
        ProviderKind::Okta => {
            let org_url = config.okta_org_url.clone().ok_or_else(|| {
                ProviderError::new(
                    ProviderErrorKind::Configuration,
                    "OKTA_ORG_URL is required when PROVIDER=okta".to_string(),
                )
            })?;
            let okta = OktaProvider::new(
                http,
                org_url,
                config.provider_server_id.clone(),
                config.client_id.clone(),
                config.client_secret.clone(),
                config.redirect_url.clone(),
                config.scope.clone(),
                config.okta_api_token.clone(),
            )?;
            let cached = GroupCacheProvider::new(
                Arc::new(okta),
                config.group_cache_provider_ttl,
                config.grace_period,
            );
            let provider: Arc<dyn Provider> =
                Arc::new(SingleFlightProvider::new(Arc::new(cached)));
            Ok((provider, None))
        }
    }
}
