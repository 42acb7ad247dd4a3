use std::env;
use std::path::PathBuf;
use std::time::Duration;

use sso_core::config::EnvReader;
use sso_core::session::SessionTtls;
use url::Url;

/// Which upstream identity provider the authenticator speaks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    Google,
    Okta,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration:\n  {}", messages.join("\n  "))]
    Invalid { messages: Vec<String> },
}

/// Authenticator settings, bound from the environment through the explicit
/// mapping in `from_lookup`. Immutable after validation.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub host: String,
    pub port: u16,

    pub redirect_url: Url,
    pub client_id: String,
    pub client_secret: String,
    pub proxy_client_id: String,
    pub proxy_client_secret: String,

    pub email_domains: Vec<String>,
    pub email_addresses: Vec<String>,
    pub proxy_root_domains: Vec<String>,

    pub provider: ProviderKind,
    pub okta_org_url: Option<Url>,
    pub provider_server_id: String,
    pub okta_api_token: Option<String>,
    pub google_admin_email: Option<String>,
    pub google_service_account_json: Option<PathBuf>,
    pub scope: Option<String>,

    pub cookie_name: String,
    pub cookie_secret: Vec<u8>,
    pub cookie_secret_fallback: Option<Vec<u8>>,
    pub cookie_domain: Option<String>,
    pub cookie_expire: Duration,
    pub cookie_refresh: Duration,
    pub cookie_secure: bool,
    pub cookie_http_only: bool,

    pub auth_code_secret: Vec<u8>,

    pub session_lifetime_ttl: Duration,
    pub session_valid_ttl: Duration,
    pub grace_period: Duration,

    pub request_timeout: Duration,
    pub tcp_read_timeout: Duration,
    pub tcp_write_timeout: Duration,

    pub group_cache_provider_ttl: Duration,
    pub groups_cache_refresh_ttl: Duration,

    pub skip_provider_button: bool,

    pub statsd_host: Option<String>,
    pub statsd_port: Option<u16>,
}

impl AuthConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Explicit env-name to field mapping; every variable the service honors
    /// is named here, nowhere else.
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, ConfigError> {
        let mut reader = EnvReader::new(&lookup);

        let host = reader.string("HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port = reader.parsed("PORT", 4180);
        let redirect_url = reader.url("REDIRECT_URL", true);
        let client_id = reader.required("CLIENT_ID");
        let client_secret = reader.required("CLIENT_SECRET");
        let proxy_client_id = reader.required("PROXY_CLIENT_ID");
        let proxy_client_secret = reader.required("PROXY_CLIENT_SECRET");
        let email_domains = reader.list("EMAIL_DOMAIN");
        let email_addresses = reader.list("EMAIL_ADDRESSES");
        let proxy_root_domains = reader.list("PROXY_ROOT_DOMAIN");
        let provider_raw = reader.string("PROVIDER").unwrap_or_else(|| "google".into());
        let okta_org_url = reader.url("OKTA_ORG_URL", false);
        let provider_server_id = reader
            .string("PROVIDER_SERVER_ID")
            .unwrap_or_else(|| "default".into());
        let okta_api_token = reader.string("OKTA_API_TOKEN");
        let google_admin_email = reader.string("GOOGLE_ADMIN_EMAIL");
        let google_service_account_json = reader
            .string("GOOGLE_SERVICE_ACCOUNT_JSON")
            .map(PathBuf::from);
        let scope = reader.string("SCOPE");
        let cookie_name = reader
            .string("COOKIE_NAME")
            .unwrap_or_else(|| "_sso_auth".into());
        let cookie_secret = reader.sealing_secret("COOKIE_SECRET", true);
        let cookie_secret_fallback = reader.sealing_secret("COOKIE_SECRET_FALLBACK", false);
        let cookie_domain = reader.string("COOKIE_DOMAIN");
        let cookie_expire = reader.duration("COOKIE_EXPIRE", "168h");
        let cookie_refresh = reader.duration("COOKIE_REFRESH", "1h");
        let cookie_secure = reader.boolean("COOKIE_SECURE", true);
        let cookie_http_only = reader.boolean("COOKIE_HTTP_ONLY", true);
        let auth_code_secret = reader.sealing_secret("AUTH_CODE_SECRET", true);
        let session_lifetime_ttl = reader.duration("SESSION_LIFETIME_TTL", "720h");
        let session_valid_ttl = reader.duration("SESSION_VALID_TTL", "60s");
        let grace_period = reader.duration("PROVIDER_GRACE_PERIOD", "4h");
        let request_timeout = reader.duration("REQUEST_TIMEOUT", "2s");
        let tcp_read_timeout = reader.duration("TCP_READ_TIMEOUT", "30s");
        let tcp_write_timeout = reader.duration("TCP_WRITE_TIMEOUT", "30s");
        let group_cache_provider_ttl = reader.duration("GROUP_CACHE_PROVIDER_TTL", "10m");
        let groups_cache_refresh_ttl = reader.duration("GROUPS_CACHE_REFRESH_TTL", "10m");
        let skip_provider_button = reader.boolean("SKIP_PROVIDER_BUTTON", false);
        let statsd_host = reader.string("STATSD_HOST");
        let statsd_port = reader.optional_parsed::<u16>("STATSD_PORT");

        let provider = match provider_raw.as_str() {
            "google" => ProviderKind::Google,
            "okta" => ProviderKind::Okta,
            other => {
                reader.fail(format!("unimplemented provider: {other:?}"));
                ProviderKind::Google
            }
        };

        if email_domains.is_empty() && email_addresses.is_empty() {
            reader.fail(
                "missing setting for email validation: EMAIL_DOMAIN or EMAIL_ADDRESSES required \
                 (use EMAIL_DOMAIN=* to authorize all email addresses)",
            );
        }
        if proxy_root_domains.is_empty() {
            reader.fail("missing setting: PROXY_ROOT_DOMAIN");
        }
        if provider == ProviderKind::Okta && okta_org_url.is_none() {
            reader.fail("missing setting: OKTA_ORG_URL is required when PROVIDER=okta");
        }
        if cookie_refresh >= cookie_expire {
            reader.fail(format!(
                "COOKIE_REFRESH ({cookie_refresh:?}) must be less than COOKIE_EXPIRE ({cookie_expire:?})"
            ));
        }

        reader
            .finish()
            .map_err(|messages| ConfigError::Invalid { messages })?;

        Ok(Self {
            host,
            port,
            redirect_url: redirect_url.unwrap_or_else(placeholder_url),
            client_id,
            client_secret,
            proxy_client_id,
            proxy_client_secret,
            email_domains,
            email_addresses,
            proxy_root_domains,
            provider,
            okta_org_url,
            provider_server_id,
            okta_api_token,
            google_admin_email,
            google_service_account_json,
            scope,
            cookie_name,
            cookie_secret,
            cookie_secret_fallback: if cookie_secret_fallback.is_empty() {
                None
            } else {
                Some(cookie_secret_fallback)
            },
            cookie_domain,
            cookie_expire,
            cookie_refresh,
            cookie_secure,
            cookie_http_only,
            auth_code_secret,
            session_lifetime_ttl,
            session_valid_ttl,
            grace_period,
            request_timeout,
            tcp_read_timeout,
            tcp_write_timeout,
            group_cache_provider_ttl,
            groups_cache_refresh_ttl,
            skip_provider_button,
            statsd_host,
            statsd_port,
        })
    }

    pub fn session_ttls(&self) -> SessionTtls {
        SessionTtls::new(
            self.session_lifetime_ttl,
            self.cookie_refresh,
            self.session_valid_ttl,
        )
    }

    /// A redirect target is only honored when its host is one of the
    /// configured proxy root domains or a subdomain of one.
    pub fn redirect_host_allowed(&self, target: &Url) -> bool {
        let host = match target.host_str() {
            Some(host) => host,
            None => return false,
        };
        self.proxy_root_domains.iter().any(|root| {
            let root = root.trim_start_matches('.');
            host == root || host.ends_with(&format!(".{root}"))
        })
    }
}

fn placeholder_url() -> Url {
    Url::parse("http://invalid.localhost/").expect("static url")
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, String> {
        let secret = BASE64_STANDARD.encode([1u8; 32]);
        HashMap::from([
            (
                "REDIRECT_URL",
                "https://auth.example.com/callback".to_string(),
            ),
            ("CLIENT_ID", "client".into()),
            ("CLIENT_SECRET", "secret".into()),
            ("PROXY_CLIENT_ID", "proxy-client".into()),
            ("PROXY_CLIENT_SECRET", "proxy-secret".into()),
            ("EMAIL_DOMAIN", "corp.example.com".into()),
            ("PROXY_ROOT_DOMAIN", "example.com".into()),
            ("COOKIE_SECRET", secret.clone()),
            ("AUTH_CODE_SECRET", secret),
        ])
    }

    fn config_from(env: &HashMap<&'static str, String>) -> Result<AuthConfig, ConfigError> {
        AuthConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_applied() {
        let config = config_from(&base_env()).expect("config");
        assert_eq!(config.port, 4180);
        assert_eq!(config.cookie_name, "_sso_auth");
        assert_eq!(config.cookie_expire, Duration::from_secs(168 * 3600));
        assert_eq!(config.cookie_refresh, Duration::from_secs(3600));
        assert_eq!(config.session_lifetime_ttl, Duration::from_secs(720 * 3600));
        assert_eq!(config.request_timeout, Duration::from_secs(2));
        assert_eq!(config.grace_period, Duration::from_secs(4 * 3600));
        assert!(config.cookie_secure);
        assert_eq!(config.provider, ProviderKind::Google);
    }

    #[test]
    fn thirty_three_byte_cookie_secret_names_the_length() {
        let mut env = base_env();
        env.insert("COOKIE_SECRET", BASE64_STANDARD.encode([1u8; 33]));
        let err = config_from(&env).expect_err("33-byte secret");
        let message = err.to_string();
        assert!(message.contains("32 or 64 bytes"), "{message}");
        assert!(message.contains("decoded to 33 bytes"), "{message}");
    }

    #[test]
    fn refresh_not_less_than_expire_fails() {
        let mut env = base_env();
        env.insert("COOKIE_REFRESH", "168h".into());
        let err = config_from(&env).expect_err("refresh >= expire");
        assert!(err.to_string().contains("must be less than"));
    }

    #[test]
    fn okta_requires_org_url() {
        let mut env = base_env();
        env.insert("PROVIDER", "okta".into());
        let err = config_from(&env).expect_err("okta without org url");
        assert!(err.to_string().contains("OKTA_ORG_URL"));
    }

    #[test]
    fn missing_settings_are_collected_together() {
        let env: HashMap<&'static str, String> = HashMap::new();
        let err = config_from(&env).expect_err("empty env");
        let message = err.to_string();
        for key in [
            "CLIENT_ID",
            "CLIENT_SECRET",
            "COOKIE_SECRET",
            "PROXY_ROOT_DOMAIN",
        ] {
            assert!(message.contains(key), "missing {key} in {message}");
        }
    }

    #[test]
    fn redirect_host_allowed_covers_subdomains_only() {
        let config = config_from(&base_env()).expect("config");
        let ok = Url::parse("https://app.example.com/resource").unwrap();
        let bad = Url::parse("https://evil-example.com/resource").unwrap();
        assert!(config.redirect_host_allowed(&ok));
        assert!(!config.redirect_host_allowed(&bad));
    }
}
