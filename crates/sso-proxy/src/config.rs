use std::collections::BTreeSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use sso_core::config::EnvReader;
use sso_core::session::SessionTtls;
use sso_core::validator::EmailValidator;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration:\n  {}", messages.join("\n  "))]
    Invalid { messages: Vec<String> },
    #[error("failed to read upstream config {path}: {reason}")]
    UpstreamFile { path: String, reason: String },
    #[error("invalid upstream config: {0}")]
    Upstream(String),
}

/// Proxy settings, bound from the environment through the explicit mapping
/// in `from_lookup`. Immutable after validation.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,

    pub provider_url: Url,
    pub proxy_client_id: String,
    pub proxy_client_secret: String,

    pub email_domains: Vec<String>,
    pub email_addresses: Vec<String>,

    pub cookie_name: String,
    pub cookie_secret: Vec<u8>,
    pub cookie_secret_fallback: Option<Vec<u8>>,
    pub cookie_domain: Option<String>,
    pub cookie_expire: Duration,
    pub cookie_refresh: Duration,
    pub cookie_secure: bool,
    pub cookie_http_only: bool,

    pub upstream_configs: Option<PathBuf>,

    pub request_signing_key: Option<Vec<u8>>,
    pub request_signing_key_id: String,

    pub session_lifetime_ttl: Duration,
    pub session_valid_ttl: Duration,
    pub grace_period: Duration,

    pub request_timeout: Duration,
    pub tcp_read_timeout: Duration,
    pub tcp_write_timeout: Duration,

    pub statsd_host: Option<String>,
    pub statsd_port: Option<u16>,
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, ConfigError> {
        let mut reader = EnvReader::new(&lookup);

        let host = reader.string("HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port = reader.parsed("PORT", 4180);
        let provider_url = reader.url("PROVIDER_URL", true);
        let proxy_client_id = reader.required("PROXY_CLIENT_ID");
        let proxy_client_secret = reader.required("PROXY_CLIENT_SECRET");
        let email_domains = reader.list("EMAIL_DOMAIN");
        let email_addresses = reader.list("EMAIL_ADDRESSES");
        let cookie_name = reader
            .string("COOKIE_NAME")
            .unwrap_or_else(|| "_sso_proxy".into());
        let cookie_secret = reader.sealing_secret("COOKIE_SECRET", true);
        let cookie_secret_fallback = reader.sealing_secret("COOKIE_SECRET_FALLBACK", false);
        let cookie_domain = reader.string("COOKIE_DOMAIN");
        let cookie_expire = reader.duration("COOKIE_EXPIRE", "168h");
        let cookie_refresh = reader.duration("COOKIE_REFRESH", "1h");
        let cookie_secure = reader.boolean("COOKIE_SECURE", true);
        let cookie_http_only = reader.boolean("COOKIE_HTTP_ONLY", true);
        let upstream_configs = reader.string("UPSTREAM_CONFIGS").map(PathBuf::from);
        let request_signing_key = {
            let key = reader.sealing_secret("REQUEST_SIGNING_KEY", false);
            if key.is_empty() { None } else { Some(key) }
        };
        let request_signing_key_id = reader
            .string("REQUEST_SIGNING_KEY_ID")
            .unwrap_or_else(|| "sso-proxy-1".into());
        let session_lifetime_ttl = reader.duration("SESSION_LIFETIME_TTL", "720h");
        let session_valid_ttl = reader.duration("SESSION_VALID_TTL", "60s");
        let grace_period = reader.duration("PROVIDER_GRACE_PERIOD", "4h");
        let request_timeout = reader.duration("REQUEST_TIMEOUT", "2s");
        let tcp_read_timeout = reader.duration("TCP_READ_TIMEOUT", "30s");
        let tcp_write_timeout = reader.duration("TCP_WRITE_TIMEOUT", "30s");
        let statsd_host = reader.string("STATSD_HOST");
        let statsd_port = reader.optional_parsed::<u16>("STATSD_PORT");

        if email_domains.is_empty() && email_addresses.is_empty() {
            reader.fail(
                "missing setting for email validation: EMAIL_DOMAIN or EMAIL_ADDRESSES required \
                 (use EMAIL_DOMAIN=* to authorize all email addresses)",
            );
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
            provider_url: provider_url
                .unwrap_or_else(|| Url::parse("http://invalid.localhost/").expect("static url")),
            proxy_client_id,
            proxy_client_secret,
            email_domains,
            email_addresses,
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
            upstream_configs,
            request_signing_key,
            request_signing_key_id,
            session_lifetime_ttl,
            session_valid_ttl,
            grace_period,
            request_timeout,
            tcp_read_timeout,
            tcp_write_timeout,
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
}

/// How a host is matched and where its traffic goes.
#[derive(Clone, Debug)]
pub enum Route {
    /// Exact host match, fixed target.
    Simple(Url),
    /// Regex host match; the target is the template with capture groups
    /// substituted.
    Rewrite { pattern: Regex, template: String },
}

/// One protected upstream, compiled from the YAML entry. Immutable after
/// startup.
#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    pub from: String,
    pub route: Route,
    pub skip_auth: Vec<Regex>,
    pub skip_request_signing: bool,
    pub allowed_groups: BTreeSet<String>,
    pub validator_override: Option<EmailValidator>,
    pub pass_host_header: bool,
    pub pass_user_headers: bool,
    pub pass_access_token: bool,
    pub set_xauth_request: bool,
    pub inject_headers: Vec<(String, String)>,
    pub timeout: Duration,
    pub cookie_name: Option<String>,
}

#[derive(Deserialize)]
struct RawUpstream {
    from: String,
    to: String,
    #[serde(default)]
    kind: RawRouteKind,
    #[serde(default)]
    options: RawOptions,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum RawRouteKind {
    #[default]
    Simple,
    Rewrite,
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOptions {
    #[serde(default)]
    skip_auth_regex: Vec<String>,
    #[serde(default)]
    skip_request_signing: bool,
    #[serde(default)]
    allowed_email_domains: Vec<String>,
    #[serde(default)]
    allowed_email_addresses: Vec<String>,
    #[serde(default)]
    allowed_groups: Vec<String>,
    #[serde(default)]
    pass_host_header: Option<bool>,
    #[serde(default)]
    pass_user_headers: Option<bool>,
    #[serde(default)]
    pass_access_token: bool,
    #[serde(default)]
    set_xauth_request: bool,
    #[serde(default)]
    inject_request_headers: Vec<RawHeader>,
    #[serde(default)]
    timeout: Option<String>,
    #[serde(default)]
    cookie_name: Option<String>,
}

#[derive(Deserialize)]
struct RawHeader {
    name: String,
    value: String,
}

pub fn load_upstreams(
    path: &Path,
    default_timeout: Duration,
) -> Result<Vec<UpstreamConfig>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::UpstreamFile {
        path: path.display().to_string(),
        reason: err.to_string(),
    })?;
    parse_upstreams(&raw, default_timeout)
}

pub fn parse_upstreams(
    yaml: &str,
    default_timeout: Duration,
) -> Result<Vec<UpstreamConfig>, ConfigError> {
    let raw: Vec<RawUpstream> =
        serde_yaml_bw::from_str(yaml).map_err(|err| ConfigError::Upstream(err.to_string()))?;
    if raw.is_empty() {
        return Err(ConfigError::Upstream("no upstreams configured".to_string()));
    }
    raw.into_iter()
        .map(|upstream| compile_upstream(upstream, default_timeout))
        .collect()
}

fn compile_upstream(
    raw: RawUpstream,
    default_timeout: Duration,
) -> Result<UpstreamConfig, ConfigError> {
    let route = match raw.kind {
        RawRouteKind::Simple => {
            let to = Url::parse(&raw.to).map_err(|err| {
                ConfigError::Upstream(format!("invalid to-url {:?}: {err}", raw.to))
            })?;
            Route::Simple(to)
        }
        RawRouteKind::Rewrite => {
            let pattern = Regex::new(&raw.from).map_err(|err| {
                ConfigError::Upstream(format!("invalid from-pattern {:?}: {err}", raw.from))
            })?;
            Route::Rewrite {
                pattern,
                template: raw.to.clone(),
            }
        }
    };

    let skip_auth = raw
        .options
        .skip_auth_regex
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|err| {
                ConfigError::Upstream(format!("invalid skip_auth_regex {pattern:?}: {err}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let validator_override = if raw.options.allowed_email_addresses.is_empty()
        && raw.options.allowed_email_domains.is_empty()
    {
        None
    } else {
        Some(EmailValidator::from_config(
            &raw.options.allowed_email_addresses,
            &raw.options.allowed_email_domains,
        ))
    };

    let timeout = match &raw.options.timeout {
        Some(value) => sso_core::config::parse_duration(value).map_err(|err| {
            ConfigError::Upstream(format!("invalid timeout for {:?}: {err}", raw.from))
        })?,
        None => default_timeout,
    };

    Ok(UpstreamConfig {
        from: raw.from,
        route,
        skip_auth,
        skip_request_signing: raw.options.skip_request_signing,
        allowed_groups: raw.options.allowed_groups.into_iter().collect(),
        validator_override,
        pass_host_header: raw.options.pass_host_header.unwrap_or(true),
        pass_user_headers: raw.options.pass_user_headers.unwrap_or(true),
        pass_access_token: raw.options.pass_access_token,
        set_xauth_request: raw.options.set_xauth_request,
        inject_headers: raw
            .options
            .inject_request_headers
            .into_iter()
            .map(|header| (header.name, header.value))
            .collect(),
        timeout,
        cookie_name: raw.options.cookie_name,
    })
}
