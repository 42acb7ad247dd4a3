use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The only server-authoritative record of a logged-in user. Stored inside
/// the sealed cookie, never persisted server-side.
///
/// Deadline invariant at mint time: `valid <= refresh <= lifetime`. The
/// lifetime deadline never advances for a session without a full re-auth.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub email: String,
    pub user: String,
    pub groups: BTreeSet<String>,
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub lifetime_deadline: u64,
    pub refresh_deadline: u64,
    pub valid_deadline: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period_start: Option<u64>,
}

/// TTLs used to position the three deadlines relative to "now".
#[derive(Clone, Copy, Debug)]
pub struct SessionTtls {
    pub lifetime: Duration,
    pub refresh: Duration,
    pub valid: Duration,
}

impl SessionTtls {
    pub fn new(lifetime: Duration, refresh: Duration, valid: Duration) -> Self {
        Self {
            lifetime,
            refresh,
            valid,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// All deadlines in the future; no external call needed.
    Fresh,
    /// The access token must be re-validated before use. `refresh_due`
    /// reports whether the refresh deadline has also passed; validation
    /// still runs first, and refresh only if validation fails.
    NeedsValidation { refresh_due: bool },
    /// Past the lifetime deadline; unconditionally invalid.
    LifetimeExpired,
}

impl SessionState {
    /// Mint a fresh session. The email is canonicalized to lowercase.
    pub fn mint(
        email: &str,
        user: &str,
        groups: BTreeSet<String>,
        access_token: String,
        refresh_token: String,
        id_token: Option<String>,
        ttls: &SessionTtls,
        now: u64,
    ) -> Self {
        Self {
            email: email.to_ascii_lowercase(),
            user: user.to_string(),
            groups,
            access_token,
            refresh_token,
            id_token,
            lifetime_deadline: now + ttls.lifetime.as_secs(),
            refresh_deadline: now + ttls.refresh.as_secs(),
            valid_deadline: now + ttls.valid.as_secs(),
            grace_period_start: None,
        }
    }

    pub fn status(&self, now: u64) -> SessionStatus {
        if now > self.lifetime_deadline {
            return SessionStatus::LifetimeExpired;
        }
        if now > self.valid_deadline {
            return SessionStatus::NeedsValidation {
                refresh_due: now > self.refresh_deadline,
            };
        }
        SessionStatus::Fresh
    }
}

/// Tokens returned by a successful refresh.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefreshedTokens {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

/// Errors surfaced by a session authority. Transient failures may be ridden
/// out within the grace period; rejections end the session.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error("transient authority failure: {0}")]
    Transient(String),
    #[error("token rejected: {0}")]
    Rejected(String),
}

/// The external calls the state machine may need: token validation and token
/// refresh. The authenticator backs this with its provider; the proxy backs
/// it with the authenticator's back channel.
#[async_trait]
pub trait SessionAuthority: Send + Sync {
    async fn validate(&self, access_token: &str) -> Result<bool, AuthorityError>;
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, AuthorityError>;
}

/// Outcome of driving the state machine for one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Session usable as-is; no cookie write needed.
    Unchanged,
    /// Session usable; deadlines or tokens changed, rewrite the cookie once.
    Updated,
    /// Session ended; clear the cookie and force a full re-auth.
    Expired,
}

/// Drive the session transitions that need external calls.
///
/// Validation takes precedence over refresh when both are due; refresh is
/// attempted only when validation fails. A transient authority failure
/// within the grace window lets the stale session continue and records
/// `grace_period_start`; past the window the error propagates to the caller
/// (which maps it to a 502).
pub async fn revalidate<A: SessionAuthority + ?Sized>(
    state: &mut SessionState,
    authority: &A,
    ttls: &SessionTtls,
    grace_period: Duration,
    now: u64,
) -> Result<Verdict, AuthorityError> {
    match state.status(now) {
        SessionStatus::LifetimeExpired => Ok(Verdict::Expired),
        SessionStatus::Fresh => Ok(Verdict::Unchanged),
        SessionStatus::NeedsValidation { refresh_due } => {
            match authority.validate(&state.access_token).await {
                Ok(true) => {
                    state.valid_deadline = now + ttls.valid.as_secs();
                    state.grace_period_start = None;
                    Ok(Verdict::Updated)
                }
                Ok(false) => {
                    if refresh_due {
                        attempt_refresh(state, authority, ttls, grace_period, now).await
                    } else {
                        Ok(Verdict::Expired)
                    }
                }
                Err(AuthorityError::Rejected(_)) => {
                    if refresh_due {
                        attempt_refresh(state, authority, ttls, grace_period, now).await
                    } else {
                        Ok(Verdict::Expired)
                    }
                }
                Err(AuthorityError::Transient(message)) => {
                    continue_within_grace(state, grace_period, now, message)
                }
            }
        }
    }
}

async fn attempt_refresh<A: SessionAuthority + ?Sized>(
    state: &mut SessionState,
    authority: &A,
    ttls: &SessionTtls,
    grace_period: Duration,
    now: u64,
) -> Result<Verdict, AuthorityError> {
    match authority.refresh(&state.refresh_token).await {
        Ok(tokens) => {
            state.access_token = tokens.access_token;
            // Lifetime never advances without a full re-auth.
            state.refresh_deadline = (now + ttls.refresh.as_secs()).min(state.lifetime_deadline);
            state.valid_deadline = (now + ttls.valid.as_secs()).min(state.refresh_deadline);
            state.grace_period_start = None;
            Ok(Verdict::Updated)
        }
        Err(AuthorityError::Rejected(_)) => Ok(Verdict::Expired),
        Err(AuthorityError::Transient(message)) => {
            continue_within_grace(state, grace_period, now, message)
        }
    }
}

fn continue_within_grace(
    state: &mut SessionState,
    grace_period: Duration,
    now: u64,
    message: String,
) -> Result<Verdict, AuthorityError> {
    match state.grace_period_start {
        None => {
            state.grace_period_start = Some(now);
            Ok(Verdict::Updated)
        }
        Some(start) if now.saturating_sub(start) <= grace_period.as_secs() => {
            Ok(Verdict::Unchanged)
        }
        Some(_) => Err(AuthorityError::Transient(message)),
    }
}
