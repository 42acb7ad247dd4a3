use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sso_core::provider::{Profile, Provider, ProviderResult, Redemption};
use sso_core::session::RefreshedTokens;
use tracing::warn;
use url::Url;

/// On-demand, TTL-bounded memoization of per-user group lookups for
/// providers without enumeration (Okta).
///
/// The cache stores each user's full membership set and intersects per
/// request. A transient fetch failure within the grace window serves the
/// stale entry; past it, the error propagates. Concurrent misses for the
/// same email are coalesced by the single-flight decorator wrapped outside
/// this one.
pub struct GroupCacheProvider {
    inner: Arc<dyn Provider>,
    ttl: Duration,
    grace: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

struct CacheEntry {
    groups: BTreeSet<String>,
    fetched_at: Instant,
}

impl GroupCacheProvider {
    pub fn new(inner: Arc<dyn Provider>, ttl: Duration, grace: Duration) -> Self {
        Self {
            inner,
            ttl,
            grace,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, email: &str) -> Option<(BTreeSet<String>, Duration)> {
        let entries = self.entries.lock().expect("group cache poisoned");
        entries
            .get(email)
            .map(|entry| (entry.groups.clone(), entry.fetched_at.elapsed()))
    }

    fn store(&self, email: &str, groups: BTreeSet<String>) {
        let mut entries = self.entries.lock().expect("group cache poisoned");
        entries.insert(
            email.to_string(),
            CacheEntry {
                groups,
                fetched_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, email: &str) {
        self.entries
            .lock()
            .expect("group cache poisoned")
            .remove(email);
    }
}

fn intersect(full: &BTreeSet<String>, allowed: &BTreeSet<String>) -> BTreeSet<String> {
    if allowed.is_empty() {
        full.clone()
    } else {
        full.intersection(allowed).cloned().collect()
    }
}

#[async_trait]
impl Provider for GroupCacheProvider {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    fn sign_in_url(&self, state: &str) -> Url {
        self.inner.sign_in_url(state)
    }

    async fn redeem(&self, code: &str) -> ProviderResult<Redemption> {
        self.inner.redeem(code).await
    }

    async fn refresh(&self, refresh_token: &str) -> ProviderResult<RefreshedTokens> {
        self.inner.refresh(refresh_token).await
    }

    async fn revoke(&self, access_token: &str, refresh_token: &str) -> ProviderResult<()> {
        self.inner.revoke(access_token, refresh_token).await
    }

    async fn validate(&self, access_token: &str) -> ProviderResult<bool> {
        self.inner.validate(access_token).await
    }

    async fn user_profile(&self, access_token: &str) -> ProviderResult<Profile> {
        self.inner.user_profile(access_token).await
    }

    async fn group_membership(
        &self,
        email: &str,
        allowed: &BTreeSet<String>,
    ) -> ProviderResult<BTreeSet<String>> {
        let stale = match self.cached(email) {
            Some((groups, age)) if age <= self.ttl => return Ok(intersect(&groups, allowed)),
            other => other,
        };

        match self.inner.group_membership(email, &BTreeSet::new()).await {
            Ok(groups) => {
                self.store(email, groups.clone());
                Ok(intersect(&groups, allowed))
            }
            Err(err) if err.is_transient() => match stale {
                Some((groups, age)) if age <= self.ttl + self.grace => {
                    warn!(%email, error = %err, "group fetch failed; serving stale entry");
                    Ok(intersect(&groups, allowed))
                }
                _ => Err(err),
            },
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sso_core::provider::{ProviderError, ProviderErrorKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeGroups {
        calls: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    impl FakeGroups {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Provider for FakeGroups {
        fn kind(&self) -> &'static str {
            "fake"
        }

        fn sign_in_url(&self, _state: &str) -> Url {
            Url::parse("https://idp.example.com/authorize").unwrap()
        }

        async fn redeem(&self, _code: &str) -> ProviderResult<Redemption> {
            unimplemented!("not exercised")
        }

        async fn refresh(&self, _refresh_token: &str) -> ProviderResult<RefreshedTokens> {
            unimplemented!("not exercised")
        }

        async fn revoke(&self, _access: &str, _refresh: &str) -> ProviderResult<()> {
            Ok(())
        }

        async fn validate(&self, _access_token: &str) -> ProviderResult<bool> {
            Ok(true)
        }

        async fn user_profile(&self, _access_token: &str) -> ProviderResult<Profile> {
            unimplemented!("not exercised")
        }

        async fn group_membership(
            &self,
            _email: &str,
            _allowed: &BTreeSet<String>,
        ) -> ProviderResult<BTreeSet<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(ProviderError::transport("connection refused".to_string()));
            }
            Ok(BTreeSet::from(["eng".to_string(), "oncall".to_string()]))
        }
    }

    #[tokio::test]
    async fn second_lookup_within_ttl_hits_cache() {
        let fake = FakeGroups::new();
        let cache = GroupCacheProvider::new(
            fake.clone(),
            Duration::from_secs(600),
            Duration::from_secs(60),
        );
        let allowed = BTreeSet::from(["eng".to_string()]);

        let first = cache
            .group_membership("a@corp.example.com", &allowed)
            .await
            .expect("first");
        let second = cache
            .group_membership("a@corp.example.com", &allowed)
            .await
            .expect("second");

        assert_eq!(first, BTreeSet::from(["eng".to_string()]));
        assert_eq!(first, second);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failure_serves_stale_entry() {
        let fake = FakeGroups::new();
        let cache = GroupCacheProvider::new(
            fake.clone(),
            Duration::ZERO,
            Duration::from_secs(3600),
        );

        cache
            .group_membership("a@corp.example.com", &BTreeSet::new())
            .await
            .expect("prime");
        fake.fail.store(true, Ordering::SeqCst);

        let groups = cache
            .group_membership("a@corp.example.com", &BTreeSet::new())
            .await
            .expect("stale");
        assert!(groups.contains("eng"));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transient_failure_without_entry_propagates() {
        let fake = FakeGroups::new();
        fake.fail.store(true, Ordering::SeqCst);
        let cache = GroupCacheProvider::new(
            fake.clone(),
            Duration::from_secs(600),
            Duration::from_secs(60),
        );

        let err = cache
            .group_membership("a@corp.example.com", &BTreeSet::new())
            .await
            .expect_err("no stale entry");
        assert_eq!(err.kind(), ProviderErrorKind::Transport);
    }

    #[tokio::test]
    async fn invalidate_forces_a_refetch() {
        let fake = FakeGroups::new();
        let cache = GroupCacheProvider::new(
            fake.clone(),
            Duration::from_secs(600),
            Duration::from_secs(60),
        );
        cache
            .group_membership("a@corp.example.com", &BTreeSet::new())
            .await
            .expect("prime");
        cache.invalidate("a@corp.example.com");
        cache
            .group_membership("a@corp.example.com", &BTreeSet::new())
            .await
            .expect("refetch");
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
    }
}
