use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use sso_core::provider::ProviderError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Full directory enumeration: group name to member emails.
pub type GroupMembers = HashMap<String, BTreeSet<String>>;

#[derive(Default)]
struct Snapshot {
    by_group: GroupMembers,
    by_email: HashMap<String, BTreeSet<String>>,
}

/// Pre-filled group membership map for providers that can enumerate every
/// group (Google via the directory API).
///
/// A background task rebuilds the map on an interval and publishes it as an
/// immutable snapshot; readers only ever clone an `Arc`, and the write lock
/// is held for the swap alone, never across network I/O.
pub struct FillCache {
    snapshot: RwLock<Arc<Snapshot>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FillCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            task: Mutex::new(None),
        })
    }

    /// Publish a freshly enumerated map, replacing the current snapshot.
    pub fn publish(&self, by_group: GroupMembers) {
        let mut by_email: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (group, members) in &by_group {
            for email in members {
                by_email
                    .entry(email.clone())
                    .or_default()
                    .insert(group.clone());
            }
        }
        let next = Arc::new(Snapshot { by_group, by_email });
        *self.snapshot.write().expect("fill cache poisoned") = next;
    }

    /// Membership lookup against the current snapshot. An empty `allowed`
    /// set returns every known membership for the user.
    pub fn groups_for(&self, email: &str, allowed: &BTreeSet<String>) -> BTreeSet<String> {
        let snapshot = self.snapshot.read().expect("fill cache poisoned").clone();
        if allowed.is_empty() {
            return snapshot.by_email.get(email).cloned().unwrap_or_default();
        }
        allowed
            .iter()
            .filter(|group| {
                snapshot
                    .by_group
                    .get(*group)
                    .is_some_and(|members| members.contains(email))
            })
            .cloned()
            .collect()
    }

    /// Start the periodic refill task. The first enumeration runs
    /// immediately so lookups work as soon as the directory answers.
    pub fn spawn_refill<F, Fut>(self: &Arc<Self>, populate: F, every: Duration)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GroupMembers, ProviderError>> + Send,
    {
        let cache = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                match populate().await {
                    Ok(by_group) => {
                        info!(groups = by_group.len(), "group cache refilled");
                        cache.publish(by_group);
                    }
                    Err(err) => {
                        warn!(error = %err, "group cache refill failed; keeping last snapshot");
                    }
                }
            }
        });
        *self.task.lock().expect("fill cache poisoned") = Some(handle);
    }

    /// Shutdown handle; invoked once when the service stops.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().expect("fill cache poisoned").take() {
            handle.abort();
        }
    }
}
