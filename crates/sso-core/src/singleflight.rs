use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};

type Flight<T> = Shared<BoxFuture<'static, T>>;

/// Coalesces concurrent identical calls into one underlying call whose
/// result fans out to every waiter.
///
/// The underlying work is spawned onto the runtime, so a caller being
/// cancelled never cancels work other waiters share; the call runs to
/// completion and late joiners within the window still observe its result.
/// The map mutex is held only across map mutations, never across I/O.
pub struct SingleFlight<T>
where
    T: Clone,
{
    inflight: Arc<Mutex<HashMap<String, Flight<T>>>>,
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Join the in-flight call for `key`, or start `work` as its leader.
    pub async fn run<F>(&self, key: &str, work: F) -> T
    where
        F: Future<Output = T> + Send + 'static,
    {
        let flight = {
            let mut inflight = self.inflight.lock().expect("single-flight map poisoned");
            if let Some(existing) = inflight.get(key) {
                existing.clone()
            } else {
                let map = Arc::clone(&self.inflight);
                let owned_key = key.to_string();
                let handle = tokio::spawn(async move {
                    let result = work.await;
                    map.lock()
                        .expect("single-flight map poisoned")
                        .remove(&owned_key);
                    result
                });
                let flight: Flight<T> = async move {
                    match handle.await {
                        Ok(value) => value,
                        Err(err) => panic!("single-flight task failed: {err}"),
                    }
                }
                .boxed()
                .shared();
                inflight.insert(key.to_string(), flight.clone());
                flight
            }
        };
        flight.await
    }
}
