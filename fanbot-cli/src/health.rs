//! Time-boxed cache for the relay's health status.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub type FetchResult<T> = Result<T, Arc<anyhow::Error>>;

type Pending<T> = Shared<BoxFuture<'static, FetchResult<T>>>;

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub fetched_at: Instant,
}

struct Slot<T> {
    entry: Option<CacheEntry<T>>,
    pending: Option<Pending<T>>,
    // Bumped by `invalidate` so a fetch started before it cannot repopulate.
    epoch: u64,
}

/// Holds one value for `ttl`. At most one refresh runs at a time; callers
/// arriving while it runs await the same result.
pub struct TimedCache<T> {
    ttl: Duration,
    slot: Mutex<Slot<T>>,
}

impl<T> TimedCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(Slot {
                entry: None,
                pending: None,
                epoch: 0,
            }),
        }
    }

    /// The cached value if it is still fresh.
    pub async fn peek(&self) -> Option<T> {
        let slot = self.slot.lock().await;
        slot.entry
            .as_ref()
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }

    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> FetchResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (pending, epoch) = {
            let mut slot = self.slot.lock().await;
            if let Some(entry) = &slot.entry {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.value.clone());
                }
            }
            let pending = match &slot.pending {
                Some(pending) => pending.clone(),
                None => {
                    let pending = fetch().map(|r| r.map_err(Arc::new)).boxed().shared();
                    slot.pending = Some(pending.clone());
                    pending
                }
            };
            (pending, slot.epoch)
        };

        let result = pending.await;

        let mut slot = self.slot.lock().await;
        if slot.epoch == epoch {
            slot.pending = None;
            if let Ok(value) = &result {
                slot.entry = Some(CacheEntry {
                    value: value.clone(),
                    fetched_at: Instant::now(),
                });
            }
        }
        result
    }

    /// Forgets the value and any refresh in flight.
    pub async fn invalidate(&self) {
        let mut slot = self.slot.lock().await;
        slot.entry = None;
        slot.pending = None;
        slot.epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_fetch(
        calls: Arc<AtomicUsize>,
    ) -> impl FnOnce() -> BoxFuture<'static, anyhow::Result<usize>> {
        move || {
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(calls.fetch_add(1, Ordering::SeqCst) + 1)
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let cache = Arc::new(TimedCache::new(Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache.get_or_refresh(counting_fetch(calls)).await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.peek().await, Some(1));
    }

    #[tokio::test]
    async fn fresh_value_is_served_from_cache() {
        let cache = TimedCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        cache.get_or_refresh(counting_fetch(calls.clone())).await.unwrap();
        cache.get_or_refresh(counting_fetch(calls.clone())).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_value_is_refetched() {
        let cache = TimedCache::new(Duration::from_millis(10));
        let calls = Arc::new(AtomicUsize::new(0));

        cache.get_or_refresh(counting_fetch(calls.clone())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.peek().await, None);
        let value = cache.get_or_refresh(counting_fetch(calls.clone())).await.unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let cache = TimedCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        cache.get_or_refresh(counting_fetch(calls.clone())).await.unwrap();
        cache.invalidate().await;
        assert_eq!(cache.peek().await, None);
        let value = cache.get_or_refresh(counting_fetch(calls.clone())).await.unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache: TimedCache<usize> = TimedCache::new(Duration::from_secs(60));

        let err = cache
            .get_or_refresh(|| async { Err(anyhow::anyhow!("relay down")) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "relay down");
        assert_eq!(cache.peek().await, None);

        let value = cache.get_or_refresh(|| async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }
}
