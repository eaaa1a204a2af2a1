//! In-memory caches
//!
//! These caches are volatile and cleared on restart.
//! Uses Moka for high-performance concurrent caching.

use async_trait::async_trait;
use moka::future::Cache as MokaInner;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};

/// Key/value cache with an explicit miss.
///
/// `get` returns `None` on a miss so callers can tell "absent" from
/// "present but empty".
#[async_trait]
pub trait Cache<T>: Send + Sync {
    async fn get(&self, key: &str) -> Option<T>;
    async fn set(&self, key: &str, value: T);
}

/// TTL-bounded Moka cache
pub struct MokaCache<T> {
    name: &'static str,
    inner: MokaInner<String, T>,
}

impl<T> MokaCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// # Arguments
    /// * `name` - Label used in cache metrics
    /// * `capacity` - Maximum number of entries
    /// * `ttl` - Lifetime of an entry after insertion
    pub fn new(name: &'static str, capacity: u64, ttl: Duration) -> Self {
        let inner = MokaInner::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();

        Self { name, inner }
    }

    /// Return the cached value or run `init` to produce it.
    ///
    /// Concurrent callers for the same key wait on a single `init`;
    /// failures are not cached.
    pub async fn get_or_try_insert_with<F, E>(&self, key: &str, init: F) -> Result<T, Arc<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: Send + Sync + 'static,
    {
        if let Some(value) = self.inner.get(key).await {
            CACHE_HITS_TOTAL.with_label_values(&[self.name]).inc();
            return Ok(value);
        }
        CACHE_MISSES_TOTAL.with_label_values(&[self.name]).inc();
        self.inner.try_get_with(key.to_string(), init).await
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

#[async_trait]
impl<T> Cache<T> for MokaCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<T> {
        let value = self.inner.get(key).await;
        match value {
            Some(_) => CACHE_HITS_TOTAL.with_label_values(&[self.name]).inc(),
            None => CACHE_MISSES_TOTAL.with_label_values(&[self.name]).inc(),
        }
        value
    }

    async fn set(&self, key: &str, value: T) {
        self.inner.insert(key.to_string(), value).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_get_distinguishes_miss() {
        let cache: MokaCache<String> = MokaCache::new("test", 10, Duration::from_secs(60));

        assert!(cache.get("missing").await.is_none());
        cache.set("present", String::new()).await;
        assert_eq!(cache.get("present").await, Some(String::new()));
    }

    #[tokio::test]
    async fn test_concurrent_initialization_runs_once() {
        let cache: Arc<MokaCache<u32>> = Arc::new(MokaCache::new("test", 10, Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_try_insert_with("key", async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, std::io::Error>(7)
                    })
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_initialization_is_not_cached() {
        let cache: MokaCache<u32> = MokaCache::new("test", 10, Duration::from_secs(60));

        let failed = cache
            .get_or_try_insert_with("key", async { Err::<u32, _>(std::io::Error::other("boom")) })
            .await;
        assert!(failed.is_err());

        let value = cache
            .get_or_try_insert_with("key", async { Ok::<_, std::io::Error>(3) })
            .await
            .unwrap();
        assert_eq!(value, 3);
    }
}
