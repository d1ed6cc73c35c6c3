#![deny(missing_docs)]
//! In-memory implementation of [`turnflow_core::Cache`].
//!
//! Uses a `HashMap` behind a `RwLock`, namespaced by prefixing keys with
//! `"{namespace}\0"`. TTLs are enforced lazily on read. A second map of
//! `Notify` handles gives concrete callers (anyone holding a `MemoryCache`
//! rather than a `dyn Cache`) a real single-flight `get_or_compute` that
//! collapses concurrent builders for the same key, per spec §4.2/§9.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use turnflow_core::cache::Cache;
use turnflow_core::duration::DurationMs;
use turnflow_core::error::CacheError;

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

/// In-memory cache with lazy TTL expiry and per-key single-flight.
pub struct MemoryCache {
    data: RwLock<HashMap<String, Entry>>,
    inflight: Mutex<HashMap<String, Arc<Notify>>>,
}

impl MemoryCache {
    /// Create a new, empty cache.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch-or-build `key`, guaranteeing `build` runs at most once across
    /// concurrent callers racing on the same `(namespace, key)`.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        namespace: &str,
        key: &str,
        ttl: DurationMs,
        build: F,
    ) -> Result<T, CacheError>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let composite = composite_key(namespace, key);

        if let Some(raw) = self.get(namespace, key).await? {
            return serde_json::from_slice(&raw)
                .map_err(|e| CacheError::Serialization(e.to_string()));
        }

        let notify = {
            let mut inflight = self.inflight.lock().await;
            if let Some(existing) = inflight.get(&composite) {
                Some(existing.clone())
            } else {
                inflight.insert(composite.clone(), Arc::new(Notify::new()));
                None
            }
        };

        if let Some(notify) = notify {
            // Another caller is already building this key; wait for it,
            // then re-read instead of rebuilding.
            notify.notified().await;
            return match self.get(namespace, key).await? {
                Some(raw) => serde_json::from_slice(&raw)
                    .map_err(|e| CacheError::Serialization(e.to_string())),
                None => Err(CacheError::BuildFailed(
                    "single-flight builder failed upstream".to_string(),
                )),
            };
        }

        let result = build().await;
        let notify = {
            let mut inflight = self.inflight.lock().await;
            inflight.remove(&composite)
        };
        let value = result?;
        let raw =
            serde_json::to_vec(&value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.set(namespace, key, raw, ttl).await?;
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
        Ok(value)
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

fn composite_key(namespace: &str, key: &str) -> String {
    format!("{namespace}\0{key}")
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let ck = composite_key(namespace, key);
        let now = Instant::now();
        let data = self.data.read().await;
        match data.get(&ck) {
            Some(entry) if entry.expires_at.is_none_or(|exp| exp > now) => {
                Ok(Some(entry.value.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        ttl: DurationMs,
    ) -> Result<(), CacheError> {
        let ck = composite_key(namespace, key);
        let expires_at = if ttl == DurationMs::ZERO {
            None
        } else {
            Some(Instant::now() + std::time::Duration::from(ttl))
        };
        let mut data = self.data.write().await;
        data.insert(ck, Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), CacheError> {
        let ck = composite_key(namespace, key);
        let mut data = self.data.write().await;
        data.remove(&ck);
        Ok(())
    }

    async fn delete_prefix(&self, namespace: &str, prefix: &str) -> Result<(), CacheError> {
        let full_prefix = composite_key(namespace, prefix);
        let mut data = self.data.write().await;
        data.retain(|k, _| !k.starts_with(&full_prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn get_returns_none_on_miss() {
        let cache = MemoryCache::new();
        assert!(cache.get("ns", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = MemoryCache::new();
        cache
            .set("ns", "k", b"hello".to_vec(), DurationMs::ZERO)
            .await
            .unwrap();
        assert_eq!(cache.get("ns", "k").await.unwrap().unwrap(), b"hello");
    }

    #[tokio::test]
    async fn expired_entry_reads_as_miss() {
        let cache = MemoryCache::new();
        cache
            .set("ns", "k", b"hello".to_vec(), DurationMs::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(cache.get("ns", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_prefix_only_removes_matching_namespace_and_prefix() {
        let cache = MemoryCache::new();
        cache.set("ns", "a/1", b"x".to_vec(), DurationMs::ZERO).await.unwrap();
        cache.set("ns", "a/2", b"x".to_vec(), DurationMs::ZERO).await.unwrap();
        cache.set("ns", "b/1", b"x".to_vec(), DurationMs::ZERO).await.unwrap();
        cache.set("other", "a/1", b"x".to_vec(), DurationMs::ZERO).await.unwrap();
        cache.delete_prefix("ns", "a/").await.unwrap();
        assert!(cache.get("ns", "a/1").await.unwrap().is_none());
        assert!(cache.get("ns", "a/2").await.unwrap().is_none());
        assert!(cache.get("ns", "b/1").await.unwrap().is_some());
        assert!(cache.get("other", "a/1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn get_or_compute_runs_builder_once_under_concurrency() {
        let cache = Arc::new(MemoryCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("ns", "k", DurationMs::from_millis(60_000), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Ok::<_, CacheError>(42u32)
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
