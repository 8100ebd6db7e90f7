//! Shared keyed store for coordination state.
//!
//! The circuit breaker, rate limiter, and dedup filter all keep their
//! key-partitioned state behind this seam instead of module-level globals,
//! so each is independently testable and the whole chain can point at an
//! external store when runs are sharded across processes. The store holds
//! coordination state only, never business data.

use std::future::Future;
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::sync::Cache;

use crate::error::AppError;

/// Minimal get/set/increment with per-key expiry.
///
/// Implementations must be safe for concurrent per-key read-modify-write;
/// no multi-key transactions are ever required.
pub trait KeyedStore: Send + Sync + Clone {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, AppError>> + Send;

    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Increment the integer at `key` (missing or non-numeric counts as 0)
    /// and return the new value.
    fn increment(
        &self,
        key: &str,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<i64, AppError>> + Send;
}

#[derive(Debug, Clone)]
struct StoreValue {
    value: String,
    ttl: Option<Duration>,
}

struct PerEntryExpiry;

impl Expiry<String, StoreValue> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoreValue,
        _current_time: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoreValue,
        _current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// In-process [`KeyedStore`] backed by a moka cache with per-entry expiry.
#[derive(Clone)]
pub struct MemoryStore {
    cache: Cache<String, StoreValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(100_000)
    }

    pub fn with_capacity(max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryExpiry)
            .build();
        Self { cache }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.cache.get(key).map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), AppError> {
        self.cache.insert(
            key.to_string(),
            StoreValue {
                value: value.to_string(),
                ttl,
            },
        );
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64, AppError> {
        let entry = self
            .cache
            .entry(key.to_string())
            .and_upsert_with(|maybe| {
                let current = maybe
                    .and_then(|e| e.into_value().value.parse::<i64>().ok())
                    .unwrap_or(0);
                StoreValue {
                    value: (current + 1).to_string(),
                    ttl,
                }
            });
        entry
            .value()
            .value
            .parse::<i64>()
            .map_err(|e| AppError::StoreError(format!("counter parse: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entry_expires() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_increment_from_missing() {
        let store = MemoryStore::new();
        assert_eq!(store.increment("c", None).await.unwrap(), 1);
        assert_eq!(store.increment("c", None).await.unwrap(), 2);
        assert_eq!(store.increment("c", None).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_increment_is_atomic_under_contention() {
        let store = MemoryStore::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    store.increment("shared", None).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.increment("shared", None).await.unwrap(), 401);
    }

    #[tokio::test]
    async fn test_keys_are_partitioned() {
        let store = MemoryStore::new();
        store.increment("a", None).await.unwrap();
        store.increment("b", None).await.unwrap();
        store.increment("a", None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some("2".to_string()));
        assert_eq!(store.get("b").await.unwrap(), Some("1".to_string()));
    }
}
