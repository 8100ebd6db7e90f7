//! Sliding-window rate limiting for polite fetching.
//!
//! Admission control per key (host, with a separate looser tier for
//! API-shaped paths): a request is admitted only while the key's admitted
//! count within the trailing window is below its ceiling, otherwise it is
//! rejected with a suggested retry-after. Excess requests are never queued
//! or delayed here; the scheduler decides what to do with the rejection.
//!
//! Rate rejections are self-imposed, not target-caused, and must never be
//! reported to the circuit breaker.

use std::time::Duration;

use chrono::Utc;
use url::Url;

use crate::error::AppError;
use crate::store::KeyedStore;

/// Configuration for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Trailing window width.
    pub window: Duration,

    /// Ceiling for regular page fetches per key per window.
    pub page_ceiling: u32,

    /// Ceiling for the API tier. Endpoints behind API-shaped paths are
    /// built for programmatic access and tolerate a higher rate.
    pub api_ceiling: u32,
}

impl Default for RateLimitConfig {
    /// 60 pages / 180 API calls per key per minute.
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            page_ceiling: 60,
            api_ceiling: 180,
        }
    }
}

impl RateLimitConfig {
    pub fn new(window: Duration, page_ceiling: u32) -> Self {
        Self {
            window,
            page_ceiling,
            api_ceiling: page_ceiling.saturating_mul(3),
        }
    }

    pub fn with_api_ceiling(mut self, ceiling: u32) -> Self {
        self.api_ceiling = ceiling;
        self
    }
}

/// True when the path looks like a programmatic endpoint rather than a
/// rendered page.
fn is_api_shaped(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    if path.ends_with(".json") || path.ends_with(".xml") {
        return true;
    }
    url.path_segments()
        .map(|mut segments| segments.any(|s| s == "api" || s == "rest"))
        .unwrap_or(false)
}

/// Rate-limit key for a URL: host, with an `|api` suffix for the API tier.
pub fn rate_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or("unknown");
    if is_api_shaped(url) {
        format!("{host}|api")
    } else {
        host.to_string()
    }
}

/// Key-partitioned sliding-window limiter over a shared keyed store.
#[derive(Clone)]
pub struct RateLimiter<K: KeyedStore> {
    store: K,
    config: RateLimitConfig,
}

impl<K: KeyedStore> RateLimiter<K> {
    pub fn new(store: K, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    fn store_key(key: &str) -> String {
        format!("rl:{key}")
    }

    fn ceiling_for(&self, key: &str) -> u32 {
        if key.ends_with("|api") {
            self.config.api_ceiling
        } else {
            self.config.page_ceiling
        }
    }

    /// Admit or reject a request for `url`. Admitted requests are counted
    /// immediately. Store failures admit the request (fail open).
    pub async fn try_admit(&self, url: &Url) -> Result<(), AppError> {
        let key = rate_key(url);
        self.try_admit_key(&key).await
    }

    /// Same as [`try_admit`](Self::try_admit), on a precomputed key.
    pub async fn try_admit_key(&self, key: &str) -> Result<(), AppError> {
        let now_ms = Utc::now().timestamp_millis();
        let window_ms = self.config.window.as_millis() as i64;
        let ceiling = self.ceiling_for(key);
        let store_key = Self::store_key(key);

        let mut stamps: Vec<i64> = match self.store.get(&store_key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_default(),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Store unreachable, admitting request");
                return Ok(());
            }
        };

        stamps.retain(|&t| now_ms.saturating_sub(t) < window_ms);

        if stamps.len() >= ceiling as usize {
            let oldest = stamps.iter().copied().min().unwrap_or(now_ms);
            let retry_ms = (oldest + window_ms).saturating_sub(now_ms).max(0) as u64;
            tracing::debug!(key = %key, in_window = stamps.len(), "Rate ceiling reached");
            return Err(AppError::RateLimited {
                key: key.to_string(),
                retry_after: Duration::from_millis(retry_ms),
            });
        }

        stamps.push(now_ms);
        let raw = serde_json::to_string(&stamps)?;
        if let Err(e) = self
            .store
            .set(&store_key, &raw, Some(self.config.window * 2))
            .await
        {
            tracing::warn!(key = %key, error = %e, "Store unreachable recording admission");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn limiter(config: RateLimitConfig) -> RateLimiter<MemoryStore> {
        RateLimiter::new(MemoryStore::new(), config)
    }

    #[test]
    fn test_rate_key_tiers() {
        let page = Url::parse("https://portal.example.mx/registro/listado").unwrap();
        assert_eq!(rate_key(&page), "portal.example.mx");

        let api = Url::parse("https://portal.example.mx/api/v1/standards").unwrap();
        assert_eq!(rate_key(&api), "portal.example.mx|api");

        let json = Url::parse("https://portal.example.mx/export/data.json").unwrap();
        assert_eq!(rate_key(&json), "portal.example.mx|api");

        let rest = Url::parse("https://portal.example.mx/rest/centros").unwrap();
        assert_eq!(rate_key(&rest), "portal.example.mx|api");
    }

    #[tokio::test]
    async fn test_ceiling_plus_one_yields_one_rejection() {
        let rl = limiter(RateLimitConfig::new(Duration::from_secs(60), 5));
        let url = Url::parse("https://portal.example.mx/page").unwrap();

        let mut rejections = 0;
        for _ in 0..6 {
            if rl.try_admit(&url).await.is_err() {
                rejections += 1;
            }
        }
        assert_eq!(rejections, 1);
    }

    #[tokio::test]
    async fn test_window_refills() {
        let rl = limiter(RateLimitConfig::new(Duration::from_millis(50), 3));
        let url = Url::parse("https://portal.example.mx/page").unwrap();

        for _ in 0..3 {
            rl.try_admit(&url).await.unwrap();
        }
        assert!(rl.try_admit(&url).await.is_err());

        tokio::time::sleep(Duration::from_millis(80)).await;

        for _ in 0..3 {
            rl.try_admit(&url).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_rejection_carries_retry_after() {
        let rl = limiter(RateLimitConfig::new(Duration::from_secs(60), 1));
        let url = Url::parse("https://portal.example.mx/page").unwrap();

        rl.try_admit(&url).await.unwrap();
        let err = rl.try_admit(&url).await.unwrap_err();
        match err {
            AppError::RateLimited { retry_after, .. } => {
                assert!(retry_after <= Duration::from_secs(60));
                assert!(retry_after > Duration::from_secs(50));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_api_tier_is_looser() {
        let rl = limiter(RateLimitConfig::new(Duration::from_secs(60), 2).with_api_ceiling(10));
        let page = Url::parse("https://portal.example.mx/page").unwrap();
        let api = Url::parse("https://portal.example.mx/api/items").unwrap();

        rl.try_admit(&page).await.unwrap();
        rl.try_admit(&page).await.unwrap();
        assert!(rl.try_admit(&page).await.is_err());

        // The API tier counts separately and has headroom left.
        for _ in 0..10 {
            rl.try_admit(&api).await.unwrap();
        }
        assert!(rl.try_admit(&api).await.is_err());
    }

    #[tokio::test]
    async fn test_fails_open_when_store_unreachable() {
        let rl = RateLimiter::new(
            crate::testutil::FailingStore,
            RateLimitConfig::new(Duration::from_secs(60), 1),
        );
        let url = Url::parse("https://portal.example.mx/page").unwrap();

        // Admission counts cannot be read or written; every request is
        // admitted rather than blocked.
        for _ in 0..5 {
            rl.try_admit(&url).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_hosts_are_partitioned() {
        let rl = limiter(RateLimitConfig::new(Duration::from_secs(60), 1));
        let a = Url::parse("https://a.example.mx/").unwrap();
        let b = Url::parse("https://b.example.mx/").unwrap();

        rl.try_admit(&a).await.unwrap();
        assert!(rl.try_admit(&a).await.is_err());
        rl.try_admit(&b).await.unwrap();
    }
}
