//! Circuit breaker pattern for host resilience.
//!
//! Protects the crawl (and the target portal) when a section of the site
//! starts failing: after enough consecutive failures the section's key is
//! rejected without a network call until it shows signs of recovery.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[timeout]--> HALF_OPEN (probing)
//!                                                                         |
//!                                       <--[probe failure]--              |
//!                                                                         |
//! CLOSED <-----------------------[probe success]--------------------------+
//! ```
//!
//! State is key-partitioned (host plus leading path segments) and lives in
//! the injected [`KeyedStore`], never in module globals. If the store is
//! unreachable the breaker fails open: crawl progress outranks strict
//! enforcement.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AppError;
use crate::store::KeyedStore;

/// Current state of one circuit key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected immediately.
    Open,
    /// A bounded number of trial requests are allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening a key's circuit.
    pub failure_threshold: u32,

    /// Time to wait before transitioning from Open to Half-Open.
    pub recovery_timeout: Duration,

    /// Trial requests admitted while Half-Open before rejecting again.
    pub half_open_probe_count: u32,

    /// Store TTL for circuit entries. Coordination state only; entries
    /// may vanish early and the key simply starts Closed again.
    pub entry_ttl: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_probe_count: 2,
            entry_ttl: Duration::from_secs(3600),
        }
    }
}

/// Serialized per-key state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CircuitEntry {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_ms: Option<i64>,
    half_open_probes_used: u32,
}

impl Default for CircuitEntry {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_ms: None,
            half_open_probes_used: 0,
        }
    }
}

/// Snapshot of one key's circuit for the run summary.
#[derive(Debug, Clone)]
pub struct CircuitStats {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

/// Derive the circuit key for a URL: host plus up to two leading path
/// segments, deep enough to separate portal sections without splitting
/// every page into its own circuit.
pub fn circuit_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or("unknown");
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).take(2).collect())
        .unwrap_or_default();
    if segments.is_empty() {
        host.to_string()
    } else {
        format!("{host}/{}", segments.join("/"))
    }
}

/// Key-partitioned circuit breaker over a shared keyed store.
#[derive(Clone)]
pub struct CircuitBreaker<K: KeyedStore> {
    store: K,
    config: CircuitBreakerConfig,
    /// Keys this instance has touched, so the run summary can report the
    /// circuits currently open without the store needing key iteration.
    seen_keys: Arc<Mutex<HashSet<String>>>,
}

impl<K: KeyedStore> CircuitBreaker<K> {
    pub fn new(store: K, config: CircuitBreakerConfig) -> Self {
        Self {
            store,
            config,
            seen_keys: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn store_key(key: &str) -> String {
        format!("cb:{key}")
    }

    fn note_key(&self, key: &str) {
        if let Ok(mut seen) = self.seen_keys.lock() {
            seen.insert(key.to_string());
        }
    }

    async fn load(&self, key: &str) -> Result<CircuitEntry, AppError> {
        match self.store.get(&Self::store_key(key)).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| AppError::StoreError(format!("circuit entry decode: {e}"))),
            None => Ok(CircuitEntry::default()),
        }
    }

    async fn save(&self, key: &str, entry: &CircuitEntry) -> Result<(), AppError> {
        let raw = serde_json::to_string(entry)?;
        self.store
            .set(&Self::store_key(key), &raw, Some(self.config.entry_ttl))
            .await
    }

    fn retry_after(&self, entry: &CircuitEntry) -> Duration {
        let elapsed = entry
            .last_failure_ms
            .map(|ms| Utc::now().timestamp_millis().saturating_sub(ms))
            .unwrap_or(0)
            .max(0) as u64;
        self.config
            .recovery_timeout
            .saturating_sub(Duration::from_millis(elapsed))
    }

    fn recovery_elapsed(&self, entry: &CircuitEntry) -> bool {
        match entry.last_failure_ms {
            Some(ms) => {
                let elapsed = Utc::now().timestamp_millis().saturating_sub(ms).max(0) as u128;
                elapsed >= self.config.recovery_timeout.as_millis()
            }
            None => true,
        }
    }

    /// Admission check before a network call.
    ///
    /// - Closed: admitted.
    /// - Open: rejected with retry-after, unless the recovery timeout has
    ///   elapsed, in which case the key moves to Half-Open and this call
    ///   consumes the first probe.
    /// - Half-Open: admitted while probes remain, rejected after.
    ///
    /// Store failures admit the request (fail open).
    pub async fn preflight(&self, key: &str) -> Result<(), AppError> {
        self.note_key(key);

        let mut entry = match self.load(key).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(circuit = %key, error = %e, "Store unreachable, admitting request");
                return Ok(());
            }
        };

        match entry.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                if self.recovery_elapsed(&entry) {
                    tracing::info!(circuit = %key, "Circuit transitioning to half-open");
                    entry.state = CircuitState::HalfOpen;
                    entry.half_open_probes_used = 1;
                    if let Err(e) = self.save(key, &entry).await {
                        tracing::warn!(circuit = %key, error = %e, "Store unreachable on transition");
                    }
                    Ok(())
                } else {
                    Err(AppError::CircuitOpen {
                        key: key.to_string(),
                        retry_after: self.retry_after(&entry),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if entry.half_open_probes_used < self.config.half_open_probe_count {
                    entry.half_open_probes_used += 1;
                    if let Err(e) = self.save(key, &entry).await {
                        tracing::warn!(circuit = %key, error = %e, "Store unreachable on probe");
                    }
                    Ok(())
                } else {
                    Err(AppError::CircuitOpen {
                        key: key.to_string(),
                        retry_after: self.retry_after(&entry),
                    })
                }
            }
        }
    }

    /// Record a successful call: a half-open probe success fully closes
    /// the circuit; a closed success resets the failure streak.
    pub async fn record_success(&self, key: &str) {
        let mut entry = match self.load(key).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(circuit = %key, error = %e, "Store unreachable on success");
                return;
            }
        };

        match entry.state {
            CircuitState::HalfOpen => {
                tracing::info!(circuit = %key, "Probe succeeded, closing circuit");
                entry = CircuitEntry::default();
            }
            CircuitState::Closed => {
                entry.consecutive_failures = 0;
            }
            CircuitState::Open => return,
        }

        if let Err(e) = self.save(key, &entry).await {
            tracing::warn!(circuit = %key, error = %e, "Store unreachable recording success");
        }
    }

    /// Record a failed call. Callers are expected to consult
    /// [`AppError::should_trip_circuit`] first; self-imposed rejections
    /// must never be recorded here.
    pub async fn record_failure(&self, key: &str) {
        self.note_key(key);

        let mut entry = match self.load(key).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(circuit = %key, error = %e, "Store unreachable on failure");
                return;
            }
        };

        let now_ms = Utc::now().timestamp_millis();
        match entry.state {
            CircuitState::Closed => {
                entry.consecutive_failures += 1;
                entry.last_failure_ms = Some(now_ms);
                if entry.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %key,
                        failures = entry.consecutive_failures,
                        "Circuit opening after consecutive failures"
                    );
                    entry.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(circuit = %key, "Probe failed, reopening circuit");
                entry.state = CircuitState::Open;
                entry.last_failure_ms = Some(now_ms);
                entry.half_open_probes_used = 0;
            }
            CircuitState::Open => {
                entry.last_failure_ms = Some(now_ms);
            }
        }

        if let Err(e) = self.save(key, &entry).await {
            tracing::warn!(circuit = %key, error = %e, "Store unreachable recording failure");
        }
    }

    /// Current state of one key (for tests and stats).
    pub async fn state(&self, key: &str) -> CircuitState {
        self.load(key).await.map(|e| e.state).unwrap_or(CircuitState::Closed)
    }

    /// Keys currently open, across everything this instance has touched.
    pub async fn open_circuits(&self) -> Vec<CircuitStats> {
        let keys: Vec<String> = match self.seen_keys.lock() {
            Ok(seen) => seen.iter().cloned().collect(),
            Err(_) => return Vec::new(),
        };

        let mut open = Vec::new();
        for key in keys {
            if let Ok(entry) = self.load(&key).await
                && entry.state == CircuitState::Open
            {
                open.push(CircuitStats {
                    key,
                    state: entry.state,
                    consecutive_failures: entry.consecutive_failures,
                });
            }
        }
        open.sort_by(|a, b| a.key.cmp(&b.key));
        open
    }
}
