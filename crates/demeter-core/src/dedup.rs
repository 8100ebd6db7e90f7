//! Deduplication filter for produced records.
//!
//! Overlapping runs re-extract mostly unchanged content; re-delivering it
//! downstream is wasted writes. The filter keys on
//! `(entity_type, content_hash)` in the shared keyed store with a TTL: a
//! hit discards the record, a miss records the key and forwards. A store
//! failure forwards the record (fail open) — the sink upsert is idempotent,
//! so a duplicate delivery is wasteful but harmless.

use std::time::Duration;

use crate::error::AppError;
use crate::records::{EntityType, ExtractedRecord};
use crate::store::KeyedStore;

/// Configuration for the deduplication filter.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// How long a seen `(entity, hash)` pair suppresses re-delivery.
    pub ttl: Duration,
}

impl Default for DedupConfig {
    /// One day: overlapping daily runs dedup, weekly drift re-delivers.
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// TTL-keyed record deduplication over a shared keyed store.
#[derive(Clone)]
pub struct DedupFilter<K: KeyedStore> {
    store: K,
    config: DedupConfig,
}

impl<K: KeyedStore> DedupFilter<K> {
    pub fn new(store: K, config: DedupConfig) -> Self {
        Self { store, config }
    }

    fn store_key(entity: EntityType, content_hash: &str) -> String {
        format!("dd:{}:{}", entity.as_str(), content_hash)
    }

    /// Returns true when the record should be forwarded (first sighting
    /// within the TTL, or store unreachable).
    pub async fn admit(&self, record: &ExtractedRecord) -> bool {
        let key = Self::store_key(record.entity_type, &record.content_hash);

        match self.store.get(&key).await {
            Ok(Some(_)) => {
                tracing::debug!(
                    entity = %record.entity_type,
                    natural_key = %record.natural_key,
                    "Unchanged record within dedup TTL, discarding"
                );
                false
            }
            Ok(None) => {
                if let Err(e) = self.store.set(&key, "1", Some(self.config.ttl)).await {
                    tracing::warn!(key = %key, error = %e, "Store unreachable recording dedup key");
                }
                true
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Store unreachable, forwarding record");
                true
            }
        }
    }
}

impl DedupFilter<crate::store::MemoryStore> {
    /// Filter over a fresh in-process store (single-run usage).
    pub fn in_memory(config: DedupConfig) -> Self {
        Self::new(crate::store::MemoryStore::new(), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RecordFields;
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;
    use url::Url;

    fn record(code: &str, title: &str) -> ExtractedRecord {
        let mut map = BTreeMap::new();
        map.insert("code".to_string(), code.to_string());
        map.insert("title".to_string(), title.to_string());
        let fields = RecordFields::from_map(EntityType::Standard, map).unwrap();
        let url = Url::parse("https://portal.example.mx/detail").unwrap();
        ExtractedRecord::new(fields, &url)
    }

    #[tokio::test]
    async fn test_same_hash_twice_forwards_once() {
        let filter = DedupFilter::new(MemoryStore::new(), DedupConfig::default());
        let a = record("EC0217", "Impartición de cursos presenciales");
        let b = record("EC0217", "Impartición de cursos presenciales");

        assert!(filter.admit(&a).await);
        assert!(!filter.admit(&b).await);
    }

    #[tokio::test]
    async fn test_changed_content_forwards_again() {
        let filter = DedupFilter::new(MemoryStore::new(), DedupConfig::default());
        let a = record("EC0217", "Impartición de cursos presenciales");
        let b = record("EC0217", "Impartición de cursos presenciales v2");

        assert!(filter.admit(&a).await);
        assert!(filter.admit(&b).await);
    }

    #[tokio::test]
    async fn test_ttl_expiry_forwards_again() {
        let filter = DedupFilter::new(
            MemoryStore::new(),
            DedupConfig {
                ttl: Duration::from_millis(20),
            },
        );
        let a = record("EC0217", "Impartición de cursos presenciales");

        assert!(filter.admit(&a).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(filter.admit(&a).await);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_unreachable() {
        let filter = DedupFilter::new(crate::testutil::FailingStore, DedupConfig::default());
        let a = record("EC0217", "Impartición de cursos presenciales");

        // The sink upsert is idempotent, so forwarding twice is the safe
        // failure mode.
        assert!(filter.admit(&a).await);
        assert!(filter.admit(&a).await);
    }

    #[tokio::test]
    async fn test_entity_type_partitions_keys() {
        let filter = DedupFilter::new(MemoryStore::new(), DedupConfig::default());

        // Same field content under two entity types must not collide:
        // the key includes the entity tag.
        let std_rec = record("EC0217", "Impartición de cursos presenciales");
        let mut map = BTreeMap::new();
        map.insert("key".to_string(), "ECE001-99".to_string());
        map.insert("name".to_string(), "Instituto".to_string());
        let cert = ExtractedRecord::new(
            RecordFields::from_map(EntityType::Certifier, map).unwrap(),
            &Url::parse("https://portal.example.mx/cert").unwrap(),
        );

        assert!(filter.admit(&std_rec).await);
        assert!(filter.admit(&cert).await);
    }
}
