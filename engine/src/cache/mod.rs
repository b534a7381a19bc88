//! Tiered Cache
//!
//! Two levels in front of chain computation:
//!
//! 1. **Local**: a bounded in-process LRU (moka). Each entry remembers when it
//!    was inserted and is dropped on access once its ttl has passed.
//! 2. **Shared**: the persistent store under `cache:{key}`, with native ttl.
//!    Every worker process sees the same shared tier.
//!
//! A shared hit repopulates the local tier with the remaining ttl. If the
//! shared store fails the cache keeps working on the local tier alone.

use chrono::{DateTime, Utc};
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use sdk::store::PersistentStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::store::{get_json, set_json};

const SHARED_PREFIX: &str = "cache:";

/// Cached value as kept in the shared tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cache_key: String,
    pub value: Value,
    pub inserted_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl CacheEntry {
    /// Time left before the entry stops being served
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let age = now.signed_duration_since(self.inserted_at).to_std().unwrap_or_default();
        Duration::from_secs(self.ttl_secs)
            .checked_sub(age)
            .filter(|left| !left.is_zero())
    }
}

#[derive(Clone)]
struct LocalEntry {
    value: Arc<Value>,
    inserted_at: Instant,
    ttl: Duration,
}

impl LocalEntry {
    fn is_fresh(&self) -> bool {
        self.inserted_at.elapsed() < self.ttl
    }
}

/// Counters for cache effectiveness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub local_hits: u64,
    pub shared_hits: u64,
    pub misses: u64,
    /// Shared-tier operations that failed and fell back to local-only
    pub degraded: u64,
}

#[derive(Default)]
struct Counters {
    local_hits: AtomicU64,
    shared_hits: AtomicU64,
    misses: AtomicU64,
    degraded: AtomicU64,
}

/// Local LRU in front of the shared persistent store
pub struct TieredCache {
    local: Cache<String, LocalEntry>,
    shared: Arc<dyn PersistentStore>,
    default_ttl: Duration,
    counters: Counters,
}

impl TieredCache {
    /// Create a new cache over `shared`
    pub fn new(shared: Arc<dyn PersistentStore>, config: &CacheConfig) -> Self {
        let local = Cache::builder()
            .max_capacity(config.local_capacity)
            .eviction_policy(EvictionPolicy::lru())
            .build();

        Self {
            local,
            shared,
            default_ttl: Duration::from_secs(config.default_ttl_secs),
            counters: Counters::default(),
        }
    }

    /// Look up `key`, local tier first
    pub async fn get(&self, key: &str) -> Option<Value> {
        if let Some(entry) = self.local.get(key) {
            if entry.is_fresh() {
                self.counters.local_hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.as_ref().clone());
            }
            self.local.invalidate(key);
        }

        let shared_key = format!("{}{}", SHARED_PREFIX, key);
        match get_json::<CacheEntry>(self.shared.as_ref(), &shared_key).await {
            Ok(Some(entry)) => {
                if let Some(remaining) = entry.remaining(Utc::now()) {
                    self.counters.shared_hits.fetch_add(1, Ordering::Relaxed);
                    self.insert_local(key, entry.value.clone(), remaining);
                    return Some(entry.value);
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.counters.degraded.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Shared cache read failed, using local tier only");
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store `value` under `key` in both tiers. `None` uses the default ttl.
    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.insert_local(key, value.clone(), ttl);

        let entry = CacheEntry {
            cache_key: key.to_string(),
            value,
            inserted_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
        };
        let shared_key = format!("{}{}", SHARED_PREFIX, key);
        if let Err(e) = set_json(self.shared.as_ref(), &shared_key, &entry, Some(ttl)).await {
            self.counters.degraded.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, error = %e, "Shared cache write failed, entry kept locally");
        } else {
            debug!(key = %key, ttl_secs = ttl.as_secs(), "Cache entry stored");
        }
    }

    /// Remove `key` from both tiers
    pub async fn invalidate(&self, key: &str) {
        self.local.invalidate(key);
        let shared_key = format!("{}{}", SHARED_PREFIX, key);
        if let Err(e) = self.shared.delete(&shared_key).await {
            self.counters.degraded.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, error = %e, "Shared cache invalidation failed");
        }
    }

    /// Snapshot of the hit/miss counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            local_hits: self.counters.local_hits.load(Ordering::Relaxed),
            shared_hits: self.counters.shared_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            degraded: self.counters.degraded.load(Ordering::Relaxed),
        }
    }

    /// Drop every local entry. The shared tier is untouched.
    pub fn clear_local(&self) {
        self.local.invalidate_all();
    }

    fn insert_local(&self, key: &str, value: Value, ttl: Duration) {
        self.local.insert(
            key.to_string(),
            LocalEntry {
                value: Arc::new(value),
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }
}

/// Canonical form of chain inputs.
///
/// Object keys are sorted, string values trimmed and null object members
/// dropped, so inputs that differ only in formatting share a cache entry.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> =
                map.iter().filter(|(_, v)| !v.is_null()).collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut normalized = Map::new();
            for (k, v) in entries {
                normalized.insert(k.clone(), normalize(v));
            }
            Value::Object(normalized)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::String(s) => Value::String(s.trim().to_string()),
        other => other.clone(),
    }
}

/// Writes `value` as compact JSON with object keys in sorted order
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Cache key for a chain run: hex sha256 of chain name, normalized inputs
/// and owner
pub fn cache_key(chain_name: &str, inputs: &Value, owner_id: &str) -> String {
    let mut canonical = String::new();
    write_canonical(&normalize(inputs), &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(chain_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    hasher.update([0u8]);
    hasher.update(owner_id.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use sdk::errors::StoreError;
    use serde_json::json;

    struct BrokenStore;

    #[async_trait]
    impl PersistentStore for BrokenStore {
        fn name(&self) -> &str {
            "broken"
        }
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn set(&self, _: &str, _: Vec<u8>, _: Option<Duration>) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn keys(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
    }

    fn cache_over(store: Arc<dyn PersistentStore>) -> TieredCache {
        TieredCache::new(store, &CacheConfig::default())
    }

    #[test]
    fn test_normalize_sorts_trims_and_drops_nulls() {
        let value = json!({"b": " x ", "a": null, "c": [" y", {"z": null, "w": 1}]});
        assert_eq!(normalize(&value), json!({"b": "x", "c": ["y", {"w": 1}]}));
    }

    #[test]
    fn test_cache_key_ignores_formatting() {
        let a = cache_key("task_analysis", &json!({"title": "Write report", "due": null}), "u1");
        let b = cache_key("task_analysis", &json!({"title": "  Write report "}), "u1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_cache_key_separates_owner_and_chain() {
        let inputs = json!({"title": "Write report"});
        let base = cache_key("task_analysis", &inputs, "u1");
        assert_ne!(base, cache_key("task_analysis", &inputs, "u2"));
        assert_ne!(base, cache_key("task_decomposition", &inputs, "u1"));
    }

    #[tokio::test]
    async fn test_set_then_get_hits_local() {
        let cache = cache_over(Arc::new(InMemoryStore::new()));
        cache.set("k", json!({"ok": true}), None).await;

        assert_eq!(cache.get("k").await, Some(json!({"ok": true})));
        assert_eq!(cache.stats().local_hits, 1);
    }

    #[tokio::test]
    async fn test_shared_hit_populates_local() {
        let store: Arc<dyn PersistentStore> = Arc::new(InMemoryStore::new());
        let writer = cache_over(Arc::clone(&store));
        writer.set("k", json!("v"), Some(Duration::from_secs(60))).await;

        let reader = cache_over(store);
        assert_eq!(reader.get("k").await, Some(json!("v")));
        assert_eq!(reader.get("k").await, Some(json!("v")));

        let stats = reader.stats();
        assert_eq!(stats.shared_hits, 1);
        assert_eq!(stats.local_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_local_entry_not_served() {
        let cache = cache_over(Arc::new(BrokenStore));
        cache.set("k", json!(1), Some(Duration::from_secs(5))).await;

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get("k").await, None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_broken_shared_tier_degrades_to_local() {
        let cache = cache_over(Arc::new(BrokenStore));
        cache.set("k", json!("local"), None).await;

        assert_eq!(cache.get("k").await, Some(json!("local")));
        assert_eq!(cache.get("other").await, None);
        let stats = cache.stats();
        assert_eq!(stats.degraded, 2);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_invalidate_removes_both_tiers() {
        let store: Arc<dyn PersistentStore> = Arc::new(InMemoryStore::new());
        let cache = cache_over(Arc::clone(&store));
        cache.set("k", json!(1), None).await;
        cache.invalidate("k").await;

        assert_eq!(cache.get("k").await, None);
        assert!(store.get("cache:k").await.unwrap().is_none());
    }

    #[test]
    fn test_entry_remaining() {
        let entry = CacheEntry {
            cache_key: "k".to_string(),
            value: json!(null),
            inserted_at: Utc::now() - chrono::Duration::seconds(30),
            ttl_secs: 60,
        };
        let left = entry.remaining(Utc::now()).unwrap();
        assert!(left <= Duration::from_secs(30));
        assert!(entry.remaining(Utc::now() + chrono::Duration::seconds(31)).is_none());
    }
}
