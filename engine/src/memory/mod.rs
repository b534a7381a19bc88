//! Memory Store
//!
//! Owner-scoped records kept in the persistent store under
//! `memory:{owner}:{class}:{key}`. The owner segment is escaped so that an
//! owner id containing `:` cannot reach into another owner's keys. A write to an existing key overwrites the
//! record in place: `created_at` is kept and `updated_at` refreshed.
//!
//! Expiry is tracked on the record itself. Reads hide expired records and
//! [`MemoryStore::sweep`] deletes them.

use chrono::{DateTime, Utc};
use sdk::errors::StoreError;
use sdk::store::PersistentStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MemoryConfig;
use crate::store::{get_json, set_json};

const PREFIX: &str = "memory:";

/// Owner id as a key segment: `%` and `:` are percent-encoded
fn owner_segment(owner_id: &str) -> String {
    owner_id.replace('%', "%25").replace(':', "%3A")
}

/// How long a memory is meant to live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionClass {
    ShortTerm,
    Working,
    LongTerm,
    Semantic,
}

impl RetentionClass {
    pub const ALL: [RetentionClass; 4] = [
        RetentionClass::ShortTerm,
        RetentionClass::Working,
        RetentionClass::LongTerm,
        RetentionClass::Semantic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionClass::ShortTerm => "short_term",
            RetentionClass::Working => "working",
            RetentionClass::LongTerm => "long_term",
            RetentionClass::Semantic => "semantic",
        }
    }
}

impl fmt::Display for RetentionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetentionClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| format!("unknown retention class '{}'", s))
    }
}

/// A remembered value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub owner_id: String,
    pub retention_class: RetentionClass,
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl MemoryRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Owner-scoped memory over the persistent store
pub struct MemoryStore {
    store: Arc<dyn PersistentStore>,
    config: MemoryConfig,
}

impl MemoryStore {
    /// Create a new memory store
    pub fn new(store: Arc<dyn PersistentStore>, config: MemoryConfig) -> Self {
        Self { store, config }
    }

    /// Ttl applied when `remember` is called without one
    pub fn default_ttl(&self, class: RetentionClass) -> Option<Duration> {
        let secs = match class {
            RetentionClass::ShortTerm => Some(self.config.short_term_ttl_secs),
            RetentionClass::Working => Some(self.config.working_ttl_secs),
            RetentionClass::LongTerm => self.config.long_term_ttl_secs,
            RetentionClass::Semantic => self.config.semantic_ttl_secs,
        };
        secs.map(Duration::from_secs)
    }

    /// Number of recent working records chains receive as context
    pub fn context_records(&self) -> usize {
        self.config.context_records
    }

    fn record_key(owner_id: &str, class: RetentionClass, key: &str) -> String {
        format!("{}{}:{}:{}", PREFIX, owner_segment(owner_id), class.as_str(), key)
    }

    fn class_prefix(owner_id: &str, class: RetentionClass) -> String {
        format!("{}{}:{}:", PREFIX, owner_segment(owner_id), class.as_str())
    }

    /// Store `value`, replacing any live record under the same key
    pub async fn remember(
        &self,
        owner_id: &str,
        class: RetentionClass,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<MemoryRecord, StoreError> {
        let store_key = Self::record_key(owner_id, class, key);
        let now = Utc::now();

        let created_at = match get_json::<MemoryRecord>(self.store.as_ref(), &store_key).await? {
            Some(existing) if !existing.is_expired(now) => existing.created_at,
            _ => now,
        };

        let expires_at = ttl
            .or_else(|| self.default_ttl(class))
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| now + ttl);

        let record = MemoryRecord {
            owner_id: owner_id.to_string(),
            retention_class: class,
            key: key.to_string(),
            value,
            created_at,
            updated_at: now,
            expires_at,
        };

        set_json(self.store.as_ref(), &store_key, &record, None).await?;
        debug!(owner_id = %owner_id, class = %class, key = %key, "Memory stored");
        Ok(record)
    }

    /// Fetch a live record
    pub async fn recall(
        &self,
        owner_id: &str,
        class: RetentionClass,
        key: &str,
    ) -> Result<Option<MemoryRecord>, StoreError> {
        let store_key = Self::record_key(owner_id, class, key);
        let record = get_json::<MemoryRecord>(self.store.as_ref(), &store_key).await?;
        Ok(record.filter(|r| !r.is_expired(Utc::now()) && r.owner_id == owner_id))
    }

    /// Most recently updated live records of a class, newest first
    pub async fn recall_recent(
        &self,
        owner_id: &str,
        class: RetentionClass,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let keys = self.store.keys(&Self::class_prefix(owner_id, class)).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            match get_json::<MemoryRecord>(self.store.as_ref(), &key).await {
                Ok(Some(record))
                    if !record.is_expired(now)
                        && record.owner_id == owner_id
                        && record.retention_class == class =>
                {
                    records.push(record)
                }
                Ok(_) => {}
                Err(StoreError::Serialization(e)) => {
                    warn!(key = %key, error = %e, "Skipping unreadable memory record");
                }
                Err(e) => return Err(e),
            }
        }

        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.key.cmp(&b.key)));
        records.truncate(limit);
        Ok(records)
    }

    /// Delete a record. Returns whether one existed.
    pub async fn forget(
        &self,
        owner_id: &str,
        class: RetentionClass,
        key: &str,
    ) -> Result<bool, StoreError> {
        self.store
            .delete(&Self::record_key(owner_id, class, key))
            .await
    }

    /// Delete every record of an owner, across all classes
    pub async fn forget_all(&self, owner_id: &str) -> Result<usize, StoreError> {
        let mut removed = 0;
        for class in RetentionClass::ALL {
            for key in self.store.keys(&Self::class_prefix(owner_id, class)).await? {
                let owned = matches!(
                    get_json::<MemoryRecord>(self.store.as_ref(), &key).await,
                    Ok(Some(record)) if record.owner_id == owner_id
                );
                // unreadable records are left to the sweep
                if owned && self.store.delete(&key).await? {
                    removed += 1;
                }
            }
        }
        info!(owner_id = %owner_id, removed, "Forgot all memories");
        Ok(removed)
    }

    /// Delete expired and unreadable records of every owner.
    /// Returns the number deleted.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut removed = 0;

        for key in self.store.keys(PREFIX).await? {
            let expired = match get_json::<MemoryRecord>(self.store.as_ref(), &key).await {
                Ok(Some(record)) => record.is_expired(now),
                Ok(None) => false,
                Err(StoreError::Serialization(_)) => true,
                Err(e) => return Err(e),
            };
            if expired && self.store.delete(&key).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Memory sweep removed expired records");
        }
        Ok(removed)
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `token` is cancelled
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Memory sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            warn!(error = %e, "Memory sweep failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn memory() -> (Arc<InMemoryStore>, MemoryStore) {
        let store = Arc::new(InMemoryStore::new());
        let memory = MemoryStore::new(
            Arc::clone(&store) as Arc<dyn PersistentStore>,
            MemoryConfig::default(),
        );
        (store, memory)
    }

    #[test]
    fn test_retention_class_parse() {
        assert_eq!("long_term".parse::<RetentionClass>(), Ok(RetentionClass::LongTerm));
        assert!("forever".parse::<RetentionClass>().is_err());
    }

    #[test]
    fn test_default_ttls() {
        let (_, memory) = memory();
        assert_eq!(
            memory.default_ttl(RetentionClass::ShortTerm),
            Some(Duration::from_secs(3_600))
        );
        assert_eq!(
            memory.default_ttl(RetentionClass::Working),
            Some(Duration::from_secs(86_400))
        );
        assert_eq!(memory.default_ttl(RetentionClass::LongTerm), None);
        assert_eq!(memory.default_ttl(RetentionClass::Semantic), None);
    }

    #[tokio::test]
    async fn test_overwrite_preserves_created_at() {
        let (store, memory) = memory();
        let first = memory
            .remember("u1", RetentionClass::Working, "focus", json!(1), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = memory
            .remember("u1", RetentionClass::Working, "focus", json!(2), None)
            .await
            .unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at > first.updated_at);
        assert_eq!(store.len().await, 1);

        let recalled = memory
            .recall("u1", RetentionClass::Working, "focus")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recalled.value, json!(2));
    }

    #[tokio::test]
    async fn test_owners_are_isolated() {
        let (_, memory) = memory();
        memory
            .remember("u1", RetentionClass::Working, "k", json!("mine"), None)
            .await
            .unwrap();
        assert!(memory
            .recall("u2", RetentionClass::Working, "k")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_owner_ids_with_colons_do_not_overlap() {
        let (store, memory) = memory();
        memory
            .remember("u1:working", RetentionClass::Working, "secret", json!("theirs"), None)
            .await
            .unwrap();
        memory
            .remember("u1", RetentionClass::Working, "focus", json!("mine"), None)
            .await
            .unwrap();

        let recent = memory
            .recall_recent("u1", RetentionClass::Working, 10)
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].key, "focus");

        // same flattened key as u1:working/working/secret before escaping
        assert!(memory
            .recall("u1", RetentionClass::Working, "working:secret")
            .await
            .unwrap()
            .is_none());

        assert_eq!(memory.forget_all("u1").await.unwrap(), 1);
        assert_eq!(store.len().await, 1);
        let theirs = memory
            .recall("u1:working", RetentionClass::Working, "secret")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(theirs.value, json!("theirs"));
    }

    #[test]
    fn test_owner_segment_escapes_separators() {
        assert_eq!(owner_segment("u1"), "u1");
        assert_eq!(owner_segment("a:b"), "a%3Ab");
        assert_eq!(owner_segment("50%:x"), "50%25%3Ax");
    }

    #[tokio::test]
    async fn test_recall_recent_orders_newest_first() {
        let (_, memory) = memory();
        for key in ["a", "b", "c"] {
            memory
                .remember("u1", RetentionClass::Working, key, json!(key), None)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        memory
            .remember("u1", RetentionClass::ShortTerm, "other", json!(0), None)
            .await
            .unwrap();

        let recent = memory
            .recall_recent("u1", RetentionClass::Working, 2)
            .await
            .unwrap();
        let keys: Vec<&str> = recent.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_expired_records_hidden_then_swept() {
        let (store, memory) = memory();
        memory
            .remember(
                "u1",
                RetentionClass::ShortTerm,
                "blip",
                json!(true),
                Some(Duration::from_millis(10)),
            )
            .await
            .unwrap();
        memory
            .remember("u1", RetentionClass::LongTerm, "keep", json!(true), None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(memory
            .recall("u1", RetentionClass::ShortTerm, "blip")
            .await
            .unwrap()
            .is_none());
        assert_eq!(memory.sweep().await.unwrap(), 1);
        assert_eq!(store.len().await, 1);
        assert_eq!(memory.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_forget_and_forget_all() {
        let (store, memory) = memory();
        for class in RetentionClass::ALL {
            memory
                .remember("u1", class, "k", json!(1), None)
                .await
                .unwrap();
        }
        memory
            .remember("u2", RetentionClass::Working, "k", json!(1), None)
            .await
            .unwrap();

        assert!(memory.forget("u1", RetentionClass::Working, "k").await.unwrap());
        assert!(!memory.forget("u1", RetentionClass::Working, "k").await.unwrap());
        assert_eq!(memory.forget_all("u1").await.unwrap(), 3);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let (_, memory) = memory();
        let token = CancellationToken::new();
        let handle = Arc::new(memory).spawn_sweeper(Duration::from_millis(5), token.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        handle.await.unwrap();
    }
}
