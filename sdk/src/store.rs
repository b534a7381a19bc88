//! Persistent store interface
//!
//! A byte-oriented key/value store shared by every worker process. It backs
//! the memory store, the shared cache tier, the action planner and the
//! scheduler's owner queue. Keys are namespaced by the caller
//! (`memory:{owner}:...`, `cache:...`, `plan:...`).

use async_trait::async_trait;
use std::time::Duration;

use crate::errors::StoreError;

/// Key/value store with optional per-key expiry
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Backend name used in logs (e.g. "sqlite", "memory")
    fn name(&self) -> &str;

    /// Returns the value stored under `key`, or `None` if absent or expired
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// With `ttl` set, the value stops being returned once the ttl elapses.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
        -> Result<(), StoreError>;

    /// Removes `key`. Returns whether a live value was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Lists live keys starting with `prefix`, in lexicographic order
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
