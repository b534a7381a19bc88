//! Persistent store backends
//!
//! The [`PersistentStore`] trait lives in the sdk. This module provides the
//! SQLite backend used by workers, an in-process backend for tests, and JSON
//! helpers every engine component uses to keep records in the store.

use sdk::errors::StoreError;
use sdk::store::PersistentStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, StoreBackend};

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// An opened store, with the concrete SQLite handle kept for shutdown
pub struct OpenedStore {
    pub store: Arc<dyn PersistentStore>,
    pub sqlite: Option<Arc<SqliteStore>>,
}

/// Open the backend selected in config
pub async fn open_store(config: &Config) -> Result<OpenedStore, StoreError> {
    match config.store.backend {
        StoreBackend::Sqlite => {
            let sqlite = Arc::new(SqliteStore::new(&config.sqlite_path()).await?);
            Ok(OpenedStore {
                store: Arc::clone(&sqlite) as Arc<dyn PersistentStore>,
                sqlite: Some(sqlite),
            })
        }
        StoreBackend::Memory => Ok(OpenedStore {
            store: Arc::new(InMemoryStore::new()),
            sqlite: None,
        }),
    }
}

/// Read and decode a JSON value
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn PersistentStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value
pub async fn set_json<T: Serialize + ?Sized>(
    store: &dyn PersistentStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value)?;
    store.set(key, bytes, ttl).await
}
