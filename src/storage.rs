//! In-memory implementation of the [`Storage`] read primitive.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::protocols::Storage;

/// A nest's local key/value store held in memory.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-loaded with `entries`. `null` values are skipped, as in
    /// [`MemoryStorage::insert`].
    pub fn with_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let entries = entries
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.into(), v))
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Store `value` under `key`. Storing `null` is the same as removing the key.
    pub async fn insert(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut entries = self.entries.write().await;
        if value.is_null() {
            entries.remove(&key);
        } else {
            entries.insert(key, value);
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, key: &str) -> Option<Value> {
        self.entries.read().await.get(key).cloned()
    }
}
