use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::StoreError;
use crate::traits::KvStore;

/// In-memory [`KvStore`] backend.
///
/// Suitable for a single scraping session, where the cache's job is to
/// deduplicate repeat fetches of the same page. An optional byte quota
/// makes it behave like a hard-bounded store (browser local storage,
/// embedded KV), exercising the cache's trim-and-retry path.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    quota_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that rejects writes once keys + values would exceed `quota_bytes`.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            quota_bytes: Some(quota_bytes),
        }
    }
}

impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(quota) = self.quota_bytes {
            let used: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if used + key.len() + value.len() > quota {
                return Err(StoreError::QuotaExceeded);
            }
        }
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.lock().unwrap().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_remove_roundtrip() {
        let store = MemoryStore::new();
        store.set("a", b"one".to_vec()).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"one".to_vec()));
        store.remove("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn quota_rejects_oversized_writes() {
        let store = MemoryStore::with_quota(16);
        store.set("a", vec![0u8; 10]).await.unwrap();
        let err = store.set("b", vec![0u8; 10]).await.unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded));

        // Replacing an existing key does not double-count it.
        store.set("a", vec![0u8; 12]).await.unwrap();
    }

    #[tokio::test]
    async fn keys_enumerates_everything() {
        let store = MemoryStore::new();
        store.set("x", vec![1]).await.unwrap();
        store.set("y", vec![2]).await.unwrap();
        let mut keys = store.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["x".to_string(), "y".to_string()]);
    }
}
