//! Namespaced, compressed response cache over a [`KvStore`] backend.
//!
//! Entry wire format: an 8-byte little-endian epoch-millis write timestamp,
//! followed by gzip-compressed JSON of the cached value. The timestamp
//! prefix lets [`Cache::trim`] read entry ages without decompressing.
//!
//! Every read and write failure is swallowed and logged: a broken cache
//! degrades to a cache miss, never to a failed request.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::traits::KvStore;

const TIMESTAMP_LEN: usize = 8;

/// Handle onto one logical cache within a shared [`KvStore`].
///
/// Each handle owns a unique name-derived key prefix, so distinct logical
/// caches sharing one backend can never collide. Cloning shares the hit
/// counter and the backend.
#[derive(Clone)]
pub struct Cache<S: KvStore> {
    name: String,
    key_stem: String,
    store: S,
    hit_count: Arc<AtomicU64>,
}

impl<S: KvStore> Cache<S> {
    pub fn new(name: impl Into<String>, store: S) -> Self {
        let name = name.into();
        let key_stem = format!("QUARRY_{name}_");
        Self {
            name,
            key_stem,
            store,
            hit_count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of successful `get` calls since construction.
    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    fn real_key(&self, key: &str) -> String {
        format!("{}{}", self.key_stem, key)
    }

    /// Fetch and decode a cached value. Returns `None` on miss and on any
    /// decode or backend failure.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let real_key = self.real_key(key);
        let raw = match self.store.get(&real_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(cache = %self.name, key, error = %err, "cache read failed");
                return None;
            }
        };
        let mut value = match decode_value(&raw) {
            Some(value) => value,
            None => {
                tracing::warn!(cache = %self.name, key, "cache entry could not be decoded");
                return None;
            }
        };
        restore_dates(&mut value);
        restore_parent_refs(&mut value);
        match serde_json::from_value(value) {
            Ok(value) => {
                self.hit_count.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Err(err) => {
                tracing::warn!(cache = %self.name, key, error = %err, "cached value failed to deserialize");
                None
            }
        }
    }

    /// Encode and persist a value under this cache's namespace.
    ///
    /// On a backend write failure the cache trims once and retries exactly
    /// once; a second failure is logged and dropped.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) {
        let real_key = self.real_key(key);
        let raw = match encode_entry(Utc::now().timestamp_millis(), value) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(cache = %self.name, key, error = %err, "failed to encode cache entry");
                return;
            }
        };
        if let Err(err) = self.store.set(&real_key, raw.clone()).await {
            tracing::debug!(cache = %self.name, key, error = %err, "cache write failed, trimming and retrying");
            self.trim().await;
            if let Err(err) = self.store.set(&real_key, raw).await {
                tracing::warn!(cache = %self.name, key, error = %err, "cache write failed on second attempt after trim");
            }
        }
    }

    pub async fn remove(&self, key: &str) {
        let real_key = self.real_key(key);
        if let Err(err) = self.store.remove(&real_key).await {
            tracing::warn!(cache = %self.name, key, error = %err, "cache remove failed");
        }
    }

    /// Enumerate this cache's logical keys (namespace prefix stripped).
    pub async fn keys(&self) -> Vec<String> {
        match self.store.keys().await {
            Ok(keys) => keys
                .into_iter()
                .filter_map(|k| k.strip_prefix(&self.key_stem).map(str::to_string))
                .collect(),
            Err(err) => {
                tracing::warn!(cache = %self.name, error = %err, "cache key enumeration failed");
                Vec::new()
            }
        }
    }

    /// Remove every entry in this cache's namespace.
    pub async fn clear(&self) {
        tracing::info!(cache = %self.name, "clearing cache");
        for key in self.keys().await {
            self.remove(&key).await;
        }
    }

    /// Evict the oldest quartile of entries.
    ///
    /// The cutoff is the timestamp at the 25th percentile of the ascending
    /// sort; every entry with `timestamp <= cutoff` is deleted, ties
    /// included. Runs against a snapshot of keys and may race benignly
    /// with concurrent writes.
    pub async fn trim(&self) {
        let keys = self.keys().await;
        let mut stamped = Vec::with_capacity(keys.len());
        for key in &keys {
            let real_key = self.real_key(key);
            match self.store.get(&real_key).await {
                Ok(Some(raw)) => match decode_timestamp(&raw) {
                    Some(timestamp) => stamped.push((real_key, timestamp)),
                    None => {
                        tracing::debug!(cache = %self.name, key, "no timestamp for cache entry");
                    }
                },
                _ => {
                    tracing::debug!(cache = %self.name, key, "couldn't read cache entry during trim");
                }
            }
        }
        if stamped.is_empty() {
            return;
        }

        let mut timestamps: Vec<i64> = stamped.iter().map(|(_, ts)| *ts).collect();
        timestamps.sort_unstable();
        let cutoff_index = (timestamps.len() as f64 * 0.25).floor() as usize;
        let Some(&cutoff) = timestamps.get(cutoff_index) else {
            return;
        };

        let mut removed = 0usize;
        for (real_key, timestamp) in stamped {
            if timestamp <= cutoff && self.store.remove(&real_key).await.is_ok() {
                removed += 1;
            }
        }
        tracing::info!(cache = %self.name, removed, "trimmed cache");
    }
}

fn encode_entry<T: Serialize>(timestamp_millis: i64, value: &T) -> std::io::Result<Vec<u8>> {
    let json = serde_json::to_vec(value).map_err(std::io::Error::other)?;
    let mut raw = timestamp_millis.to_le_bytes().to_vec();
    let mut encoder = GzEncoder::new(&mut raw, Compression::default());
    encoder.write_all(&json)?;
    encoder.finish()?;
    Ok(raw)
}

fn decode_timestamp(raw: &[u8]) -> Option<i64> {
    raw.get(..TIMESTAMP_LEN)
        .and_then(|prefix| prefix.try_into().ok())
        .map(i64::from_le_bytes)
}

fn decode_value(raw: &[u8]) -> Option<Value> {
    let compressed = raw.get(TIMESTAMP_LEN..)?;
    let mut json = Vec::new();
    GzDecoder::new(compressed).read_to_end(&mut json).ok()?;
    serde_json::from_slice(&json).ok()
}

/// Re-hydrate date-like string fields after a JSON round-trip.
///
/// Any object field whose key ends in `date` and whose value is a string is
/// parsed with chrono and rewritten as canonical RFC 3339, so typed
/// `DateTime` fields deserialize even from entries written by producers
/// that stored bare date strings. Best-effort: unparseable values are
/// logged and left as-is.
fn restore_dates(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if key.ends_with("date") {
                    if let Value::String(text) = child {
                        match parse_datetime(text) {
                            Some(datetime) => *child = Value::String(datetime.to_rfc3339()),
                            None => {
                                tracing::warn!(key = %key, value = %text, "could not parse cached date field");
                            }
                        }
                        continue;
                    }
                }
                restore_dates(child);
            }
        }
        Value::Array(items) => {
            for item in items {
                restore_dates(item);
            }
        }
        _ => {}
    }
}

fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(datetime) = DateTime::parse_from_rfc3339(text) {
        return Some(datetime.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Restore parent back-references that collapsed to `{}` in serialization.
///
/// Any object field whose key starts with `parent_` and whose value is an
/// empty object is replaced with a copy of the immediate parent object
/// (minus the parent's own back-references, so the restoration cannot
/// recurse). Best-effort: a back-reference with no enclosing parent is
/// logged and left empty.
fn restore_parent_refs(value: &mut Value) {
    walk_parent_refs(value, None);
}

fn walk_parent_refs(value: &mut Value, parent: Option<&Value>) {
    match value {
        Value::Object(map) => {
            let snapshot = Value::Object(
                map.iter()
                    .filter(|(key, _)| !key.starts_with("parent_"))
                    .map(|(key, child)| (key.clone(), child.clone()))
                    .collect(),
            );
            for (key, child) in map.iter_mut() {
                let is_collapsed_backref = key.starts_with("parent_")
                    && child.as_object().is_some_and(serde_json::Map::is_empty);
                if is_collapsed_backref {
                    match parent {
                        Some(parent) => *child = parent.clone(),
                        None => {
                            tracing::warn!(key = %key, "no enclosing object to restore back-reference");
                        }
                    }
                } else {
                    walk_parent_refs(child, Some(&snapshot));
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_parent_refs(item, parent);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderPage {
        id: String,
        order_date: DateTime<Utc>,
        total: f64,
    }

    fn sample_page() -> OrderPage {
        OrderPage {
            id: "114-000".to_string(),
            order_date: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
            total: 41.99,
        }
    }

    #[tokio::test]
    async fn roundtrip_typed_value() {
        let cache = Cache::new("orders", MemoryStore::new());
        cache.set("https://x/order/1", &sample_page()).await;
        let got: OrderPage = cache.get("https://x/order/1").await.unwrap();
        assert_eq!(got, sample_page());
        assert_eq!(cache.hit_count(), 1);
    }

    #[tokio::test]
    async fn miss_returns_none_without_counting_a_hit() {
        let cache = Cache::new("orders", MemoryStore::new());
        let got: Option<OrderPage> = cache.get("absent").await;
        assert!(got.is_none());
        assert_eq!(cache.hit_count(), 0);
    }

    #[tokio::test]
    async fn garbage_entry_reads_as_miss() {
        let store = MemoryStore::new();
        let cache: Cache<MemoryStore> = Cache::new("orders", store.clone());
        store
            .set("QUARRY_orders_bad", b"not a cache entry".to_vec())
            .await
            .unwrap();
        let got: Option<OrderPage> = cache.get("bad").await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn bare_date_strings_rehydrate_into_datetimes() {
        let store = MemoryStore::new();
        let cache: Cache<MemoryStore> = Cache::new("orders", store.clone());

        // A producer that stored an un-typed date string.
        let legacy = json!({"id": "114-000", "order_date": "2024-03-01", "total": 41.99});
        let raw = encode_entry(1, &legacy).unwrap();
        store.set("QUARRY_orders_legacy", raw).await.unwrap();

        let got: OrderPage = cache.get("legacy").await.unwrap();
        assert_eq!(
            got.order_date,
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn unparseable_date_field_is_left_alone() {
        let cache = Cache::new("orders", MemoryStore::new());
        let value = json!({"ship_date": "sometime soon"});
        cache.set("k", &value).await;
        let got: Value = cache.get("k").await.unwrap();
        assert_eq!(got["ship_date"], json!("sometime soon"));
    }

    #[tokio::test]
    async fn collapsed_parent_backrefs_are_restored() {
        let cache = Cache::new("orders", MemoryStore::new());
        let order = json!({
            "id": "114-000",
            "items": [
                {"name": "widget", "parent_order": {}},
                {"name": "gadget", "parent_order": {}}
            ]
        });
        cache.set("k", &order).await;
        let got: Value = cache.get("k").await.unwrap();
        assert_eq!(got["items"][0]["parent_order"]["id"], json!("114-000"));
        assert_eq!(got["items"][1]["parent_order"]["id"], json!("114-000"));
        // The restored copy carries no back-references of its own.
        assert!(got["items"][0]["parent_order"].get("parent_order").is_none());
    }

    #[tokio::test]
    async fn namespaces_do_not_collide() {
        let store = MemoryStore::new();
        let orders: Cache<MemoryStore> = Cache::new("orders", store.clone());
        let pages: Cache<MemoryStore> = Cache::new("pages", store.clone());

        orders.set("same-key", &json!(1)).await;
        pages.set("same-key", &json!(2)).await;

        assert_eq!(orders.get::<Value>("same-key").await, Some(json!(1)));
        assert_eq!(pages.get::<Value>("same-key").await, Some(json!(2)));
        assert_eq!(orders.keys().await, vec!["same-key".to_string()]);

        orders.clear().await;
        assert!(orders.keys().await.is_empty());
        assert_eq!(pages.get::<Value>("same-key").await, Some(json!(2)));
    }

    #[tokio::test]
    async fn trim_evicts_oldest_quartile_including_cutoff_ties() {
        let store = MemoryStore::new();
        let cache: Cache<MemoryStore> = Cache::new("orders", store.clone());
        for ts in 1..=8i64 {
            let raw = encode_entry(ts, &json!(ts)).unwrap();
            store.set(&format!("QUARRY_orders_{ts}"), raw).await.unwrap();
        }

        cache.trim().await;

        // cutoff = sorted[floor(8 * 0.25)] = timestamp 3; 1..=3 evicted.
        let mut keys = cache.keys().await;
        keys.sort();
        assert_eq!(keys, vec!["4", "5", "6", "7", "8"]);
    }

    #[tokio::test]
    async fn quota_failure_trims_and_retries_once() {
        // Room for a handful of entries; the next write trips the quota.
        let store = MemoryStore::with_quota(700);
        let cache: Cache<MemoryStore> = Cache::new("orders", store.clone());

        let mut filled = 0u32;
        loop {
            let key = format!("k{filled}");
            let raw = encode_entry(filled as i64 + 1, &json!(vec![filled; 16])).unwrap();
            if store.set(&cache.real_key(&key), raw).await.is_err() {
                break;
            }
            filled += 1;
        }
        assert!(filled >= 4, "quota should admit a few entries, got {filled}");

        // set() must recover by trimming the oldest quartile and retrying.
        cache.set("fresh", &json!(vec![0u32; 16])).await;
        let got: Option<Value> = cache.get("fresh").await;
        assert!(got.is_some(), "write should succeed after trim");
    }
}
