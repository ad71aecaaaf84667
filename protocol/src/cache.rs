//! In-memory mirror of one store collection.
//!
//! Entries are keyed by content hash. `set` is an upsert: a pluggable
//! equality decides whether an update changes anything, and real changes
//! are deep-merged over the existing entry with the incoming side winning.
//! Writing back to the store is explicit (`flush`) or periodic via
//! [`AutoSave`].

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::store::{ListFilter, Store};
use crate::types::{Job, JobResult};

/// A value that can live in a [`ValidationCache`].
pub trait CacheRecord: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Content hash the record is keyed by, if it has one.
    fn key(&self) -> Option<&str>;
}

impl CacheRecord for Job {
    fn key(&self) -> Option<&str> {
        Some(self.uuid.as_str()).filter(|k| !k.is_empty())
    }
}

impl CacheRecord for JobResult {
    fn key(&self) -> Option<&str> {
        Some(self.uuid.as_str()).filter(|k| !k.is_empty())
    }
}

pub type EqualityFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

pub struct ValidationCache<T> {
    collection: String,
    store: Arc<dyn Store>,
    entries: HashMap<String, T>,
    synced: bool,
    equals: EqualityFn<T>,
}

impl<T: CacheRecord + PartialEq> ValidationCache<T> {
    pub fn new(collection: impl Into<String>, store: Arc<dyn Store>) -> Self {
        Self::with_equality(collection, store, Arc::new(|a: &T, b: &T| a == b))
    }
}

impl<T: CacheRecord> ValidationCache<T> {
    pub fn with_equality(
        collection: impl Into<String>,
        store: Arc<dyn Store>,
        equals: EqualityFn<T>,
    ) -> Self {
        Self {
            collection: collection.into(),
            store,
            entries: HashMap::new(),
            synced: false,
            equals,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Replace the in-memory set with the store's contents. Safe to call
    /// again to refresh.
    pub async fn sync(&mut self) -> Result<usize> {
        let datasets = self.store.list(&self.collection, &ListFilter::all()).await?;
        let mut entries = HashMap::with_capacity(datasets.len());
        for dataset in datasets {
            match serde_json::from_value::<T>(dataset) {
                Ok(record) => {
                    if let Some(key) = record.key() {
                        entries.insert(key.to_string(), record);
                    }
                }
                Err(e) => {
                    tracing::warn!(collection = %self.collection, error = %e, "Skipping unreadable dataset");
                }
            }
        }
        self.entries = entries;
        self.synced = true;
        tracing::debug!(collection = %self.collection, entries = self.entries.len(), "Cache synchronized");
        Ok(self.entries.len())
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.entries.get(key)
    }

    /// Upsert `record`. Returns whether the cache changed; a record
    /// without a key is refused with `false`.
    pub fn set(&mut self, record: T) -> Result<bool> {
        let Some(next) = self.merged(&record)? else {
            return Ok(false);
        };
        Ok(self.replace(next))
    }

    /// What `set` would store for `record`, leaving the cache untouched.
    /// `None` for records without a key and for updates equal to the
    /// stored entry.
    pub fn merged(&self, record: &T) -> Result<Option<T>> {
        let Some(key) = record.key() else {
            return Ok(None);
        };
        let Some(existing) = self.entries.get(key) else {
            return Ok(Some(record.clone()));
        };
        if (self.equals)(existing, record) {
            return Ok(None);
        }
        let mut merged = serde_json::to_value(existing)?;
        merge_values(&mut merged, serde_json::to_value(record)?);
        Ok(Some(serde_json::from_value(merged)?))
    }

    /// Store `record` as is, without comparing or merging.
    pub fn replace(&mut self, record: T) -> bool {
        let Some(key) = record.key().map(str::to_string) else {
            return false;
        };
        self.entries.insert(key, record);
        true
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    pub fn filter<F>(&self, predicate: F) -> Vec<&T>
    where
        F: Fn(&T) -> bool,
    {
        self.entries.values().filter(|r| predicate(r)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write every entry back to the store in one batch, overwriting what
    /// is there.
    pub async fn flush(&self) -> Result<usize> {
        let datasets = self
            .entries
            .values()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.store.save_all(&self.collection, &datasets).await
    }
}

/// Deep merge, `incoming` wins on conflicting scalar or array fields.
pub fn merge_values(base: &mut Value, incoming: Value) {
    match (base, incoming) {
        (Value::Object(base), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match base.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Periodic flush of a shared cache, started and stopped by its owner.
#[derive(Default)]
pub struct AutoSave {
    task: Option<JoinHandle<()>>,
}

impl AutoSave {
    pub fn enable<T: CacheRecord>(&mut self, cache: Arc<Mutex<ValidationCache<T>>>, period: Duration) {
        self.disable();
        self.task = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            // first tick fires immediately
            timer.tick().await;
            loop {
                timer.tick().await;
                let cache = cache.lock().await;
                match cache.flush().await {
                    Ok(n) => tracing::debug!(collection = %cache.collection(), entries = n, "Auto-saved cache"),
                    Err(e) => tracing::warn!(collection = %cache.collection(), error = %e, "Auto-save failed"),
                }
            }
        }));
    }

    pub fn disable(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for AutoSave {
    fn drop(&mut self) {
        self.disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Dataset, MemoryStore, SaveOptions};
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        uuid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        a: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        b: Option<i64>,
    }

    impl CacheRecord for Entry {
        fn key(&self) -> Option<&str> {
            Some(self.uuid.as_str()).filter(|k| !k.is_empty())
        }
    }

    fn entry(uuid: &str, a: Option<i64>, b: Option<i64>) -> Entry {
        Entry { uuid: uuid.into(), a, b }
    }

    #[tokio::test]
    async fn sync_loads_collection() {
        let store = Arc::new(MemoryStore::new());
        for id in ["x", "y"] {
            store
                .save("entries", &json!({ "uuid": id, "a": 1 }), SaveOptions::default())
                .await
                .unwrap();
        }
        let mut cache: ValidationCache<Entry> = ValidationCache::new("entries", store);
        assert!(!cache.is_synced());
        assert_eq!(cache.sync().await.unwrap(), 2);
        assert!(cache.is_synced());
        assert!(cache.has("x"));
        assert_eq!(cache.get("y").unwrap().a, Some(1));
    }

    #[tokio::test]
    async fn set_reports_insert_noop_and_merge() {
        let mut cache = ValidationCache::new("entries", Arc::new(MemoryStore::new()));
        assert!(cache.set(entry("k", Some(1), None)).unwrap());
        assert!(!cache.set(entry("k", Some(1), None)).unwrap());

        // b is new, a is overwritten, nothing is lost
        assert!(cache.set(entry("k", Some(5), Some(2))).unwrap());
        assert_eq!(cache.get("k"), Some(&entry("k", Some(5), Some(2))));

        // a field absent on the incoming side keeps the stored value
        assert!(cache.set(entry("k", None, Some(9))).unwrap());
        assert_eq!(cache.get("k"), Some(&entry("k", Some(5), Some(9))));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn set_refuses_records_without_key() {
        let mut cache = ValidationCache::new("entries", Arc::new(MemoryStore::new()));
        assert!(!cache.set(entry("", Some(1), None)).unwrap());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn custom_equality_controls_change_detection() {
        let only_a: EqualityFn<Entry> = Arc::new(|x, y| x.a == y.a);
        let mut cache =
            ValidationCache::with_equality("entries", Arc::new(MemoryStore::new()), only_a);
        cache.set(entry("k", Some(1), Some(1))).unwrap();
        assert!(!cache.set(entry("k", Some(1), Some(2))).unwrap());
        assert_eq!(cache.get("k").unwrap().b, Some(1));
    }

    #[tokio::test]
    async fn filter_and_flush() {
        let store = Arc::new(MemoryStore::new());
        let mut cache = ValidationCache::new("entries", store.clone());
        cache.set(entry("a", Some(1), None)).unwrap();
        cache.set(entry("b", Some(2), None)).unwrap();
        assert_eq!(cache.filter(|e| e.a == Some(2)).len(), 1);
        assert_eq!(cache.values().count(), 2);

        assert!(store.list("entries", &ListFilter::all()).await.unwrap().is_empty());
        assert_eq!(cache.flush().await.unwrap(), 2);
        assert_eq!(store.list("entries", &ListFilter::all()).await.unwrap().len(), 2);
    }

    /// Counts single and batch writes on the way to a memory store.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        saves: AtomicUsize,
        batches: AtomicUsize,
    }

    #[async_trait]
    impl Store for CountingStore {
        async fn read(&self, collection: &str, key: &str) -> Result<Dataset> {
            self.inner.read(collection, key).await
        }
        async fn save(&self, collection: &str, dataset: &Dataset, options: SaveOptions) -> Result<bool> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save(collection, dataset, options).await
        }
        async fn save_all(&self, collection: &str, datasets: &[Dataset]) -> Result<usize> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            self.inner.save_all(collection, datasets).await
        }
        async fn update(&self, collection: &str, dataset: &Dataset) -> Result<()> {
            self.inner.update(collection, dataset).await
        }
        async fn list(&self, collection: &str, filter: &ListFilter) -> Result<Vec<Dataset>> {
            self.inner.list(collection, filter).await
        }
        async fn clear(&self, collection: &str) -> Result<()> {
            self.inner.clear(collection).await
        }
    }

    #[tokio::test]
    async fn flush_is_a_single_batch_write() {
        let store = Arc::new(CountingStore::default());
        let mut cache = ValidationCache::new("entries", store.clone());
        for id in ["a", "b", "c", "d"] {
            cache.set(entry(id, Some(1), None)).unwrap();
        }
        assert_eq!(cache.flush().await.unwrap(), 4);
        assert_eq!(store.batches.load(Ordering::SeqCst), 1);
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
        assert_eq!(store.list("entries", &ListFilter::all()).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn merged_previews_without_storing() {
        let mut cache = ValidationCache::new("entries", Arc::new(MemoryStore::new()));
        cache.set(entry("k", Some(1), None)).unwrap();

        let preview = cache.merged(&entry("k", None, Some(2))).unwrap().unwrap();
        assert_eq!(preview, entry("k", Some(1), Some(2)));
        assert_eq!(cache.get("k"), Some(&entry("k", Some(1), None)));
        assert!(cache.merged(&entry("k", Some(1), None)).unwrap().is_none());

        assert!(cache.replace(preview.clone()));
        assert_eq!(cache.get("k"), Some(&preview));
    }

    #[test]
    fn merge_recurses_into_objects() {
        let mut base = json!({ "data": { "x": 1, "y": 2 }, "list": [1, 2] });
        merge_values(&mut base, json!({ "data": { "y": 3 }, "list": [9] }));
        assert_eq!(base, json!({ "data": { "x": 1, "y": 3 }, "list": [9] }));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_save_flushes_periodically_until_disabled() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(Mutex::new(ValidationCache::new("entries", store.clone())));
        cache.lock().await.set(entry("a", Some(1), None)).unwrap();

        let mut auto = AutoSave::default();
        auto.enable(cache.clone(), Duration::from_secs(60));
        assert!(auto.is_enabled());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(store.list("entries", &ListFilter::all()).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(store.list("entries", &ListFilter::all()).await.unwrap().len(), 1);

        auto.disable();
        assert!(!auto.is_enabled());
        cache.lock().await.set(entry("b", Some(1), None)).unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(store.list("entries", &ListFilter::all()).await.unwrap().len(), 1);
    }
}
