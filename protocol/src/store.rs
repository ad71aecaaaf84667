//! Store collaborator interface.
//!
//! Datasets are JSON objects addressed by their `uuid` field. Backends
//! only need to serialize writes per key; the coordination core takes no
//! locks of its own on the store.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::error::{MeshError, Result};

pub type Dataset = Value;

/// Field every dataset is keyed by.
pub const KEY_FIELD: &str = "uuid";

#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    /// Replace an existing dataset with the same key instead of skipping it.
    pub allow_duplicates: bool,
}

/// Field-equality filter for [`Store::list`]. An empty filter matches
/// everything.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    fields: serde_json::Map<String, Value>,
}

impl ListFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, dataset: &Dataset) -> bool {
        self.fields
            .iter()
            .all(|(k, v)| dataset.get(k).map(|found| found == v).unwrap_or(false))
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch one dataset. A miss is [`MeshError::NotFound`].
    async fn read(&self, collection: &str, key: &str) -> Result<Dataset>;

    /// Insert a dataset. Returns whether anything was written: saving an
    /// existing key without `allow_duplicates` is a no-op.
    async fn save(&self, collection: &str, dataset: &Dataset, options: SaveOptions)
        -> Result<bool>;

    /// Insert or overwrite every dataset in one write. Returns how many
    /// were written. Nothing is written when any dataset is malformed.
    async fn save_all(&self, collection: &str, datasets: &[Dataset]) -> Result<usize>;

    /// Replace an existing dataset. Missing keys are [`MeshError::NotFound`].
    async fn update(&self, collection: &str, dataset: &Dataset) -> Result<()>;

    /// Every dataset in `collection` matching `filter`. Unknown collections
    /// are empty.
    async fn list(&self, collection: &str, filter: &ListFilter) -> Result<Vec<Dataset>>;

    async fn clear(&self, collection: &str) -> Result<()>;
}

/// Key of a dataset, rejecting non-objects, empty objects and missing uuids.
pub fn dataset_key(dataset: &Dataset) -> Result<&str> {
    let object = dataset
        .as_object()
        .ok_or_else(|| MeshError::invalid("dataset is not an object"))?;
    if object.is_empty() {
        return Err(MeshError::invalid("dataset is empty"));
    }
    match object.get(KEY_FIELD).and_then(Value::as_str) {
        Some(key) if !key.is_empty() => Ok(key),
        _ => Err(MeshError::invalid("dataset has no uuid")),
    }
}

/// Pair every dataset with its key, failing on the first malformed one.
pub fn keyed_datasets(datasets: &[Dataset]) -> Result<Vec<(String, Dataset)>> {
    datasets
        .iter()
        .map(|d| -> Result<(String, Dataset)> { Ok((dataset_key(d)?.to_string(), d.clone())) })
        .collect()
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Dataset>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read(&self, collection: &str, key: &str) -> Result<Dataset> {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .and_then(|c| c.get(key))
            .cloned()
            .ok_or_else(|| MeshError::not_found(format!("{collection}/{key}")))
    }

    async fn save(
        &self,
        collection: &str,
        dataset: &Dataset,
        options: SaveOptions,
    ) -> Result<bool> {
        let key = dataset_key(dataset)?.to_string();
        let mut collections = self.collections.write().await;
        let entries = collections.entry(collection.to_string()).or_default();
        if entries.contains_key(&key) && !options.allow_duplicates {
            return Ok(false);
        }
        entries.insert(key, dataset.clone());
        Ok(true)
    }

    async fn save_all(&self, collection: &str, datasets: &[Dataset]) -> Result<usize> {
        let keyed = keyed_datasets(datasets)?;
        let mut collections = self.collections.write().await;
        collections.entry(collection.to_string()).or_default().extend(keyed);
        Ok(datasets.len())
    }

    async fn update(&self, collection: &str, dataset: &Dataset) -> Result<()> {
        let key = dataset_key(dataset)?;
        let mut collections = self.collections.write().await;
        match collections.get_mut(collection).and_then(|c| c.get_mut(key)) {
            Some(slot) => {
                *slot = dataset.clone();
                Ok(())
            }
            None => Err(MeshError::not_found(format!("{collection}/{key}"))),
        }
    }

    async fn list(&self, collection: &str, filter: &ListFilter) -> Result<Vec<Dataset>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|c| c.values().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default())
    }

    async fn clear(&self, collection: &str) -> Result<()> {
        self.collections.write().await.remove(collection);
        Ok(())
    }
}
