use async_trait::async_trait;
use meshwork_protocol::store::{dataset_key, keyed_datasets, Dataset, ListFilter, SaveOptions, Store};
use meshwork_protocol::{MeshError, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

type Collection = BTreeMap<String, Dataset>;

/// Store keeping one pretty-printed JSON file per collection, rewritten on
/// every mutation. Memory only changes after the file write succeeded.
pub struct JsonFileStore {
    dir: PathBuf,
    collections: RwLock<HashMap<String, Collection>>,
}

impl JsonFileStore {
    /// Open `dir`, loading every `<collection>.json` in it.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| MeshError::storage(format!("create {}: {e}", dir.display())))?;

        let mut collections = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| MeshError::storage(format!("read {}: {e}", dir.display())))?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            match load_collection(&path).await {
                Ok(collection) => {
                    tracing::debug!(collection = %name, entries = collection.len(), "Loaded collection");
                    collections.insert(name, collection);
                }
                Err(e) => tracing::warn!(path = %path.display(), "Skipping unreadable collection: {e}"),
            }
        }

        Ok(Self {
            dir,
            collections: RwLock::new(collections),
        })
    }

    fn path_for(&self, collection: &str) -> Result<PathBuf> {
        if collection.is_empty()
            || !collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(MeshError::invalid(format!("bad collection name {collection:?}")));
        }
        Ok(self.dir.join(format!("{collection}.json")))
    }

    async fn write(&self, collection: &str, entries: &Collection) -> Result<()> {
        let path = self.path_for(collection)?;
        let datasets: Vec<&Dataset> = entries.values().collect();
        let json = serde_json::to_string_pretty(&datasets)?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| MeshError::storage(format!("write {}: {e}", path.display())))
    }
}

async fn load_collection(path: &Path) -> Result<Collection> {
    let data = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| MeshError::storage(e.to_string()))?;
    let datasets: Vec<Dataset> = serde_json::from_str(&data)?;
    let mut collection = Collection::new();
    for dataset in datasets {
        let key = dataset_key(&dataset)?.to_string();
        collection.insert(key, dataset);
    }
    Ok(collection)
}

#[async_trait]
impl Store for JsonFileStore {
    async fn read(&self, collection: &str, key: &str) -> Result<Dataset> {
        self.collections
            .read()
            .await
            .get(collection)
            .and_then(|c| c.get(key))
            .cloned()
            .ok_or_else(|| MeshError::not_found(format!("{collection}/{key}")))
    }

    async fn save(&self, collection: &str, dataset: &Dataset, options: SaveOptions) -> Result<bool> {
        let key = dataset_key(dataset)?.to_string();
        self.path_for(collection)?;
        let mut collections = self.collections.write().await;
        let mut next = collections.get(collection).cloned().unwrap_or_default();
        if next.contains_key(&key) && !options.allow_duplicates {
            return Ok(false);
        }
        next.insert(key, dataset.clone());
        self.write(collection, &next).await?;
        collections.insert(collection.to_string(), next);
        Ok(true)
    }

    async fn save_all(&self, collection: &str, datasets: &[Dataset]) -> Result<usize> {
        let keyed = keyed_datasets(datasets)?;
        self.path_for(collection)?;
        let mut collections = self.collections.write().await;
        let mut next = collections.get(collection).cloned().unwrap_or_default();
        next.extend(keyed);
        self.write(collection, &next).await?;
        collections.insert(collection.to_string(), next);
        Ok(datasets.len())
    }

    async fn update(&self, collection: &str, dataset: &Dataset) -> Result<()> {
        let key = dataset_key(dataset)?;
        let mut collections = self.collections.write().await;
        let Some(entries) = collections.get(collection) else {
            return Err(MeshError::not_found(format!("{collection}/{key}")));
        };
        if !entries.contains_key(key) {
            return Err(MeshError::not_found(format!("{collection}/{key}")));
        }
        let mut next = entries.clone();
        next.insert(key.to_string(), dataset.clone());
        self.write(collection, &next).await?;
        collections.insert(collection.to_string(), next);
        Ok(())
    }

    async fn list(&self, collection: &str, filter: &ListFilter) -> Result<Vec<Dataset>> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map(|c| c.values().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default())
    }

    async fn clear(&self, collection: &str) -> Result<()> {
        let path = self.path_for(collection)?;
        self.collections.write().await.remove(collection);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MeshError::storage(format!("remove {}: {e}", path.display()))),
        }
    }
}
