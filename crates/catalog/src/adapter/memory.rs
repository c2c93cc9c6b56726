//! In-process catalog backed by a sorted map.

use super::parse_key;
use crate::CatalogAdapter;
use crate::error::Result;
use crate::merge::{MergePolicy, Resolution, SaveOutcome};
use crate::metadata::ResourceMetadata;
use async_trait::async_trait;
use lectern_storage::ResourceKey;
use std::collections::BTreeMap;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// In-memory catalog, ordered by key string.
///
/// The protective merge runs under a single write lock, so it is atomic.
pub struct MemoryCatalog {
    name: String,
    records: RwLock<BTreeMap<String, ResourceMetadata>>,
}
impl MemoryCatalog {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), records: RwLock::new(BTreeMap::new()) }
    }

    /// Drop every record, for test isolation.
    pub async fn reset(&self) {
        self.records.write().await.clear();
    }
}
impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl CatalogAdapter for MemoryCatalog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<ResourceMetadata>> {
        Ok(self.records.read().await.get(&key.to_string()).cloned())
    }

    async fn put(&self, key: &ResourceKey, metadata: &ResourceMetadata) -> Result<()> {
        self.records.write().await.insert(key.to_string(), metadata.clone().aligned_to(key));
        Ok(())
    }

    async fn put_guarded(
        &self,
        key: &ResourceKey,
        metadata: &ResourceMetadata,
        policy: &MergePolicy,
    ) -> Result<SaveOutcome> {
        let name = key.to_string();
        let mut records = self.records.write().await;
        match policy.resolve(records.get(&name), metadata, OffsetDateTime::now_utc()) {
            Resolution::Write(record) => {
                records.insert(name, record.aligned_to(key));
                Ok(SaveOutcome::Saved)
            },
            Resolution::Reject(outcome) => Ok(outcome),
        }
    }

    async fn delete(&self, key: &ResourceKey) -> Result<()> {
        self.records.write().await.remove(&key.to_string());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.reset().await;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<ResourceKey>> {
        self.records.read().await.keys().map(|key| parse_key(key)).collect()
    }

    async fn list(&self) -> Result<Vec<ResourceMetadata>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.records.read().await.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Ingredient;
    use futures::future::join_all;
    use std::sync::Arc;

    fn with_ingredients(count: usize) -> ResourceMetadata {
        let mut metadata = ResourceMetadata::new("git.door43.org", "unfoldingWord", "en", "tn", "TSV Translation Notes", "tN");
        metadata.ingredients = (0..count).map(|i| Ingredient::new(format!("book-{i}"))).collect();
        metadata
    }

    #[tokio::test]
    async fn test_concurrent_sparse_writes_cannot_clobber() {
        let catalog = Arc::new(MemoryCatalog::default());
        let rich = with_ingredients(66);
        catalog.put(&rich.key(), &rich).await.unwrap();
        let writers = (0..8).map(|i| {
            let catalog = Arc::clone(&catalog);
            async move {
                let sparse = with_ingredients(i);
                catalog.put_guarded(&sparse.key(), &sparse, &MergePolicy::default()).await.unwrap()
            }
        });
        let outcomes = join_all(writers).await;
        assert!(outcomes.iter().all(|outcome| !outcome.is_saved()));
        assert_eq!(catalog.get(&rich.key()).await.unwrap().unwrap().ingredients.len(), 66);
    }

    #[tokio::test]
    async fn test_reset() {
        let catalog = MemoryCatalog::default();
        let metadata = with_ingredients(1);
        catalog.put(&metadata.key(), &metadata).await.unwrap();
        catalog.reset().await;
        assert_eq!(catalog.count().await.unwrap(), 0);
    }
}
