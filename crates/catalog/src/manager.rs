//! Catalog front end shared by every adapter.

use crate::CatalogHandle;
use crate::error::Result;
use crate::merge::{MergePolicy, SaveOutcome};
use crate::metadata::ResourceMetadata;
use crate::search::{CatalogStats, SearchFilters};
use lectern_storage::ResourceKey;
use std::fmt;
use tracing::{debug, instrument, warn};

/// Metadata catalog over any [`CatalogAdapter`](crate::CatalogAdapter).
///
/// Keys are resource-level: a book component on an incoming key is dropped,
/// so every book of a resource shares one catalog record.
///
/// # Examples
///
/// ```
/// use lectern_catalog::{CatalogManager, Ingredient, MemoryCatalog, ResourceMetadata};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let catalog = CatalogManager::new(Arc::new(MemoryCatalog::default()));
/// let mut ult = ResourceMetadata::new("git.door43.org", "unfoldingWord", "en", "ult", "Bible", "ULT");
/// ult.ingredients.push(Ingredient::new("gen"));
/// assert!(catalog.save_resource(ult).await?.is_saved());
/// assert_eq!(catalog.get_stats().await?.total_resources, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CatalogManager {
    adapter: CatalogHandle,
    merge: MergePolicy,
}
impl fmt::Debug for CatalogManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogManager")
            .field("adapter", &self.adapter.name())
            .field("merge", &self.merge)
            .finish()
    }
}
impl CatalogManager {
    pub fn new(adapter: CatalogHandle) -> Self {
        Self { adapter, merge: MergePolicy::default() }
    }

    pub fn with_merge_threshold(self, threshold: usize) -> Self {
        self.with_merge_policy(MergePolicy::new(threshold))
    }

    pub fn with_merge_policy(mut self, merge: MergePolicy) -> Self {
        self.merge = merge;
        self
    }

    pub fn adapter(&self) -> &CatalogHandle {
        &self.adapter
    }

    pub fn merge_policy(&self) -> MergePolicy {
        self.merge
    }

    /// Write `metadata` under `key`, unless the protective merge refuses it.
    ///
    /// A refusal is reported as [`SaveOutcome::Rejected`] and is not an error.
    /// The key wins over the metadata's own identity fields: the stored
    /// record is rewritten to match it.
    #[instrument(skip_all, fields(catalog = %self.adapter.name(), %key))]
    pub async fn save(&self, key: &ResourceKey, metadata: ResourceMetadata) -> Result<SaveOutcome> {
        let key = key.resource();
        if metadata.key() != key {
            warn!(described = %metadata.key(), "metadata identity differs from its key, using the key");
        }
        let outcome = self.adapter.put_guarded(&key, &metadata, &self.merge).await?;
        match outcome {
            SaveOutcome::Saved => debug!(ingredients = metadata.ingredients.len(), "saved catalog metadata"),
            SaveOutcome::Rejected { existing, incoming } => warn!(
                existing,
                incoming,
                threshold = self.merge.threshold,
                "kept richer catalog metadata, sparser update ignored"
            ),
        }
        Ok(outcome)
    }

    /// Alias of [`save`](Self::save).
    pub async fn set(&self, key: &ResourceKey, metadata: ResourceMetadata) -> Result<SaveOutcome> {
        self.save(key, metadata).await
    }

    /// [`save`](Self::save) under the key derived from the metadata itself.
    pub async fn save_resource(&self, metadata: ResourceMetadata) -> Result<SaveOutcome> {
        let key = metadata.key();
        self.save(&key, metadata).await
    }

    pub async fn get(&self, key: &ResourceKey) -> Result<Option<ResourceMetadata>> {
        self.adapter.get(&key.resource()).await
    }

    /// Every record, ordered by key.
    pub async fn get_all(&self) -> Result<Vec<ResourceMetadata>> {
        self.adapter.list().await
    }

    pub async fn get_all_keys(&self) -> Result<Vec<ResourceKey>> {
        self.adapter.keys().await
    }

    pub async fn search(&self, filters: &SearchFilters) -> Result<Vec<ResourceMetadata>> {
        self.adapter.search(filters).await
    }

    pub async fn get_stats(&self) -> Result<CatalogStats> {
        let resources = self.adapter.list().await?;
        Ok(CatalogStats::from_resources(&resources))
    }

    pub async fn delete(&self, key: &ResourceKey) -> Result<()> {
        let key = key.resource();
        self.adapter.delete(&key).await?;
        debug!(catalog = %self.adapter.name(), %key, "deleted catalog metadata");
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.adapter.clear().await?;
        debug!(catalog = %self.adapter.name(), "cleared catalog");
        Ok(())
    }

    pub async fn count(&self) -> Result<u64> {
        self.adapter.count().await
    }

    pub async fn close(&self) -> Result<()> {
        self.adapter.close().await
    }
}
