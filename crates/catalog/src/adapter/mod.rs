//! Catalog adapter trait and implementations.

mod filesystem;
mod memory;
mod sqlite;

pub use self::filesystem::FilesystemCatalog;
pub use self::memory::MemoryCatalog;
pub use self::sqlite::SqliteCatalog;
use crate::error::{ErrorKind, Result};
use crate::merge::{MergePolicy, Resolution, SaveOutcome};
use crate::metadata::ResourceMetadata;
use crate::search::SearchFilters;
use crate::CatalogHandle;
use async_trait::async_trait;
use exn::ResultExt;
use lectern_storage::{AdapterConfig, ResourceKey};
use std::sync::Arc;
use time::OffsetDateTime;

/// Persistence for [`ResourceMetadata`], keyed by resource-level
/// [`ResourceKey`]s.
///
/// Listing and search results are ordered by the key's canonical string form
/// on every backend, so the same filters give the same page everywhere.
#[async_trait]
pub trait CatalogAdapter: Send + Sync {
    /// Name of the configured adapter (used for logging only).
    fn name(&self) -> &str;

    async fn get(&self, key: &ResourceKey) -> Result<Option<ResourceMetadata>>;

    /// Unconditional write. The stored record takes its identity fields from
    /// `key`, so lookups, filters and stats all agree on where it lives.
    async fn put(&self, key: &ResourceKey, metadata: &ResourceMetadata) -> Result<()>;

    /// Write subject to the protective merge rule.
    ///
    /// The default implementation reads, compares, then writes as three
    /// separate steps. Two concurrent writers can both pass the comparison
    /// before either writes, in which case the last write wins even if it is
    /// the sparser one. Adapters whose store offers atomicity override this.
    async fn put_guarded(
        &self,
        key: &ResourceKey,
        metadata: &ResourceMetadata,
        policy: &MergePolicy,
    ) -> Result<SaveOutcome> {
        let existing = self.get(key).await?;
        match policy.resolve(existing.as_ref(), metadata, OffsetDateTime::now_utc()) {
            Resolution::Write(record) => {
                self.put(key, &record).await?;
                Ok(SaveOutcome::Saved)
            },
            Resolution::Reject(outcome) => Ok(outcome),
        }
    }

    /// Removing a key that doesn't exist is not an error.
    async fn delete(&self, key: &ResourceKey) -> Result<()>;

    async fn clear(&self) -> Result<()>;

    async fn keys(&self) -> Result<Vec<ResourceKey>>;

    /// Every record, ordered by key.
    async fn list(&self) -> Result<Vec<ResourceMetadata>>;

    async fn count(&self) -> Result<u64> {
        Ok(self.keys().await?.len() as u64)
    }

    /// Records matching `filters`, ordered by key, paginated after filtering.
    async fn search(&self, filters: &SearchFilters) -> Result<Vec<ResourceMetadata>> {
        Ok(filters.apply(self.list().await?))
    }

    /// Release the underlying handle. The next operation reopens it.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn parse_key(key: &str) -> Result<ResourceKey> {
    key.parse::<ResourceKey>().or_raise(|| ErrorKind::InvalidData("catalog key"))
}

/// Build the catalog adapter described by `config`.
///
/// For the SQLite backend `store` names the catalog table. Nothing is opened
/// until first use.
pub fn open_catalog(name: impl Into<String>, config: &AdapterConfig) -> Result<CatalogHandle> {
    let name = name.into();
    tracing::debug!(%name, ?config, "configuring catalog adapter");
    Ok(match config {
        AdapterConfig::Memory => Arc::new(MemoryCatalog::new(name)),
        AdapterConfig::Filesystem { root } => Arc::new(FilesystemCatalog::new(name, root)?),
        AdapterConfig::Sqlite { path, store } => {
            Arc::new(SqliteCatalog::new(name, AdapterConfig::database_location(path), store)?)
        },
    })
}
