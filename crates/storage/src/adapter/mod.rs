//! Storage adapter trait and implementations.
//!
//! This module defines the `StorageAdapter` trait, a uniform key-value
//! interface over the in-memory, filesystem and SQLite backends, plus the
//! factory that picks one from configuration.

mod filesystem;
mod memory;
mod sqlite;

pub use self::filesystem::FilesystemAdapter;
pub use self::memory::MemoryAdapter;
pub use self::sqlite::SqliteAdapter;
use crate::db::DatabaseLocation;
use crate::entry::CacheEntry;
use crate::error::Result;
use crate::AdapterHandle;
use async_trait::async_trait;
use futures::future::try_join_all;
use futures::{Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

/// Stream returned by [`StorageAdapter::keys_stream`].
pub type KeyStream<'a> = Pin<Box<dyn Stream<Item = Result<String>> + Send + 'a>>;

/// Unified interface for key-value storage backends.
///
/// All operations are asynchronous and may suspend on I/O. Adapters open
/// their underlying store lazily on first use, so every method is safe to
/// call straight after construction.
///
/// # Absence and expiry
/// A key that is missing, or whose entry has expired, reads as `Ok(None)`.
/// Expired entries found by a read are deleted on the spot. [`keys`](Self::keys),
/// [`count`](Self::count) and [`size`](Self::size) still include expired
/// entries that nobody has read since they expired; [`prune`](Self::prune)
/// removes those.
///
/// # Batches
/// The `*_many` methods run their element-wise operations concurrently. The
/// first failure aborts the batch and is returned; elements that completed
/// before it are not rolled back.
///
/// # Examples
///
/// ```
/// use lectern_storage::{CacheEntry, StorageAdapter, error::Result};
///
/// async fn remember(adapter: &dyn StorageAdapter) -> Result<()> {
///     adapter.set("git.door43.org/unfoldingWord/en/ult/gen", &CacheEntry::new("\\id GEN")).await?;
///     if let Some(entry) = adapter.get("git.door43.org/unfoldingWord/en/ult/gen").await? {
///         println!("{} bytes", entry.metadata.size);
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Name of the configured adapter (used for logging only).
    fn name(&self) -> &str;

    /// Fetch an entry. Missing and expired entries are `None`.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Store an entry, overwriting anything already at `key`.
    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<()>;

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Remove an entry. Removing a key that doesn't exist is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Fetch several entries at once. Keys that are missing (or expired) are
    /// simply absent from the returned map.
    async fn get_many(&self, keys: &[&str]) -> Result<HashMap<String, CacheEntry>> {
        let found = try_join_all(keys.iter().map(|key| async move {
            Ok::<_, crate::error::Error>(self.get(key).await?.map(|entry| (key.to_string(), entry)))
        }))
        .await?;
        Ok(found.into_iter().flatten().collect())
    }

    async fn set_many(&self, items: &[(&str, CacheEntry)]) -> Result<()> {
        try_join_all(items.iter().map(|(key, entry)| self.set(key, entry))).await?;
        Ok(())
    }

    async fn delete_many(&self, keys: &[&str]) -> Result<()> {
        try_join_all(keys.iter().map(|key| self.delete(key))).await?;
        Ok(())
    }

    /// Remove every entry.
    async fn clear(&self) -> Result<()>;

    /// Stream every stored key, in no particular order.
    fn keys_stream<'a>(&'a self) -> KeyStream<'a>;

    /// Collect [`keys_stream`](Self::keys_stream) into a [`Vec`].
    async fn keys(&self) -> Result<Vec<String>> {
        self.keys_stream().try_collect().await
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.keys().await?.len() as u64)
    }

    /// Aggregate byte footprint of the stored payloads.
    async fn size(&self) -> Result<u64>;

    /// Remove every expired entry, returning how many were removed.
    async fn prune(&self) -> Result<u64>;

    /// Backend-specific maintenance. Adapters without such a concept treat
    /// this as [`prune`](Self::prune).
    async fn optimize(&self) -> Result<u64> {
        self.prune().await
    }

    /// Release the underlying handle. The next operation reopens it.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Explicit backend selection, usually deserialized from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum AdapterConfig {
    Memory,
    Filesystem {
        /// Absolute directory owned by the adapter.
        root: PathBuf,
    },
    Sqlite {
        /// Database file; `:memory:` for a private in-memory database.
        path: PathBuf,
        /// Table ("object store") owned by the adapter instance.
        store: String,
    },
}
impl AdapterConfig {
    pub fn database_location(path: &Path) -> DatabaseLocation {
        match path.to_str() {
            Some(":memory:") => DatabaseLocation::Memory,
            _ => DatabaseLocation::File(path.to_path_buf()),
        }
    }
}

/// Build the adapter described by `config`.
///
/// Nothing is opened yet: every adapter connects lazily on first use.
pub fn open_adapter(name: impl Into<String>, config: &AdapterConfig) -> Result<AdapterHandle> {
    let name = name.into();
    tracing::debug!(%name, ?config, "configuring storage adapter");
    Ok(match config {
        AdapterConfig::Memory => Arc::new(MemoryAdapter::default().with_name(name)),
        AdapterConfig::Filesystem { root } => Arc::new(FilesystemAdapter::new(name, root)?),
        AdapterConfig::Sqlite { path, store } => {
            Arc::new(SqliteAdapter::new(name, AdapterConfig::database_location(path), store)?)
        },
    })
}
