//! In-memory storage adapter.

use super::KeyStream;
use crate::entry::CacheEntry;
use crate::error::Result;
use crate::key::validate as validate_key;
use crate::StorageAdapter;
use async_stream::stream;
use async_trait::async_trait;
use std::collections::HashMap;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// In-memory storage adapter.
///
/// Entries are stored in a `HashMap` behind a [`RwLock`], so all trait methods
/// can operate on `&self` without external synchronisation. Nothing survives
/// the process; this is the adapter tests reach for, and [`reset`](Self::reset)
/// gives each test a clean slate.
///
/// # Examples
///
/// ```
/// use lectern_storage::{CacheEntry, MemoryAdapter, StorageAdapter};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let adapter = MemoryAdapter::with_entries([
///     ("git.door43.org/unfoldingWord/en/ult/gen", CacheEntry::new("\\id GEN")),
/// ]);
/// assert!(adapter.has("git.door43.org/unfoldingWord/en/ult/gen").await?);
/// # Ok(())
/// # }
/// ```
pub struct MemoryAdapter {
    name: String,
    storage: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryAdapter {
    /// Create an adapter pre-populated with entries.
    ///
    /// Panics if any key fails validation. If test setup is wrong, then the
    /// test should not pass.
    pub fn with_entries(entries: impl IntoIterator<Item = (impl Into<String>, CacheEntry)>) -> Self {
        let mut map = HashMap::new();
        for (key, entry) in entries {
            let key = key.into();
            if validate_key(&key).is_err() {
                // The panic here is DELIBERATE, see above.
                panic!("MemoryAdapter::with_entries: invalid key {key:?}");
            }
            map.insert(key, entry);
        }
        Self {
            name: "memory".to_string(),
            storage: RwLock::new(map),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Drop every entry. Equivalent to [`clear`](StorageAdapter::clear) but
    /// infallible, for test isolation.
    pub async fn reset(&self) {
        self.storage.write().await.clear();
    }
}
impl Default for MemoryAdapter {
    fn default() -> Self {
        let entries: [(&str, CacheEntry); 0] = [];
        Self::with_entries(entries)
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let key = validate_key(key)?;
        let now = OffsetDateTime::now_utc();
        match self.storage.read().await.get(key) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired_at(now) => return Ok(Some(entry.clone())),
            Some(_) => {},
        }
        let mut guard = self.storage.write().await;
        // Re-check under the write lock; a concurrent set may have refreshed it.
        if guard.get(key).is_some_and(|entry| entry.is_expired_at(now)) {
            tracing::trace!(adapter = %self.name, key, "evicting expired entry on read");
            guard.remove(key);
            return Ok(None);
        }
        Ok(guard.get(key).cloned())
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let key = validate_key(key)?;
        self.storage.write().await.insert(key.to_string(), entry.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = validate_key(key)?;
        self.storage.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.reset().await;
        Ok(())
    }

    fn keys_stream<'a>(&'a self) -> KeyStream<'a> {
        Box::pin(stream! {
            // Snapshot under the read lock, then drop it before yielding to
            // avoid holding the lock across yield points.
            let keys: Vec<String> = self.storage.read().await.keys().cloned().collect();
            for key in keys {
                yield Ok(key);
            }
        })
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.storage.read().await.len() as u64)
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.storage.read().await.values().map(|entry| entry.metadata.size).sum())
    }

    async fn prune(&self) -> Result<u64> {
        let now = OffsetDateTime::now_utc();
        let mut guard = self.storage.write().await;
        let before = guard.len();
        guard.retain(|_, entry| !entry.is_expired_at(now));
        Ok((before - guard.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Content;
    use crate::error::ErrorKind;
    use serde_json::json;
    use std::time::Duration;

    fn expired(content: &str) -> CacheEntry {
        CacheEntry::new(content).expires_at(OffsetDateTime::now_utc() - Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let adapter = MemoryAdapter::default();
        let entry = CacheEntry::new(json!({"title": "unfoldingWord Literal Text"}));
        adapter.set("k", &entry).await.unwrap();
        assert_eq!(adapter.get("k").await.unwrap(), Some(entry));
        assert_eq!(adapter.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite() {
        let adapter = MemoryAdapter::default();
        adapter.set("k", &CacheEntry::new("one")).await.unwrap();
        adapter.set("k", &CacheEntry::new("two")).await.unwrap();
        let entry = adapter.get("k").await.unwrap().unwrap();
        assert_eq!(entry.content, Content::Text("two".to_string()));
        assert_eq!(adapter.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_read_as_absent() {
        let adapter = MemoryAdapter::with_entries([("old", expired("stale")), ("new", CacheEntry::new("fresh"))]);
        assert_eq!(adapter.count().await.unwrap(), 2);
        assert!(adapter.get("old").await.unwrap().is_none());
        assert!(!adapter.has("old").await.unwrap());
        // The read evicted it.
        assert_eq!(adapter.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_prune() {
        let adapter = MemoryAdapter::with_entries([
            ("a", expired("1")),
            ("b", expired("2")),
            ("c", CacheEntry::new("3").expires_in(Duration::from_secs(3600))),
            ("d", CacheEntry::new("4")),
        ]);
        assert_eq!(adapter.prune().await.unwrap(), 2);
        let mut keys = adapter.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["c", "d"]);
        assert_eq!(adapter.prune().await.unwrap(), 0);
        // Maintenance without a backend-specific concept is a prune.
        assert_eq!(adapter.optimize().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let adapter = MemoryAdapter::with_entries([("k", CacheEntry::new("v"))]);
        adapter.delete("missing").await.unwrap();
        assert_eq!(adapter.count().await.unwrap(), 1);
        adapter.delete("k").await.unwrap();
        adapter.delete("k").await.unwrap();
        assert_eq!(adapter.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batches() {
        let adapter = MemoryAdapter::default();
        adapter.set_many(&[("k1", CacheEntry::new("v1")), ("k2", CacheEntry::new("v2"))]).await.unwrap();
        let found = adapter.get_many(&["k1", "k2"]).await.unwrap();
        assert_eq!(found.len(), 2);
        let found = adapter.get_many(&["k1", "missing"]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["k1"].content.as_text(), Some("v1"));
        adapter.delete_many(&["k1", "k2", "missing"]).await.unwrap();
        assert_eq!(adapter.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batch_aborts_on_invalid_key() {
        let adapter = MemoryAdapter::default();
        let err = adapter.set_many(&[("ok", CacheEntry::new("v")), ("", CacheEntry::new("v"))]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_size_and_reset() {
        let adapter = MemoryAdapter::with_entries([("a", CacheEntry::new("12345")), ("b", CacheEntry::new("678"))]);
        assert_eq!(adapter.size().await.unwrap(), 8);
        adapter.reset().await;
        assert_eq!(adapter.size().await.unwrap(), 0);
        assert!(adapter.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear() {
        let adapter = MemoryAdapter::with_entries([("a", CacheEntry::new("1"))]).with_name("test");
        assert_eq!(adapter.name(), "test");
        adapter.clear().await.unwrap();
        assert_eq!(adapter.count().await.unwrap(), 0);
    }
}
