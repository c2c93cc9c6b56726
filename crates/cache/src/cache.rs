//! The resource cache: resource keys over any storage adapter.

use crate::error::{ErrorKind, Result};
use crate::policy::EvictionPolicy;
use exn::ResultExt;
use lectern_storage::{AdapterHandle, CacheEntry, Content, ResourceKey};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, instrument, trace};

// Entries loaded per round trip while sweeping policies.
const SWEEP_BATCH: usize = 64;

/// Aggregate figures reported by [`ResourceCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: u64,
    pub size_bytes: u64,
}

/// Content cache keyed by resource coordinates.
///
/// Every [`ResourceKey`] maps to exactly one adapter key (its canonical
/// string form). Expired entries read as misses and are deleted by the
/// adapter on the way out.
///
/// # Examples
///
/// ```
/// use lectern_cache::{ResourceCache, TtlPolicy};
/// use lectern_storage::{MemoryAdapter, ResourceKey};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let cache = ResourceCache::new(Arc::new(MemoryAdapter::default()))
///     .with_default_ttl(Duration::from_secs(24 * 60 * 60))
///     .with_policy(TtlPolicy::default());
/// let key = ResourceKey::new("git.door43.org", "unfoldingWord", "en", "ult").with_book("gen");
/// cache.set(&key, "\\id GEN", None).await?;
/// assert!(cache.has(&key).await?);
/// # Ok(())
/// # }
/// ```
pub struct ResourceCache {
    adapter: AdapterHandle,
    default_ttl: Option<Duration>,
    policies: Vec<Box<dyn EvictionPolicy>>,
}
impl fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCache")
            .field("adapter", &self.adapter.name())
            .field("default_ttl", &self.default_ttl)
            .field("policies", &self.policies)
            .finish()
    }
}
impl ResourceCache {
    pub fn new(adapter: AdapterHandle) -> Self {
        Self { adapter, default_ttl: None, policies: Vec::new() }
    }

    /// TTL applied by [`set`](Self::set) when the caller doesn't pass one.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn with_policy(self, policy: impl EvictionPolicy + 'static) -> Self {
        self.with_boxed_policy(Box::new(policy))
    }

    pub fn with_boxed_policy(mut self, policy: Box<dyn EvictionPolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn adapter(&self) -> &AdapterHandle {
        &self.adapter
    }

    /// The adapter key for a resource.
    pub fn key(resource: &ResourceKey) -> String {
        resource.to_string()
    }

    fn entry_for(&self, content: Content, ttl: Option<Duration>) -> CacheEntry {
        let entry = CacheEntry::new(content);
        match ttl.or(self.default_ttl) {
            Some(ttl) => entry.expires_in(ttl),
            None => entry,
        }
    }

    pub async fn get(&self, resource: &ResourceKey) -> Result<Option<CacheEntry>> {
        let key = Self::key(resource);
        let entry = self.adapter.get(&key).await.or_raise(|| ErrorKind::Storage)?;
        match &entry {
            Some(entry) => trace!(adapter = self.adapter.name(), %key, size = entry.metadata.size, "cache HIT"),
            None => trace!(adapter = self.adapter.name(), %key, "cache MISS"),
        }
        Ok(entry)
    }

    /// Like [`get`](Self::get), without the metadata.
    pub async fn get_content(&self, resource: &ResourceKey) -> Result<Option<Content>> {
        Ok(self.get(resource).await?.map(|entry| entry.content))
    }

    /// Store content. `ttl` overrides the cache's default TTL.
    pub async fn set(&self, resource: &ResourceKey, content: impl Into<Content>, ttl: Option<Duration>) -> Result<()> {
        let entry = self.entry_for(content.into(), ttl);
        self.set_entry(resource, &entry).await
    }

    /// Store a fully built entry as-is; the default TTL is not applied.
    pub async fn set_entry(&self, resource: &ResourceKey, entry: &CacheEntry) -> Result<()> {
        let key = Self::key(resource);
        debug!(adapter = self.adapter.name(), %key, size = entry.metadata.size, expires_at = ?entry.expires_at, "caching entry");
        self.adapter.set(&key, entry).await.or_raise(|| ErrorKind::Storage)
    }

    pub async fn has(&self, resource: &ResourceKey) -> Result<bool> {
        self.adapter.has(&Self::key(resource)).await.or_raise(|| ErrorKind::Storage)
    }

    pub async fn delete(&self, resource: &ResourceKey) -> Result<()> {
        let key = Self::key(resource);
        debug!(adapter = self.adapter.name(), %key, "deleting entry");
        self.adapter.delete(&key).await.or_raise(|| ErrorKind::Storage)
    }

    /// Fetch several entries. Misses are absent from the returned map.
    pub async fn get_many(&self, resources: &[ResourceKey]) -> Result<HashMap<ResourceKey, CacheEntry>> {
        let keys: Vec<String> = resources.iter().map(Self::key).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let mut found = self.adapter.get_many(&refs).await.or_raise(|| ErrorKind::Storage)?;
        trace!(adapter = self.adapter.name(), requested = keys.len(), found = found.len(), "batch lookup");
        Ok(resources
            .iter()
            .zip(&keys)
            .filter_map(|(resource, key)| found.remove(key).map(|entry| (resource.clone(), entry)))
            .collect())
    }

    /// Store several items, each with the default TTL.
    pub async fn set_many(&self, items: Vec<(ResourceKey, Content)>) -> Result<()> {
        let (keys, contents): (Vec<String>, Vec<Content>) =
            items.into_iter().map(|(resource, content)| (Self::key(&resource), content)).unzip();
        let refs: Vec<(&str, CacheEntry)> = keys
            .iter()
            .map(String::as_str)
            .zip(contents.into_iter().map(|content| self.entry_for(content, None)))
            .collect();
        debug!(adapter = self.adapter.name(), count = refs.len(), "caching batch");
        self.adapter.set_many(&refs).await.or_raise(|| ErrorKind::Storage)
    }

    pub async fn delete_many(&self, resources: &[ResourceKey]) -> Result<()> {
        let keys: Vec<String> = resources.iter().map(Self::key).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        debug!(adapter = self.adapter.name(), count = refs.len(), "deleting batch");
        self.adapter.delete_many(&refs).await.or_raise(|| ErrorKind::Storage)
    }

    pub async fn clear(&self) -> Result<()> {
        info!(adapter = self.adapter.name(), "clearing cache");
        self.adapter.clear().await.or_raise(|| ErrorKind::Storage)
    }

    /// Every cached key, in the adapter's canonical string form.
    pub async fn keys(&self) -> Result<Vec<String>> {
        self.adapter.keys().await.or_raise(|| ErrorKind::Storage)
    }

    pub async fn count(&self) -> Result<u64> {
        self.adapter.count().await.or_raise(|| ErrorKind::Storage)
    }

    pub async fn size(&self) -> Result<u64> {
        self.adapter.size().await.or_raise(|| ErrorKind::Storage)
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        Ok(CacheStats { entries: self.count().await?, size_bytes: self.size().await? })
    }

    /// Remove expired entries, then everything any configured policy wants
    /// gone. Returns the total number of entries removed.
    #[instrument(skip(self), fields(adapter = self.adapter.name()))]
    pub async fn prune(&self) -> Result<u64> {
        let expired = self.adapter.prune().await.or_raise(|| ErrorKind::Storage)?;
        let evicted = self.sweep_policies().await?;
        info!(expired, evicted, "pruned cache");
        Ok(expired + evicted)
    }

    /// Backend maintenance (compaction where the adapter has it) followed by
    /// a policy sweep.
    #[instrument(skip(self), fields(adapter = self.adapter.name()))]
    pub async fn optimize(&self) -> Result<u64> {
        let expired = self.adapter.optimize().await.or_raise(|| ErrorKind::Storage)?;
        let evicted = self.sweep_policies().await?;
        info!(expired, evicted, "optimized cache");
        Ok(expired + evicted)
    }

    async fn sweep_policies(&self) -> Result<u64> {
        if self.policies.is_empty() {
            return Ok(0);
        }
        let keys = self.keys().await?;
        let mut evicted = 0;
        for chunk in keys.chunks(SWEEP_BATCH) {
            let refs: Vec<&str> = chunk.iter().map(String::as_str).collect();
            let entries = self.adapter.get_many(&refs).await.or_raise(|| ErrorKind::Storage)?;
            let doomed: Vec<&str> = entries
                .iter()
                .filter_map(|(key, entry)| {
                    let policy = self.policies.iter().find(|policy| policy.should_evict(entry))?;
                    trace!(%key, policy = policy.name(), "policy eviction");
                    Some(key.as_str())
                })
                .collect();
            if !doomed.is_empty() {
                self.adapter.delete_many(&doomed).await.or_raise(|| ErrorKind::Storage)?;
                evicted += doomed.len() as u64;
            }
        }
        Ok(evicted)
    }

    /// Return the cached entry, or run `fetch`, cache what it produces with
    /// the default TTL, and return that.
    ///
    /// A failed fetch is reported as [`ErrorKind::Fetch`] and nothing is
    /// cached.
    pub async fn get_or_fetch<F, Fut, E>(&self, resource: &ResourceKey, fetch: F) -> Result<CacheEntry>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Content, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        if let Some(entry) = self.get(resource).await? {
            return Ok(entry);
        }
        let content = fetch().await.or_raise(|| ErrorKind::Fetch(resource.to_string()))?;
        let entry = self.entry_for(content, None);
        self.set_entry(resource, &entry).await?;
        Ok(entry)
    }

    /// Release the adapter's underlying handle.
    pub async fn close(&self) -> Result<()> {
        self.adapter.close().await.or_raise(|| ErrorKind::Storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{FrequencyPolicy, SizePolicy, TtlPolicy};
    use lectern_storage::{FilesystemAdapter, MemoryAdapter, SqliteAdapter};
    use rstest::rstest;
    use serde_json::json;
    use std::sync::Arc;
    use time::OffsetDateTime;

    fn ult(book: &str) -> ResourceKey {
        ResourceKey::new("git.door43.org", "unfoldingWord", "en", "ult").with_book(book)
    }

    fn memory_cache() -> ResourceCache {
        ResourceCache::new(Arc::new(MemoryAdapter::default()))
    }

    fn expired() -> CacheEntry {
        CacheEntry::new("stale").expires_at(OffsetDateTime::now_utc() - Duration::from_secs(5))
    }

    #[derive(Debug, derive_more::Display, derive_more::Error)]
    #[display("offline")]
    struct Offline;

    #[tokio::test]
    async fn test_round_trip_on_every_adapter() {
        let temp_dir = tempfile::tempdir().unwrap();
        let adapters: [AdapterHandle; 3] = [
            Arc::new(MemoryAdapter::default()),
            Arc::new(FilesystemAdapter::new("fs", temp_dir.path()).unwrap()),
            Arc::new(SqliteAdapter::in_memory("sqlite", "resource_cache").unwrap()),
        ];
        for adapter in adapters {
            let cache = ResourceCache::new(adapter);
            let content = Content::Json(json!({"chapters": 50, "verses": 1533}));
            cache.set(&ult("gen"), content.clone(), None).await.unwrap();
            assert_eq!(cache.get_content(&ult("gen")).await.unwrap(), Some(content));
            assert!(cache.get(&ult("exo")).await.unwrap().is_none());
            cache.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_ttl() {
        let cache = memory_cache().with_default_ttl(Duration::from_secs(60));
        cache.set(&ult("gen"), "default", None).await.unwrap();
        let entry = cache.get(&ult("gen")).await.unwrap().unwrap();
        assert_eq!(entry.expires_at, Some(entry.metadata.cached_at + Duration::from_secs(60)));
        cache.set(&ult("exo"), "override", Some(Duration::from_secs(5))).await.unwrap();
        let entry = cache.get(&ult("exo")).await.unwrap().unwrap();
        assert_eq!(entry.expires_at, Some(entry.metadata.cached_at + Duration::from_secs(5)));
        // Explicit entries bypass the default.
        cache.set_entry(&ult("lev"), &CacheEntry::new("forever")).await.unwrap();
        assert!(cache.get(&ult("lev")).await.unwrap().unwrap().expires_at.is_none());
    }

    #[tokio::test]
    async fn test_unbounded_ttl_keeps_entries() {
        let forever = Duration::from_secs(u64::MAX);
        let cache = memory_cache().with_default_ttl(forever).with_policy(TtlPolicy { max_age: Some(forever) });
        cache.set(&ult("gen"), "kept", None).await.unwrap();
        assert!(cache.get(&ult("gen")).await.unwrap().unwrap().expires_at.is_none());
        assert_eq!(cache.prune().await.unwrap(), 0);
        assert!(cache.has(&ult("gen")).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss_and_pruned() {
        let cache = memory_cache();
        cache.set_entry(&ult("gen"), &expired()).await.unwrap();
        cache.set_entry(&ult("exo"), &expired()).await.unwrap();
        assert!(cache.get(&ult("gen")).await.unwrap().is_none());
        assert!(cache.prune().await.unwrap() >= 1);
        assert_eq!(cache.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batches() {
        let cache = memory_cache();
        cache
            .set_many(vec![(ult("gen"), Content::from("genesis")), (ult("exo"), Content::from("exodus"))])
            .await
            .unwrap();
        let found = cache.get_many(&[ult("gen"), ult("exo")]).await.unwrap();
        assert_eq!(found.len(), 2);
        let found = cache.get_many(&[ult("gen"), ult("missing")]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[&ult("gen")].content.as_text(), Some("genesis"));
        cache.delete_many(&[ult("gen"), ult("missing")]).await.unwrap();
        assert_eq!(cache.keys().await.unwrap(), vec![ult("exo").to_string()]);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let cache = memory_cache();
        cache.delete(&ult("gen")).await.unwrap();
        cache.set(&ult("gen"), "x", None).await.unwrap();
        cache.delete(&ult("gen")).await.unwrap();
        cache.delete(&ult("gen")).await.unwrap();
        assert!(!cache.has(&ult("gen")).await.unwrap());
    }

    #[tokio::test]
    async fn test_stats_and_clear() {
        let cache = memory_cache();
        cache.set(&ult("gen"), "12345", None).await.unwrap();
        cache.set(&ult("exo"), vec![1u8, 2, 3], None).await.unwrap();
        assert_eq!(cache.stats().await.unwrap(), CacheStats { entries: 2, size_bytes: 8 });
        cache.clear().await.unwrap();
        assert_eq!(cache.stats().await.unwrap(), CacheStats::default());
    }

    #[rstest]
    #[case::size(Box::new(SizePolicy { max_entry_bytes: 4 }), 1)]
    #[case::max_age(Box::new(TtlPolicy { max_age: Some(Duration::ZERO) }), 2)]
    #[case::frequency(Box::new(FrequencyPolicy { min_hits: 10 }), 0)]
    #[tokio::test]
    async fn test_policies_apply_during_prune(#[case] policy: Box<dyn EvictionPolicy>, #[case] evicted: u64) {
        let cache = memory_cache().with_boxed_policy(policy);
        cache.set(&ult("gen"), "big payload", None).await.unwrap();
        cache.set(&ult("exo"), "tiny", None).await.unwrap();
        assert_eq!(cache.prune().await.unwrap(), evicted);
        assert_eq!(cache.count().await.unwrap(), 2 - evicted);
    }

    #[tokio::test]
    async fn test_optimize_without_backend_maintenance_is_prune() {
        let cache = memory_cache();
        cache.set_entry(&ult("gen"), &expired()).await.unwrap();
        cache.set(&ult("exo"), "fresh", None).await.unwrap();
        assert_eq!(cache.optimize().await.unwrap(), 1);
        assert_eq!(cache.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_or_fetch() {
        let cache = memory_cache();
        let entry = cache
            .get_or_fetch(&ult("gen"), || async { Ok::<_, Offline>(Content::from("fetched")) })
            .await
            .unwrap();
        assert_eq!(entry.content.as_text(), Some("fetched"));
        // Second call is served from the cache; the fetcher must not run.
        let entry = cache
            .get_or_fetch(&ult("gen"), || async { Err::<Content, _>(Offline) })
            .await
            .unwrap();
        assert_eq!(entry.content.as_text(), Some("fetched"));
    }

    #[tokio::test]
    async fn test_failed_fetch_caches_nothing() {
        let cache = memory_cache();
        let err = cache.get_or_fetch(&ult("gen"), || async { Err::<Content, _>(Offline) }).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Fetch(key) if key == "git.door43.org/unfoldingWord/en/ult/gen"));
        assert!(err.is_retryable());
        assert_eq!(cache.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_storage_errors_propagate() {
        let temp_dir = tempfile::tempdir().unwrap();
        let adapter = FilesystemAdapter::new("fs", temp_dir.path()).unwrap();
        let cache = ResourceCache::new(Arc::new(adapter));
        cache.set(&ult("gen"), Content::Json(json!([1, 2])), None).await.unwrap();
        let data = temp_dir.path().join("git.door43.org/unfoldingWord/en/ult/gen.data");
        std::fs::write(data, b"[1, 2").unwrap();
        let err = cache.get(&ult("gen")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Storage));
    }
}
