//! SQLite storage adapter.
//!
//! The persistent, indexed backend: one table per adapter instance inside a
//! shared database file, keyed by the entry key, with an index on
//! `expires_at` so that pruning never scans live entries.

use super::KeyStream;
use crate::db::{DatabaseLocation, LazyDatabase, validate_store_name};
use crate::entry::{CacheEntry, Content, EntryMetadata};
use crate::error::{Error, ErrorKind, Result};
use crate::key::validate as validate_key;
use crate::StorageAdapter;
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use futures::StreamExt;
use time::OffsetDateTime;
use tracing::instrument;

/// SQL for one table, with the table name substituted in.
#[derive(Debug)]
struct Queries {
    get: String,
    upsert: String,
    delete: String,
    delete_if_expired: String,
    clear: String,
    keys: String,
    count: String,
    size: String,
    prune: String,
}
impl Queries {
    fn for_table(table: &str) -> Self {
        let sql = |template: &str| template.replace("{table}", table);
        Self {
            get: sql(include_str!("../../queries/get.sql")),
            upsert: sql(include_str!("../../queries/upsert.sql")),
            delete: sql(include_str!("../../queries/delete.sql")),
            delete_if_expired: sql(include_str!("../../queries/delete_if_expired.sql")),
            clear: sql(include_str!("../../queries/clear.sql")),
            keys: sql(include_str!("../../queries/keys.sql")),
            count: sql(include_str!("../../queries/count.sql")),
            size: sql(include_str!("../../queries/size.sql")),
            prune: sql(include_str!("../../queries/prune.sql")),
        }
    }

    fn schema(table: &str) -> Vec<String> {
        [include_str!("../../queries/create_table.sql"), include_str!("../../queries/create_expiry_index.sql")]
            .into_iter()
            .map(|template| template.replace("{table}", table))
            .collect()
    }
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    content: Vec<u8>,
    content_kind: String,
    size: i64,
    checksum: String,
    cached_at: i64,
    expires_at: Option<i64>,
}
impl TryFrom<EntryRow> for CacheEntry {
    type Error = Error;
    fn try_from(row: EntryRow) -> Result<Self> {
        let kind = row.content_kind.parse()?;
        Ok(Self {
            content: Content::from_bytes(kind, row.content)?,
            expires_at: row.expires_at.map(from_nanos).transpose()?,
            metadata: EntryMetadata {
                kind,
                cached_at: from_nanos(row.cached_at)?,
                size: u64::try_from(row.size).or_raise(|| ErrorKind::InvalidData("entry size"))?,
                checksum: row.checksum,
            },
        })
    }
}

// Nanosecond precision keeps `cached_at` identical across a round trip.
// Instants outside 1677..2262 saturate, so a far-future expiry is stored as
// the latest representable one and still never fires in practice.
fn to_nanos(instant: OffsetDateTime) -> i64 {
    let nanos = instant.unix_timestamp_nanos();
    i64::try_from(nanos).unwrap_or(if nanos < 0 { i64::MIN } else { i64::MAX })
}

fn from_nanos(nanos: i64) -> Result<OffsetDateTime> {
    Ok(OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos)).or_raise(|| ErrorKind::InvalidData("timestamp"))?)
}

/// SQLite storage adapter.
///
/// Several adapters can share one database file as long as each owns a
/// different table ("store"). The connection is opened, and the table
/// created, on first use.
///
/// # Examples
///
/// ```
/// use lectern_storage::{CacheEntry, SqliteAdapter, StorageAdapter};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let adapter = SqliteAdapter::in_memory("resource-cache", "resource_cache")?;
/// adapter.set("git.door43.org/unfoldingWord/en/ult", &CacheEntry::new("manifest")).await?;
/// assert_eq!(adapter.count().await?, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SqliteAdapter {
    name: String,
    store: String,
    db: LazyDatabase,
    queries: Queries,
}
impl SqliteAdapter {
    /// # Errors
    ///
    /// Returns [`InvalidStoreName`](ErrorKind::InvalidStoreName) if `store`
    /// is not a plain SQL identifier.
    pub fn new(name: impl Into<String>, location: DatabaseLocation, store: impl Into<String>) -> Result<Self> {
        let store = store.into();
        validate_store_name(&store)?;
        Ok(Self {
            name: name.into(),
            db: LazyDatabase::new(location, Queries::schema(&store)),
            queries: Queries::for_table(&store),
            store,
        })
    }

    /// Adapter over a private in-memory database.
    pub fn in_memory(name: impl Into<String>, store: impl Into<String>) -> Result<Self> {
        Self::new(name, DatabaseLocation::Memory, store)
    }

    pub fn store(&self) -> &str {
        &self.store
    }
}

#[async_trait]
impl StorageAdapter for SqliteAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let key = validate_key(key)?;
        let db = self.db.get().await?;
        let row: Option<EntryRow> = sqlx::query_as(&self.queries.get)
            .bind(key)
            .fetch_optional(db.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        let Some(entry) = row.map(CacheEntry::try_from).transpose()? else {
            return Ok(None);
        };
        let now = OffsetDateTime::now_utc();
        if entry.is_expired_at(now) {
            tracing::trace!(adapter = %self.name, key, "evicting expired entry on read");
            // Conditional, so a concurrent refresh of the key survives.
            sqlx::query(&self.queries.delete_if_expired)
                .bind(key)
                .bind(to_nanos(now))
                .execute(db.pool())
                .await
                .or_raise(|| ErrorKind::Database)?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let key = validate_key(key)?;
        let db = self.db.get().await?;
        sqlx::query(&self.queries.upsert)
            .bind(key)
            .bind(entry.content.to_bytes().as_ref())
            .bind(entry.metadata.kind.to_string())
            .bind(i64::try_from(entry.metadata.size).or_raise(|| ErrorKind::InvalidData("entry size"))?)
            .bind(&entry.metadata.checksum)
            .bind(to_nanos(entry.metadata.cached_at))
            .bind(entry.expires_at.map(to_nanos))
            .execute(db.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = validate_key(key)?;
        let db = self.db.get().await?;
        sqlx::query(&self.queries.delete).bind(key).execute(db.pool()).await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let db = self.db.get().await?;
        sqlx::query(&self.queries.clear).execute(db.pool()).await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    fn keys_stream<'a>(&'a self) -> KeyStream<'a> {
        Box::pin(stream! {
            let db = match self.db.get().await {
                Ok(db) => db,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let mut rows = sqlx::query_scalar::<_, String>(&self.queries.keys).fetch(db.pool());
            while let Some(row) = rows.next().await {
                yield row.or_raise(|| ErrorKind::Database);
            }
        })
    }

    async fn count(&self) -> Result<u64> {
        let db = self.db.get().await?;
        let count: i64 =
            sqlx::query_scalar(&self.queries.count).fetch_one(db.pool()).await.or_raise(|| ErrorKind::Database)?;
        Ok(u64::try_from(count).or_raise(|| ErrorKind::InvalidData("entry count"))?)
    }

    async fn size(&self) -> Result<u64> {
        let db = self.db.get().await?;
        let size: i64 =
            sqlx::query_scalar(&self.queries.size).fetch_one(db.pool()).await.or_raise(|| ErrorKind::Database)?;
        Ok(u64::try_from(size).or_raise(|| ErrorKind::InvalidData("total size"))?)
    }

    #[instrument(skip(self), fields(adapter = %self.name))]
    async fn prune(&self) -> Result<u64> {
        let db = self.db.get().await?;
        let result = sqlx::query(&self.queries.prune)
            .bind(to_nanos(OffsetDateTime::now_utc()))
            .execute(db.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected())
    }

    /// Prune, then `VACUUM` to hand freed pages back to the filesystem.
    #[instrument(skip(self), fields(adapter = %self.name))]
    async fn optimize(&self) -> Result<u64> {
        let pruned = self.prune().await?;
        let db = self.db.get().await?;
        sqlx::query("VACUUM").execute(db.pool()).await.or_raise(|| ErrorKind::Database)?;
        Ok(pruned)
    }

    async fn close(&self) -> Result<()> {
        self.db.close().await;
        Ok(())
    }
}
