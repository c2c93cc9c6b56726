//! SQLite catalog with secondary indexes on the identity columns.

use super::parse_key;
use crate::CatalogAdapter;
use crate::error::{ErrorKind, Result};
use crate::merge::{MergePolicy, Resolution, SaveOutcome};
use crate::metadata::ResourceMetadata;
use crate::search::{IndexedField, SearchFilters};
use async_trait::async_trait;
use exn::ResultExt;
use lectern_storage::{Database, DatabaseLocation, LazyDatabase, ResourceKey, validate_store_name};
use sqlx::SqliteConnection;
use time::OffsetDateTime;
use tracing::instrument;

#[derive(Debug)]
struct Queries {
    get: String,
    upsert: String,
    delete: String,
    clear: String,
    keys: String,
    list: String,
    count: String,
    by_server: String,
    by_owner: String,
    by_language: String,
    by_subject: String,
}
impl Queries {
    fn for_table(table: &str) -> Self {
        let sql = |template: &str| template.replace("{table}", table);
        Self {
            get: sql(include_str!("../../queries/get.sql")),
            upsert: sql(include_str!("../../queries/upsert.sql")),
            delete: sql(include_str!("../../queries/delete.sql")),
            clear: sql(include_str!("../../queries/clear.sql")),
            keys: sql(include_str!("../../queries/keys.sql")),
            list: sql(include_str!("../../queries/list.sql")),
            count: sql(include_str!("../../queries/count.sql")),
            by_server: sql(include_str!("../../queries/search_by_server.sql")),
            by_owner: sql(include_str!("../../queries/search_by_owner.sql")),
            by_language: sql(include_str!("../../queries/search_by_language.sql")),
            by_subject: sql(include_str!("../../queries/search_by_subject.sql")),
        }
    }

    /// Additive only: stores created by older schemas gain missing indexes
    /// without losing rows.
    fn schema(table: &str) -> Vec<String> {
        [
            include_str!("../../queries/create_table.sql"),
            include_str!("../../queries/create_index_server.sql"),
            include_str!("../../queries/create_index_owner.sql"),
            include_str!("../../queries/create_index_language.sql"),
            include_str!("../../queries/create_index_subject.sql"),
            include_str!("../../queries/create_index_resource_type.sql"),
        ]
        .into_iter()
        .map(|template| template.replace("{table}", table))
        .collect()
    }

    fn search(&self, field: IndexedField) -> &str {
        match field {
            IndexedField::Server => &self.by_server,
            IndexedField::Owner => &self.by_owner,
            IndexedField::Language => &self.by_language,
            IndexedField::Subject => &self.by_subject,
        }
    }
}

fn decode(json: &str) -> Result<ResourceMetadata> {
    serde_json::from_str(json).or_raise(|| ErrorKind::InvalidData("catalog record"))
}

/// SQLite catalog.
///
/// Single-criterion searches on server, owner, language or subject are
/// answered from an index; anything else scans the table. Protective merges
/// run inside one transaction.
#[derive(Debug)]
pub struct SqliteCatalog {
    name: String,
    db: LazyDatabase,
    queries: Queries,
}
impl SqliteCatalog {
    pub fn new(name: impl Into<String>, location: DatabaseLocation, store: impl AsRef<str>) -> Result<Self> {
        let store = validate_store_name(store.as_ref()).or_raise(|| ErrorKind::Storage)?;
        Ok(Self {
            name: name.into(),
            db: LazyDatabase::new(location, Queries::schema(store)),
            queries: Queries::for_table(store),
        })
    }

    pub fn in_memory(name: impl Into<String>, store: impl AsRef<str>) -> Result<Self> {
        Self::new(name, DatabaseLocation::Memory, store)
    }

    async fn db(&self) -> Result<Database> {
        self.db.get().await.or_raise(|| ErrorKind::Storage)
    }

    async fn fetch_one_record(&self, conn: &mut SqliteConnection, key: &str) -> Result<Option<ResourceMetadata>> {
        let json: Option<String> = sqlx::query_scalar(&self.queries.get)
            .bind(key)
            .fetch_optional(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        json.as_deref().map(decode).transpose()
    }

    async fn write_record(
        &self,
        conn: &mut SqliteConnection,
        key: &ResourceKey,
        metadata: &ResourceMetadata,
    ) -> Result<()> {
        let record = metadata.clone().aligned_to(key);
        let json = serde_json::to_string(&record).or_raise(|| ErrorKind::InvalidData("catalog record"))?;
        sqlx::query(&self.queries.upsert)
            .bind(key.to_string())
            .bind(key.server())
            .bind(key.owner())
            .bind(key.language())
            .bind(&metadata.subject)
            .bind(metadata.resource_type.as_deref())
            .bind(json)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    async fn fetch_records(&self, sql: &str, value: Option<&str>) -> Result<Vec<ResourceMetadata>> {
        let db = self.db().await?;
        let mut query = sqlx::query_scalar::<_, String>(sql);
        if let Some(value) = value {
            query = query.bind(value);
        }
        let rows = query.fetch_all(db.pool()).await.or_raise(|| ErrorKind::Database)?;
        rows.iter().map(|json| decode(json)).collect()
    }
}

#[async_trait]
impl CatalogAdapter for SqliteCatalog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<ResourceMetadata>> {
        let db = self.db().await?;
        let mut conn = db.pool().acquire().await.or_raise(|| ErrorKind::Database)?;
        self.fetch_one_record(&mut conn, &key.to_string()).await
    }

    async fn put(&self, key: &ResourceKey, metadata: &ResourceMetadata) -> Result<()> {
        let db = self.db().await?;
        let mut conn = db.pool().acquire().await.or_raise(|| ErrorKind::Database)?;
        self.write_record(&mut conn, key, metadata).await
    }

    #[instrument(skip_all, fields(catalog = %self.name, %key))]
    async fn put_guarded(
        &self,
        key: &ResourceKey,
        metadata: &ResourceMetadata,
        policy: &MergePolicy,
    ) -> Result<SaveOutcome> {
        let db = self.db().await?;
        let mut tx = db.pool().begin().await.or_raise(|| ErrorKind::Database)?;
        let existing = self.fetch_one_record(&mut *tx, &key.to_string()).await?;
        let outcome = match policy.resolve(existing.as_ref(), metadata, OffsetDateTime::now_utc()) {
            Resolution::Write(record) => {
                self.write_record(&mut *tx, key, &record).await?;
                SaveOutcome::Saved
            },
            Resolution::Reject(outcome) => outcome,
        };
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(outcome)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<()> {
        let db = self.db().await?;
        sqlx::query(&self.queries.delete)
            .bind(key.to_string())
            .execute(db.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let db = self.db().await?;
        sqlx::query(&self.queries.clear).execute(db.pool()).await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<ResourceKey>> {
        let db = self.db().await?;
        let keys: Vec<String> =
            sqlx::query_scalar(&self.queries.keys).fetch_all(db.pool()).await.or_raise(|| ErrorKind::Database)?;
        keys.iter().map(|key| parse_key(key)).collect()
    }

    async fn list(&self) -> Result<Vec<ResourceMetadata>> {
        self.fetch_records(&self.queries.list, None).await
    }

    async fn count(&self) -> Result<u64> {
        let db = self.db().await?;
        let count: i64 =
            sqlx::query_scalar(&self.queries.count).fetch_one(db.pool()).await.or_raise(|| ErrorKind::Database)?;
        u64::try_from(count).or_raise(|| ErrorKind::InvalidData("record count"))
    }

    async fn search(&self, filters: &SearchFilters) -> Result<Vec<ResourceMetadata>> {
        let candidates = match filters.indexed_field() {
            Some((field, value)) => {
                tracing::trace!(catalog = %self.name, ?field, "index-assisted search");
                self.fetch_records(self.queries.search(field), Some(&value)).await?
            },
            None => self.list().await?,
        };
        // Re-applying the filter keeps both paths identical, and paginates.
        Ok(filters.apply(candidates))
    }

    async fn close(&self) -> Result<()> {
        self.db.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Ingredient;

    fn resource(owner: &str, language: &str, id: &str, subject: &str) -> ResourceMetadata {
        ResourceMetadata::new("git.door43.org", owner, language, id, subject, id.to_uppercase())
    }

    async fn seeded() -> SqliteCatalog {
        let catalog = SqliteCatalog::in_memory("sqlite", "resource_catalog").unwrap();
        let mut tn = resource("unfoldingWord", "en", "tn", "TSV Translation Notes");
        tn.resource_type = Some("help".to_string());
        for metadata in [
            resource("unfoldingWord", "en", "ult", "Aligned Bible"),
            resource("other", "en", "ust", "Aligned Bible"),
            resource("unfoldingWord", "es-419", "glt", "Aligned Bible"),
            tn,
        ] {
            catalog.put(&metadata.key(), &metadata).await.unwrap();
        }
        catalog
    }

    #[test]
    fn test_store_name_is_validated() {
        let err = SqliteCatalog::in_memory("sqlite", "1nvalid").unwrap_err();
        assert!(matches!(&*err, ErrorKind::Storage));
    }

    #[tokio::test]
    async fn test_indexed_and_scanned_searches_agree() {
        let catalog = seeded().await;
        let all = catalog.list().await.unwrap();
        for filters in [
            SearchFilters::default().server("https://git.door43.org"),
            SearchFilters::default().owner("unfoldingWord"),
            SearchFilters::default().language("en"),
            SearchFilters::default().subject("Aligned Bible"),
            SearchFilters::default().subject("help"),
            SearchFilters::default().language("en").limit(1).offset(1),
        ] {
            assert!(filters.indexed_field().is_some());
            assert_eq!(catalog.search(&filters).await.unwrap(), filters.apply(all.clone()), "{filters:?}");
        }
    }

    #[tokio::test]
    async fn test_results_are_ordered_by_key() {
        let catalog = seeded().await;
        let keys: Vec<String> = catalog.keys().await.unwrap().iter().map(ToString::to_string).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        let listed: Vec<String> = catalog.list().await.unwrap().iter().map(|m| m.key().to_string()).collect();
        assert_eq!(listed, keys);
    }

    #[tokio::test]
    async fn test_guarded_write_in_transaction() {
        let catalog = SqliteCatalog::in_memory("sqlite", "resource_catalog").unwrap();
        let mut rich = resource("unfoldingWord", "en", "ta", "Translation Academy");
        rich.ingredients = (0..953).map(|i| Ingredient::new(format!("article-{i}"))).collect();
        let policy = MergePolicy::default();
        assert_eq!(catalog.put_guarded(&rich.key(), &rich, &policy).await.unwrap(), SaveOutcome::Saved);
        let sparse = resource("unfoldingWord", "en", "ta", "Translation Academy");
        assert_eq!(
            catalog.put_guarded(&sparse.key(), &sparse, &policy).await.unwrap(),
            SaveOutcome::Rejected { existing: 953, incoming: 0 }
        );
        let stored = catalog.get(&rich.key()).await.unwrap().unwrap();
        assert_eq!(stored.ingredients.len(), 953);
        assert!(stored.cataloged_at.is_some());
    }

    #[tokio::test]
    async fn test_persists_across_close() {
        let temp_dir = tempfile::tempdir().unwrap();
        let location = DatabaseLocation::File(temp_dir.path().join("resource-catalog.sqlite"));
        let catalog = SqliteCatalog::new("sqlite", location, "resource_catalog").unwrap();
        let metadata = resource("unfoldingWord", "en", "ult", "Aligned Bible");
        catalog.put(&metadata.key(), &metadata).await.unwrap();
        catalog.close().await.unwrap();
        assert_eq!(catalog.get(&metadata.key()).await.unwrap(), Some(metadata));
        catalog.close().await.unwrap();
    }
}
