//! SQLite connection pool management.
//!
//! SQLite is the persistent, indexable store used where a browser build
//! would reach for IndexedDB: one database file per purpose, one table
//! ("object store") per adapter instance.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::instrument;

// Cache reads fan out (batch gets run concurrently), so give them a few lanes.
const MAX_CONNECTIONS: u32 = 5;

/// Where a database lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseLocation {
    File(PathBuf),
    /// Private in-memory database, destroyed when the pool closes.
    Memory,
}

/// Database connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    async fn new(options: SqliteConnectOptions, pool: SqlitePoolOptions) -> Result<Self> {
        let pool = pool
            // This is IMPORTANT to apply the query-based PRAGMAs to EVERY
            // connection (set by max connections) instead of only the
            // first connection returned by the pool.
            .after_connect(|conn, meta| Box::pin(async move { Self::apply_pragmas(conn, meta).await }))
            .connect_with(options)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(Self { pool })
    }

    pub async fn open(location: &DatabaseLocation) -> Result<Self> {
        match location {
            DatabaseLocation::File(path) => Self::connect(path).await,
            DatabaseLocation::Memory => Self::connect_in_memory().await,
        }
    }

    /// Connect to the database at the given path.
    ///
    /// Creates the database file (and its parent directory) if it doesn't
    /// exist.
    pub async fn connect(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(ErrorKind::Io)?;
        }
        let options = Self::base_options().filename(&path).create_if_missing(true);
        Self::new(options, SqlitePoolOptions::new().max_connections(MAX_CONNECTIONS)).await
    }

    /// Connect to an in-memory database (useful for testing).
    ///
    /// Note:
    /// - In-memory databases are destroyed when the connection closes.
    /// - Do NOT apply `#[cfg(test)]` so that other crates can also use this in their tests.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = Self::base_options().filename(":memory:");
        // In-memory database must either use the same cache `.shared_cache(true)`,
        // or be limited to one connection. Otherwise parallel connections will
        // see different databases that contain different data. That one
        // connection must also never be reaped, or the data goes with it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
        Self::new(options, pool).await
    }

    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            // Batch writes run concurrently against a single WAL writer.
            .busy_timeout(std::time::Duration::from_millis(1500))
            // VACUUM during optimize() reclaims space instead.
            .auto_vacuum(sqlx::sqlite::SqliteAutoVacuum::None)
    }

    /// Apply additional PRAGMA settings that aren't exposed via SqliteConnectOptions.
    async fn apply_pragmas(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                PRAGMA wal_autocheckpoint = 800;
                PRAGMA cache_size = -8192;
                PRAGMA temp_store = MEMORY;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Run schema statements. Statements must be additive (`IF NOT EXISTS`)
    /// so that re-running them against an existing store never drops data.
    #[instrument(skip_all)]
    pub async fn ensure_schema(&self, statements: &[String]) -> Result<()> {
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await.or_raise(|| ErrorKind::Database)?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection pool.
    ///
    /// This waits for all connections to be returned to the pool and then
    /// closes them.
    pub async fn close(&self) {
        // Let SQLite update query planner statistics
        _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        self.pool.close().await;
    }
}

/// Validate a table name for interpolation into SQL.
pub fn validate_store_name(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        exn::bail!(ErrorKind::InvalidStoreName(name.to_string()));
    }
    Ok(name)
}

/// A database handle opened on first use and memoized until closed.
///
/// Adapters own exactly one of these. After [`close`](Self::close) the next
/// call to [`get`](Self::get) transparently reconnects and re-applies the
/// (additive) schema.
#[derive(Debug)]
pub struct LazyDatabase {
    location: DatabaseLocation,
    schema: Vec<String>,
    db: RwLock<Option<Database>>,
}
impl LazyDatabase {
    pub fn new(location: DatabaseLocation, schema: Vec<String>) -> Self {
        Self { location, schema, db: RwLock::new(None) }
    }

    pub fn location(&self) -> &DatabaseLocation {
        &self.location
    }

    pub async fn get(&self) -> Result<Database> {
        if let Some(db) = self.db.read().await.as_ref() {
            return Ok(db.clone());
        }
        let mut guard = self.db.write().await;
        // Another caller may have won the race for the write lock.
        if let Some(db) = guard.as_ref() {
            return Ok(db.clone());
        }
        tracing::debug!(location = ?self.location, "opening database");
        let db = Database::open(&self.location).await?;
        db.ensure_schema(&self.schema).await?;
        *guard = Some(db.clone());
        Ok(db)
    }

    pub async fn close(&self) {
        if let Some(db) = self.db.write().await.take() {
            db.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[tokio::test]
    async fn test_connect_in_memory() {
        let db = Database::connect_in_memory().await.unwrap();
        assert!(!db.pool().is_closed());
        db.close().await;
    }

    #[tokio::test]
    async fn test_in_memory_connection_is_never_reaped() {
        let db = Database::connect_in_memory().await.unwrap();
        let options = db.pool().options();
        assert_eq!(options.get_max_connections(), 1);
        assert_eq!(options.get_min_connections(), 1);
        assert_eq!(options.get_idle_timeout(), None);
        assert_eq!(options.get_max_lifetime(), None);

        sqlx::query("CREATE TABLE kept (v INTEGER)").execute(db.pool()).await.unwrap();
        sqlx::query("INSERT INTO kept VALUES (1)").execute(db.pool()).await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT v FROM kept").fetch_one(db.pool()).await.unwrap();
        assert_eq!(row.0, 1);
        db.close().await;
    }

    #[tokio::test]
    async fn test_pragmas_are_applied() {
        let db = Database::connect_in_memory().await.unwrap();
        let row: (i64,) = sqlx::query_as("PRAGMA wal_autocheckpoint").fetch_one(db.pool()).await.unwrap();
        assert_eq!(row.0, 800, "WAL checkpoint should be 800");
        db.close().await;
    }

    #[tokio::test]
    async fn test_connect_creates_parent_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested/resource-cache.sqlite");
        let db = Database::connect(&path).await.unwrap();
        db.close().await;
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_schema_is_additive() {
        let db = Database::connect_in_memory().await.unwrap();
        let v1 = vec!["CREATE TABLE IF NOT EXISTS things (key TEXT PRIMARY KEY)".to_string()];
        db.ensure_schema(&v1).await.unwrap();
        sqlx::query("INSERT INTO things (key) VALUES ('kept')").execute(db.pool()).await.unwrap();
        let mut v2 = v1.clone();
        v2.push("CREATE INDEX IF NOT EXISTS things_key ON things (key)".to_string());
        db.ensure_schema(&v2).await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM things").fetch_one(db.pool()).await.unwrap();
        assert_eq!(row.0, 1);
        db.close().await;
    }

    #[tokio::test]
    async fn test_lazy_reopens_after_close() {
        let temp_dir = tempfile::tempdir().unwrap();
        let location = DatabaseLocation::File(temp_dir.path().join("lazy.sqlite"));
        let lazy = LazyDatabase::new(location, vec!["CREATE TABLE IF NOT EXISTS t (k TEXT)".to_string()]);
        let first = lazy.get().await.unwrap();
        sqlx::query("INSERT INTO t (k) VALUES ('x')").execute(first.pool()).await.unwrap();
        lazy.close().await;
        assert!(first.pool().is_closed());
        let second = lazy.get().await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM t").fetch_one(second.pool()).await.unwrap();
        assert_eq!(row.0, 1);
        lazy.close().await;
    }

    #[rstest]
    #[case("resource_cache", true)]
    #[case("_private", true)]
    #[case("store2", true)]
    #[case("2store", false)]
    #[case("drop table", false)]
    #[case("a;b", false)]
    #[case("", false)]
    fn test_validate_store_name(#[case] name: &str, #[case] valid: bool) {
        assert_eq!(validate_store_name(name).is_ok(), valid);
    }
}
