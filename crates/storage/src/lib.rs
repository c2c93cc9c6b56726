//! Key-value storage adapters for cached resource content.
//!
//! Everything above this crate (the resource cache, the catalog) talks to a
//! [`StorageAdapter`] and never to a concrete backend. Three backends are
//! provided: in-memory, a directory tree on the local filesystem, and SQLite.

pub mod adapter;
mod db;
pub mod entry;
pub mod error;
mod key;
mod resource;

pub use crate::adapter::{
    AdapterConfig, FilesystemAdapter, KeyStream, MemoryAdapter, SqliteAdapter, StorageAdapter, open_adapter,
};
pub use crate::db::{Database, DatabaseLocation, LazyDatabase, validate_store_name};
pub use crate::entry::{CacheEntry, Content, ContentKind, EntryMetadata};
pub use crate::key::{decode_file_name, encode_file_name, validate as validate_key};
pub use crate::resource::{ResourceKey, normalize_server};
use std::sync::Arc;

pub type AdapterHandle = Arc<dyn StorageAdapter + Send + Sync>;
