//! Metadata catalog for translation resources.
//!
//! [`CatalogManager`] records what each resource contains (its ingredients,
//! relations and classification) on top of any [`CatalogAdapter`]. Writes
//! pass through a protective merge so that sparse metadata from a live API
//! call can never overwrite a rich table of contents computed offline.

mod adapter;
pub mod error;
mod manager;
mod merge;
mod metadata;
mod search;

pub use crate::adapter::{CatalogAdapter, FilesystemCatalog, MemoryCatalog, SqliteCatalog, open_catalog};
pub use crate::manager::CatalogManager;
pub use crate::merge::{DEFAULT_MERGE_THRESHOLD, MergePolicy, SaveOutcome};
pub use crate::metadata::{Ingredient, ResourceMetadata};
pub use crate::search::{CatalogStats, SearchFilters};
use std::sync::Arc;

/// Shared, type-erased catalog adapter.
pub type CatalogHandle = Arc<dyn CatalogAdapter + Send + Sync>;
