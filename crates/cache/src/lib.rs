//! Content cache for resource payloads.
//!
//! [`ResourceCache`] sits on top of any [`StorageAdapter`](lectern_storage::StorageAdapter)
//! and adds resource-coordinate keys, a default time-to-live, fetch-on-miss
//! and pluggable [eviction policies](policy). The cache owns no state of its
//! own beyond its configuration; construct one at startup and share it.

mod cache;
pub mod error;
pub mod policy;

pub use crate::cache::{CacheStats, ResourceCache};
pub use crate::policy::{EvictionPolicy, FrequencyPolicy, PolicyConfig, SizePolicy, TtlPolicy};
