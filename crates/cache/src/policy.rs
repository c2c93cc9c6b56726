//! Eviction policies consulted by [`ResourceCache::prune`](crate::ResourceCache::prune).
//!
//! A policy is a pure predicate over one entry. Policies never fail: a policy
//! that cannot decide must answer "keep".

use lectern_storage::CacheEntry;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;
use time::OffsetDateTime;

pub trait EvictionPolicy: Debug + Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Whether `entry` should be removed during the next maintenance pass.
    fn should_evict(&self, entry: &CacheEntry) -> bool;
}

/// Evicts expired entries and, optionally, entries older than `max_age`
/// regardless of their own expiry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TtlPolicy {
    pub max_age: Option<Duration>,
}
impl TtlPolicy {
    pub fn should_evict_at(&self, entry: &CacheEntry, now: OffsetDateTime) -> bool {
        entry.is_expired_at(now) || self.max_age.is_some_and(|max_age| Self::aged_out(entry, max_age, now))
    }

    // A max age past the calendar's end never ages anything out.
    fn aged_out(entry: &CacheEntry, max_age: Duration, now: OffsetDateTime) -> bool {
        time::Duration::try_from(max_age)
            .ok()
            .and_then(|max_age| entry.metadata.cached_at.checked_add(max_age))
            .is_some_and(|deadline| deadline <= now)
    }
}
impl EvictionPolicy for TtlPolicy {
    fn name(&self) -> &'static str {
        "ttl"
    }

    fn should_evict(&self, entry: &CacheEntry) -> bool {
        self.should_evict_at(entry, OffsetDateTime::now_utc())
    }
}

/// Evicts any single entry whose serialised payload exceeds the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizePolicy {
    pub max_entry_bytes: u64,
}
impl EvictionPolicy for SizePolicy {
    fn name(&self) -> &'static str {
        "size"
    }

    fn should_evict(&self, entry: &CacheEntry) -> bool {
        entry.metadata.size > self.max_entry_bytes
    }
}

/// Placeholder for access-frequency eviction.
///
/// Entries carry no access counts yet, so this policy never evicts.
// TODO: Record hit counts in `EntryMetadata` so `min_hits` can take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrequencyPolicy {
    pub min_hits: u64,
}
impl EvictionPolicy for FrequencyPolicy {
    fn name(&self) -> &'static str {
        "frequency"
    }

    fn should_evict(&self, _entry: &CacheEntry) -> bool {
        false
    }
}

/// Serialisable policy selection, as found in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum PolicyConfig {
    Ttl {
        #[serde(default)]
        max_age_secs: Option<u64>,
    },
    Size {
        max_entry_bytes: u64,
    },
    Frequency {
        min_hits: u64,
    },
}
impl PolicyConfig {
    pub fn build(self) -> Box<dyn EvictionPolicy> {
        match self {
            Self::Ttl { max_age_secs } => Box::new(TtlPolicy { max_age: max_age_secs.map(Duration::from_secs) }),
            Self::Size { max_entry_bytes } => Box::new(SizePolicy { max_entry_bytes }),
            Self::Frequency { min_hits } => Box::new(FrequencyPolicy { min_hits }),
        }
    }
}
