//! The protective merge rule.
//!
//! Metadata arrives from sources of very different fidelity: a fully
//! enumerated table of contents computed offline, or a bare directory listing
//! from a live API call. A write that would replace a rich ingredient list
//! with a shorter one is refused.

use crate::metadata::ResourceMetadata;
use time::OffsetDateTime;

/// Ingredient count above which existing metadata is considered rich.
pub const DEFAULT_MERGE_THRESHOLD: usize = 10;

/// What happened to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// The stored metadata was kept; both ingredient counts are reported.
    Rejected { existing: usize, incoming: usize },
}
impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, Self::Saved)
    }
}

/// Outcome of resolving one write against what is stored.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Resolution {
    Write(ResourceMetadata),
    Reject(SaveOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePolicy {
    pub threshold: usize,
}
impl Default for MergePolicy {
    fn default() -> Self {
        Self { threshold: DEFAULT_MERGE_THRESHOLD }
    }
}
impl MergePolicy {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    /// `false` when `existing` is rich and `incoming` has fewer ingredients.
    pub fn permits(&self, existing: &ResourceMetadata, incoming: &ResourceMetadata) -> bool {
        let (existing, incoming) = (existing.ingredients.len(), incoming.ingredients.len());
        !(existing > self.threshold && incoming < existing)
    }

    /// Decide a write and prepare the record to store.
    ///
    /// Accepted records keep the stored `cataloged_at` when the incoming one
    /// has none; brand new records without one are stamped with `now`.
    pub(crate) fn resolve(
        &self,
        existing: Option<&ResourceMetadata>,
        incoming: &ResourceMetadata,
        now: OffsetDateTime,
    ) -> Resolution {
        if let Some(existing) = existing
            && !self.permits(existing, incoming)
        {
            return Resolution::Reject(SaveOutcome::Rejected {
                existing: existing.ingredients.len(),
                incoming: incoming.ingredients.len(),
            });
        }
        let mut record = incoming.clone();
        if record.cataloged_at.is_none() {
            record.cataloged_at = Some(existing.and_then(|existing| existing.cataloged_at).unwrap_or(now));
        }
        Resolution::Write(record)
    }
}
