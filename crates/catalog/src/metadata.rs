//! Resource metadata as held by the catalog.

use lectern_storage::ResourceKey;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;

/// One entry of a resource's table of contents: a book, an article, a
/// notes file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ingredient {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<u32>,
}
impl Ingredient {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self { identifier: identifier.into(), title: None, path: None, sort: None }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Everything the catalog knows about one resource.
///
/// The ingredient list doubles as the richness signal for the protective
/// merge: a sparse update may not replace a rich one (see
/// [`MergePolicy`](crate::MergePolicy)).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub server: String,
    pub owner: String,
    pub language: String,
    pub resource_id: String,
    /// Broad category, e.g. "Bible" or "Translation Notes".
    pub subject: String,
    /// Finer classification, e.g. "bundle" or "help".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub ingredients: Vec<Ingredient>,
    /// Keys of related resources (`server/owner/language/resource_id`).
    #[serde(default)]
    pub relations: Vec<String>,
    #[serde(default)]
    pub available: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub cataloged_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
}
impl ResourceMetadata {
    /// Minimal metadata with the identity fields filled in.
    pub fn new(
        server: impl Into<String>,
        owner: impl Into<String>,
        language: impl Into<String>,
        resource_id: impl Into<String>,
        subject: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            owner: owner.into(),
            language: language.into(),
            resource_id: resource_id.into(),
            subject: subject.into(),
            resource_type: None,
            title: title.into(),
            description: None,
            version: None,
            ingredients: Vec::new(),
            relations: Vec::new(),
            available: true,
            cataloged_at: None,
            last_updated: None,
        }
    }

    /// The resource-level key derived from the identity fields.
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.server, &self.owner, &self.language, &self.resource_id)
    }

    /// Rewrite the identity fields from the key the record is stored under.
    pub(crate) fn aligned_to(mut self, key: &ResourceKey) -> Self {
        self.server = key.server().to_owned();
        self.owner = key.owner().to_owned();
        self.language = key.language().to_owned();
        self.resource_id = key.resource_id().to_owned();
        self
    }

    pub fn has_books(&self) -> bool {
        !self.ingredients.is_empty()
    }

    pub fn has_relations(&self) -> bool {
        !self.relations.is_empty()
    }

    /// Whether the metadata was last refreshed (or, failing that, cataloged)
    /// more than `max_age` ago. Metadata with neither timestamp is stale.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.is_stale_at(max_age, OffsetDateTime::now_utc())
    }

    pub fn is_stale_at(&self, max_age: Duration, now: OffsetDateTime) -> bool {
        match self.last_updated.or(self.cataloged_at) {
            // A max age past the calendar's end never goes stale.
            Some(refreshed) => time::Duration::try_from(max_age)
                .ok()
                .and_then(|max_age| refreshed.checked_add(max_age))
                .is_some_and(|deadline| deadline < now),
            None => true,
        }
    }
}
