//! Search filters and aggregate statistics over catalog metadata.

use crate::metadata::ResourceMetadata;
use lectern_storage::normalize_server;
use std::collections::{BTreeMap, BTreeSet};
use time::OffsetDateTime;

/// Conjunction of optional criteria. An empty filter matches everything.
///
/// Identity criteria compare against the canonical key components, so
/// `server` ignores case and scheme and `resource_id` ignores case.
/// `subject` matches either the subject or the resource type. `query` is a
/// case-insensitive substring match over title and description.
///
/// # Examples
///
/// ```
/// use lectern_catalog::SearchFilters;
///
/// let filters = SearchFilters::default().language("en").owner("unfoldingWord").limit(20);
/// assert!(!filters.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    pub server: Option<String>,
    pub owner: Option<String>,
    pub language: Option<String>,
    pub subject: Option<String>,
    pub resource_id: Option<String>,
    pub version: Option<String>,
    pub has_books: Option<bool>,
    pub has_relations: Option<bool>,
    pub query: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// A column the SQLite catalog keeps an index on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexedField {
    Server,
    Owner,
    Language,
    Subject,
}

impl SearchFilters {
    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn has_books(mut self, has_books: bool) -> Self {
        self.has_books = Some(has_books);
        self
    }

    pub fn has_relations(mut self, has_relations: bool) -> Self {
        self.has_relations = Some(has_relations);
        self
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// `true` if no criterion is set. Pagination is not a criterion.
    pub fn is_empty(&self) -> bool {
        self.criteria_count() == 0
    }

    fn criteria_count(&self) -> usize {
        [
            self.server.is_some(),
            self.owner.is_some(),
            self.language.is_some(),
            self.subject.is_some(),
            self.resource_id.is_some(),
            self.version.is_some(),
            self.has_books.is_some(),
            self.has_relations.is_some(),
            self.query.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }

    /// The single indexed criterion, if it is the only criterion.
    pub(crate) fn indexed_field(&self) -> Option<(IndexedField, String)> {
        if self.criteria_count() != 1 {
            return None;
        }
        if let Some(server) = &self.server {
            return Some((IndexedField::Server, normalize_server(server)));
        }
        if let Some(owner) = &self.owner {
            return Some((IndexedField::Owner, owner.clone()));
        }
        if let Some(language) = &self.language {
            return Some((IndexedField::Language, language.clone()));
        }
        self.subject.clone().map(|subject| (IndexedField::Subject, subject))
    }

    pub fn matches(&self, metadata: &ResourceMetadata) -> bool {
        let key = metadata.key();
        let query = self.query.as_deref().map(str::to_lowercase);
        self.server.as_deref().is_none_or(|server| normalize_server(server) == key.server())
            && self.owner.as_deref().is_none_or(|owner| owner == key.owner())
            && self.language.as_deref().is_none_or(|language| language == key.language())
            && self.resource_id.as_deref().is_none_or(|id| id.to_lowercase() == key.resource_id())
            && self.subject.as_deref().is_none_or(|subject| {
                subject == metadata.subject || metadata.resource_type.as_deref() == Some(subject)
            })
            && self.version.as_deref().is_none_or(|version| metadata.version.as_deref() == Some(version))
            && self.has_books.is_none_or(|has_books| has_books == metadata.has_books())
            && self.has_relations.is_none_or(|has_relations| has_relations == metadata.has_relations())
            && query.is_none_or(|query| {
                metadata.title.to_lowercase().contains(&query)
                    || metadata.description.as_deref().is_some_and(|d| d.to_lowercase().contains(&query))
            })
    }

    /// Filter then paginate.
    pub fn apply(&self, resources: impl IntoIterator<Item = ResourceMetadata>) -> Vec<ResourceMetadata> {
        resources
            .into_iter()
            .filter(|metadata| self.matches(metadata))
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Aggregate figures over the whole catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogStats {
    pub total_resources: u64,
    pub servers: u64,
    pub owners: u64,
    pub languages: u64,
    pub by_subject: BTreeMap<String, u64>,
    pub by_language: BTreeMap<String, u64>,
    pub by_owner: BTreeMap<String, u64>,
    /// Only resources that declare a type are counted here.
    pub by_type: BTreeMap<String, u64>,
    pub oldest_cataloged: Option<OffsetDateTime>,
    pub newest_cataloged: Option<OffsetDateTime>,
}
impl CatalogStats {
    pub fn from_resources<'a>(resources: impl IntoIterator<Item = &'a ResourceMetadata>) -> Self {
        let mut stats = Self::default();
        let mut servers = BTreeSet::new();
        for metadata in resources {
            let key = metadata.key();
            stats.total_resources += 1;
            servers.insert(key.server().to_string());
            *stats.by_subject.entry(metadata.subject.clone()).or_default() += 1;
            *stats.by_language.entry(key.language().to_string()).or_default() += 1;
            *stats.by_owner.entry(key.owner().to_string()).or_default() += 1;
            if let Some(resource_type) = &metadata.resource_type {
                *stats.by_type.entry(resource_type.clone()).or_default() += 1;
            }
            if let Some(cataloged_at) = metadata.cataloged_at {
                stats.oldest_cataloged = Some(stats.oldest_cataloged.map_or(cataloged_at, |t| t.min(cataloged_at)));
                stats.newest_cataloged = Some(stats.newest_cataloged.map_or(cataloged_at, |t| t.max(cataloged_at)));
            }
        }
        stats.servers = servers.len() as u64;
        stats.owners = stats.by_owner.len() as u64;
        stats.languages = stats.by_language.len() as u64;
        stats
    }
}
