//! The unit of cached content.
//!
//! Adapters store [`CacheEntry`] values opaquely; the only part of an entry
//! they ever interpret is [`CacheEntry::expires_at`], so that expired entries
//! read as absent and can be pruned.

use crate::error::{ErrorKind, Result};
use derive_more::Display;
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

/// Cached payload. The cache is agnostic to what the bytes mean (USFM, TSV,
/// markdown, a parsed manifest...), it only needs to know how to persist them.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Text(String),
    Json(serde_json::Value),
    Binary(Vec<u8>),
}
impl Content {
    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Text(_) => ContentKind::Text,
            Self::Json(_) => ContentKind::Json,
            Self::Binary(_) => ContentKind::Binary,
        }
    }

    /// Serialised form, as written to disk or a database blob.
    pub fn to_bytes(&self) -> Cow<'_, [u8]> {
        match self {
            Self::Text(text) => Cow::Borrowed(text.as_bytes()),
            // `Value`'s Display impl is compact JSON and cannot fail.
            Self::Json(value) => Cow::Owned(value.to_string().into_bytes()),
            Self::Binary(bytes) => Cow::Borrowed(bytes),
        }
    }

    /// Decode the serialised form of a payload of the given kind.
    ///
    /// Returns [`InvalidData`](ErrorKind::InvalidData) if text is not UTF-8
    /// or JSON does not parse.
    pub fn from_bytes(kind: ContentKind, bytes: Vec<u8>) -> Result<Self> {
        Ok(match kind {
            ContentKind::Text => Self::Text(String::from_utf8(bytes).or_raise(|| ErrorKind::InvalidData("text content"))?),
            ContentKind::Json => {
                Self::Json(serde_json::from_slice(&bytes).or_raise(|| ErrorKind::InvalidData("json content"))?)
            },
            ContentKind::Binary => Self::Binary(bytes),
        })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}
impl From<String> for Content {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}
impl From<&str> for Content {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}
impl From<serde_json::Value> for Content {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}
impl From<Vec<u8>> for Content {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    #[display("text")]
    Text,
    #[display("json")]
    Json,
    #[display("binary")]
    Binary,
}
impl FromStr for ContentKind {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "binary" => Ok(Self::Binary),
            _ => exn::bail!(ErrorKind::InvalidData("content kind")),
        }
    }
}

/// Size and integrity information recorded alongside each payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub kind: ContentKind,
    #[serde(with = "time::serde::rfc3339")]
    pub cached_at: OffsetDateTime,
    /// Byte length of the serialised payload.
    pub size: u64,
    /// BLAKE3 hex digest of the serialised payload.
    pub checksum: String,
}
impl EntryMetadata {
    /// Compute metadata for a payload, stamped with the given time.
    pub fn describe(content: &Content, cached_at: OffsetDateTime) -> Self {
        let bytes = content.to_bytes();
        Self {
            kind: content.kind(),
            cached_at,
            size: bytes.len() as u64,
            checksum: blake3::hash(&bytes).to_hex().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub content: Content,
    /// Entries at or past this instant read as absent.
    pub expires_at: Option<OffsetDateTime>,
    pub metadata: EntryMetadata,
}
impl CacheEntry {
    /// Wrap content that never expires.
    pub fn new(content: impl Into<Content>) -> Self {
        let content = content.into();
        let metadata = EntryMetadata::describe(&content, OffsetDateTime::now_utc());
        Self { content, expires_at: None, metadata }
    }

    pub fn expires_at(mut self, instant: OffsetDateTime) -> Self {
        self.expires_at = Some(instant);
        self
    }

    /// Expire `ttl` after the entry was cached. A ttl reaching past the
    /// calendar's end leaves the entry without an expiry.
    pub fn expires_in(self, ttl: Duration) -> Self {
        let instant = time::Duration::try_from(ttl)
            .ok()
            .and_then(|ttl| self.metadata.cached_at.checked_add(ttl));
        match instant {
            Some(instant) => self.expires_at(instant),
            None => self,
        }
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(Content::Text("\\v 1 In the beginning".to_string()), ContentKind::Text)]
    #[case(Content::Json(json!({"books": ["gen", "exo"]})), ContentKind::Json)]
    #[case(Content::Binary(vec![0, 159, 146, 150]), ContentKind::Binary)]
    fn test_bytes_round_trip(#[case] content: Content, #[case] kind: ContentKind) {
        assert_eq!(content.kind(), kind);
        let bytes = content.to_bytes().into_owned();
        assert_eq!(Content::from_bytes(kind, bytes).unwrap(), content);
    }

    #[test]
    fn test_invalid_bytes() {
        let err = Content::from_bytes(ContentKind::Text, vec![0, 159, 146, 150]).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData("text content")));
        let err = Content::from_bytes(ContentKind::Json, b"{not json".to_vec()).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData("json content")));
    }

    #[rstest]
    #[case(ContentKind::Text, "text")]
    #[case(ContentKind::Json, "json")]
    #[case(ContentKind::Binary, "binary")]
    fn test_kind_strings(#[case] kind: ContentKind, #[case] name: &str) {
        assert_eq!(kind.to_string(), name);
        assert_eq!(name.parse::<ContentKind>().unwrap(), kind);
    }

    #[test]
    fn test_metadata() {
        let entry = CacheEntry::new("hello");
        assert_eq!(entry.metadata.kind, ContentKind::Text);
        assert_eq!(entry.metadata.size, 5);
        assert_eq!(entry.metadata.checksum, blake3::hash(b"hello").to_hex().to_string());
        let entry = CacheEntry::new(json!({"a": 1}));
        assert_eq!(entry.metadata.size, br#"{"a":1}"#.len() as u64);
    }

    #[test]
    fn test_expiry() {
        let entry = CacheEntry::new("x");
        assert!(!entry.is_expired());
        let entry = entry.expires_in(Duration::from_secs(60));
        assert!(!entry.is_expired());
        assert!(entry.is_expired_at(entry.metadata.cached_at + Duration::from_secs(60)));
        let entry = CacheEntry::new("x").expires_at(OffsetDateTime::now_utc() - Duration::from_secs(1));
        assert!(entry.is_expired());
    }

    #[test]
    fn test_unrepresentable_ttl_never_expires() {
        let entry = CacheEntry::new("x").expires_in(Duration::from_secs(u64::MAX));
        assert_eq!(entry.expires_at, None);
        let entry = CacheEntry::new("x").expires_in(Duration::from_secs(400 * 365 * 24 * 60 * 60 * 100));
        assert_eq!(entry.expires_at, None);
    }
}
