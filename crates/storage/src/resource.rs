//! Resource coordinates and their canonical key string.

use crate::error::{Error, ErrorKind};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use std::fmt;
use std::str::FromStr;

/// Characters escaped inside a single key component. Escaping `%` as well as
/// the `/` separator keeps the encoding injective.
const COMPONENT: &AsciiSet = &CONTROLS.add(b'/').add(b'%').add(b'\\');

/// Coordinates of a resource (and optionally one book within it).
///
/// The canonical string form `server/owner/language/resource_id[/book]` is
/// the single key used by both the content cache and the catalog. Components
/// are normalised on construction so that every caller describing the same
/// resource ends up with the same key.
///
/// # Examples
///
/// ```
/// use lectern_storage::ResourceKey;
///
/// let key = ResourceKey::new("https://Git.Door43.org/", "unfoldingWord", "en", "ULT").with_book("GEN");
/// assert_eq!(key.to_string(), "git.door43.org/unfoldingWord/en/ult/gen");
/// assert_eq!(key.to_string().parse::<ResourceKey>().unwrap(), key);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    server: String,
    owner: String,
    language: String,
    resource_id: String,
    book: Option<String>,
}
impl ResourceKey {
    pub fn new(
        server: impl AsRef<str>,
        owner: impl AsRef<str>,
        language: impl AsRef<str>,
        resource_id: impl AsRef<str>,
    ) -> Self {
        Self {
            server: normalize_server(server.as_ref()),
            owner: owner.as_ref().trim().to_string(),
            language: language.as_ref().trim().to_string(),
            resource_id: resource_id.as_ref().trim().to_lowercase(),
            book: None,
        }
    }

    pub fn with_book(mut self, book: impl AsRef<str>) -> Self {
        let book = book.as_ref().trim().to_lowercase();
        self.book = (!book.is_empty()).then_some(book);
        self
    }

    /// The resource-level key (book removed), as used by the catalog.
    pub fn resource(&self) -> Self {
        Self { book: None, ..self.clone() }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn book(&self) -> Option<&str> {
        self.book.as_deref()
    }

    fn components(&self) -> impl Iterator<Item = &str> {
        [self.server.as_str(), self.owner.as_str(), self.language.as_str(), self.resource_id.as_str()]
            .into_iter()
            .chain(self.book.as_deref())
    }
}

/// Canonical form of a server name: trimmed, lower-cased, without scheme or
/// trailing slash.
pub fn normalize_server(server: &str) -> String {
    let server = server.trim().to_lowercase();
    let stripped = server
        .strip_prefix("https://")
        .or_else(|| server.strip_prefix("http://"))
        .unwrap_or(&server);
    stripped.trim_end_matches('/').to_string()
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, component) in self.components().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}", utf8_percent_encode(component, COMPONENT))?;
        }
        Ok(())
    }
}

impl FromStr for ResourceKey {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || exn::Exn::from(ErrorKind::InvalidKey(s.to_string()));
        let mut parts = Vec::with_capacity(5);
        for part in s.split('/') {
            let decoded = percent_decode_str(part).decode_utf8().map_err(|_| invalid())?;
            if decoded.trim().is_empty() {
                return Err(invalid());
            }
            parts.push(decoded);
        }
        match parts.as_slice() {
            [server, owner, language, resource_id] => Ok(Self::new(server, owner, language, resource_id)),
            [server, owner, language, resource_id, book] => {
                Ok(Self::new(server, owner, language, resource_id).with_book(book))
            },
            _ => Err(invalid()),
        }
    }
}
