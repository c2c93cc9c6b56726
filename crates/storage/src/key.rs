//! Key validation and key-to-path mapping.
//!
//! Storage keys are arbitrary non-empty strings. The filesystem adapter maps
//! them onto a directory tree by treating `/` as a separator and
//! percent-encoding every segment, so the mapping can always be reversed when
//! listing keys back out of the tree.

use crate::error::{ErrorKind, Result};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use std::path::{Component, Path, PathBuf};

/// Characters that are unsafe (or ambiguous) inside a single file name.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'\\')
    .add(b'%')
    .add(b':')
    .add(b'*')
    .add(b'?')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'|');

/// Suffix of a payload file in the filesystem layout.
pub(crate) const DATA_SUFFIX: &str = ".data";
/// Suffix of a metadata sidecar in the filesystem layout.
pub(crate) const META_SUFFIX: &str = ".meta.json";
const RESERVED_SUFFIXES: [&str; 2] = [DATA_SUFFIX, META_SUFFIX];

/// Validates a storage key.
///
/// Rejects empty keys and keys containing null bytes. Every adapter runs
/// this before touching its backing store so that all backends accept the
/// same key space.
///
/// # Examples
///
/// ```
/// use lectern_storage::validate_key;
/// assert!(validate_key("git.door43.org/unfoldingWord/en/ult/gen").is_ok());
/// assert!(validate_key("").is_err());
/// assert!(validate_key("a\0b").is_err());
/// ```
pub fn validate(key: &str) -> Result<&str> {
    if key.is_empty() || key.contains('\0') {
        exn::bail!(ErrorKind::InvalidKey(key.to_string()));
    }
    Ok(key)
}

/// Map a key onto a relative path, one directory level per `/` separated
/// segment.
///
/// Empty segments (`a//b`, leading or trailing `/`) cannot be represented
/// in a directory tree and are rejected.
pub(crate) fn to_relative_path(key: &str) -> Result<PathBuf> {
    let key = validate(key)?;
    let mut path = PathBuf::new();
    for segment in key.split('/') {
        if segment.is_empty() {
            exn::bail!(ErrorKind::InvalidKey(key.to_string()));
        }
        path.push(encode_segment(segment));
    }
    Ok(path)
}

/// Reverse of [`to_relative_path`].
pub(crate) fn from_relative_path(path: &Path) -> Result<String> {
    let mut segments = Vec::new();
    for component in path.components() {
        let Component::Normal(segment) = component else {
            exn::bail!(ErrorKind::InvalidPath(path.to_path_buf()));
        };
        let segment = segment.to_str().ok_or_else(|| exn::Exn::from(ErrorKind::InvalidPath(path.to_path_buf())))?;
        let decoded = percent_decode_str(segment)
            .decode_utf8()
            .map_err(|_| exn::Exn::from(ErrorKind::InvalidPath(path.to_path_buf())))?;
        segments.push(decoded.into_owned());
    }
    if segments.is_empty() {
        exn::bail!(ErrorKind::InvalidPath(path.to_path_buf()));
    }
    Ok(segments.join("/"))
}

/// Encode a whole key (separators included) as a single file name.
///
/// Used where entries live flat in one directory rather than in a tree.
pub fn encode_file_name(key: &str) -> Result<String> {
    Ok(encode_segment(validate(key)?))
}

/// Reverse of [`encode_file_name`].
pub fn decode_file_name(name: &str) -> Result<String> {
    let decoded = percent_decode_str(name)
        .decode_utf8()
        .map_err(|_| exn::Exn::from(ErrorKind::InvalidPath(PathBuf::from(name))))?;
    Ok(validate(&decoded)?.to_string())
}

fn encode_segment(segment: &str) -> String {
    let encoded = utf8_percent_encode(segment, PATH_SEGMENT).to_string();
    // `.` and `..` would be swallowed (or worse, followed) by the filesystem,
    // and dotfiles are hidden on most platforms.
    let encoded = match encoded.strip_prefix('.') {
        Some(rest) => format!("%2E{rest}"),
        None => encoded,
    };
    // An encoded segment never ends in a reserved suffix, so no directory can
    // share a name with a payload or sidecar file.
    match RESERVED_SUFFIXES.iter().find_map(|suffix| encoded.strip_suffix(suffix).map(|stem| (stem, suffix))) {
        Some((stem, suffix)) => format!("{stem}%2E{}", &suffix[1..]),
        None => encoded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("simple")]
    #[case("git.door43.org/unfoldingWord/en/ult/gen")]
    #[case("with spaces/and:colons")]
    #[case("percent%2Fencoded/already")]
    #[case("../escape/attempt")]
    #[case("./.hidden/..")]
    #[case("back\\slash")]
    #[case("español/ñ")]
    #[case("a.data/x")]
    #[case("k.meta.json/y.meta.data")]
    #[case(".data")]
    fn test_path_mapping_is_reversible(#[case] key: &str) {
        let path = to_relative_path(key).unwrap();
        assert_eq!(from_relative_path(&path).unwrap(), key);
    }

    #[test]
    fn test_path_never_escapes_root() {
        let path = to_relative_path("../../etc/passwd").unwrap();
        assert!(path.components().all(|c| matches!(c, Component::Normal(_))));
        assert_eq!(path, Path::new("%2E./%2E./etc/passwd"));
    }

    #[test]
    fn test_segments_become_directories() {
        let path = to_relative_path("server/owner/lang/res/book").unwrap();
        assert_eq!(path.components().count(), 5);
    }

    #[rstest]
    #[case("")]
    #[case("a//b")]
    #[case("/leading")]
    #[case("trailing/")]
    #[case("nul\0byte")]
    fn test_unrepresentable_keys(#[case] key: &str) {
        let err = to_relative_path(key).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidKey(_)));
    }

    #[rstest]
    #[case("a.data", "a%2Edata")]
    #[case("k.meta.json", "k%2Emeta.json")]
    #[case("a.meta.data", "a.meta%2Edata")]
    #[case(".data", "%2Edata")]
    #[case("plain.json", "plain.json")]
    fn test_segments_never_end_in_reserved_suffix(#[case] segment: &str, #[case] encoded: &str) {
        assert_eq!(encode_segment(segment), encoded);
        assert_eq!(from_relative_path(Path::new(encoded)).unwrap(), segment);
    }

    #[rstest]
    #[case("git.door43.org/unfoldingWord/en/ult", "git.door43.org%2FunfoldingWord%2Fen%2Fult")]
    #[case("../up", "%2E.%2Fup")]
    #[case("50%", "50%25")]
    fn test_file_name_mapping(#[case] key: &str, #[case] file_name: &str) {
        assert_eq!(encode_file_name(key).unwrap(), file_name);
        assert_eq!(decode_file_name(file_name).unwrap(), key);
    }

    #[test]
    fn test_validate() {
        assert!(validate("k").is_ok());
        assert!(validate("a//b").is_ok());
        assert!(validate("").is_err());
        assert!(validate("\0").is_err());
    }
}
