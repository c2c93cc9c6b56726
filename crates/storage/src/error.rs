//! Storage Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// A storage error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
/// A missing key is never one of them: absence is reported as `Ok(None)`.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Key is empty, contains a null byte, or cannot be mapped onto the backend
    #[display("invalid key: {_0:?}")]
    InvalidKey(#[error(not(source))] String),
    /// Root directory or database path is unusable
    #[display("invalid path: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    /// SQLite table name contains characters outside `[A-Za-z0-9_]`
    #[display("invalid store name: {_0:?}")]
    InvalidStoreName(#[error(not(source))] String),
    /// Access denied by the filesystem
    #[display("permission denied: {}", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    /// Underlying I/O error (disk full, quota, ...)
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// SQLite connection, schema or query failure
    #[display("database error")]
    Database,
    /// Persisted primary content could not be decoded.
    #[display("invalid stored data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Database)
    }
}
