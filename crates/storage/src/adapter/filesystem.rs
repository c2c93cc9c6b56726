//! Local filesystem storage adapter.
//!
//! Every entry becomes two files under the adapter's root directory: the raw
//! payload (`<path>.data`) and a JSON sidecar holding its metadata and expiry
//! (`<path>.meta.json`). Keys map onto the tree one directory per `/`
//! separated segment, see [`crate::key`].

use super::KeyStream;
use crate::entry::{CacheEntry, Content, ContentKind, EntryMetadata};
use crate::error::{ErrorKind, Result};
use crate::key::{DATA_SUFFIX, META_SUFFIX, from_relative_path, to_relative_path};
use crate::StorageAdapter;
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use futures::{Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;
use tokio::fs::{self, DirEntry};

static STAGING_SEQUENCE: AtomicU64 = AtomicU64::new(0);

type DataFileStream<'a> = Pin<Box<dyn Stream<Item = Result<DataFile>> + Send + 'a>>;

/// Sidecar written next to every payload.
#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    #[serde(flatten)]
    metadata: EntryMetadata,
    #[serde(default, with = "time::serde::rfc3339::option")]
    expires_at: Option<OffsetDateTime>,
}

impl Sidecar {
    /// Whether this sidecar was written for `bytes`.
    fn describes(&self, bytes: &[u8]) -> bool {
        self.metadata.size == bytes.len() as u64 && self.metadata.checksum == blake3::hash(bytes).to_hex().as_str()
    }
}

/// A payload file found while walking the tree.
struct DataFile {
    key: String,
    len: u64,
}

enum WalkEntry {
    File(DataFile),
    Descend(PathBuf),
    Skip,
}

/// On-disk locations of one entry.
struct EntryPaths {
    data: PathBuf,
    meta: PathBuf,
}

/// Local filesystem storage adapter.
///
/// The root directory is created on first write, never by the constructor.
///
/// # Examples
///
/// ```no_run
/// use lectern_storage::FilesystemAdapter;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let adapter = FilesystemAdapter::new("resource-cache", "/var/cache/lectern/resources")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct FilesystemAdapter {
    name: String,
    root: PathBuf,
}
impl FilesystemAdapter {
    /// Create a new filesystem adapter.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidPath`](ErrorKind::InvalidPath) if `root` is not
    /// absolute, or exists and is not a directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() || (root.exists() && !root.is_dir()) {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        Ok(Self { name: name.into(), root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn paths(&self, key: &str) -> Result<EntryPaths> {
        let relative = to_relative_path(key)?;
        let base = self.root.join(relative).into_os_string();
        let mut data = base.clone();
        data.push(DATA_SUFFIX);
        let mut meta = base;
        meta.push(META_SUFFIX);
        Ok(EntryPaths { data: data.into(), meta: meta.into() })
    }

    fn map_io_error(e: std::io::Error, path: &Path) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
            _ => ErrorKind::Io(e),
        }
    }

    async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => exn::bail!(Self::map_io_error(err, path)),
        }
    }

    async fn remove_optional(path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => exn::bail!(Self::map_io_error(err, path)),
        }
    }

    /// Read a sidecar. Missing or unparseable sidecars are logged and
    /// reported as `None`; only genuine I/O failures are errors.
    async fn load_sidecar(&self, path: &Path) -> Result<Option<Sidecar>> {
        let Some(bytes) = Self::read_optional(path).await? else {
            tracing::warn!(adapter = %self.name, path = %path.display(), "missing metadata sidecar");
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(sidecar) => Ok(Some(sidecar)),
            Err(err) => {
                tracing::warn!(adapter = %self.name, path = %path.display(), %err, "malformed metadata sidecar");
                Ok(None)
            },
        }
    }

    /// Metadata for a payload whose sidecar is unusable. The entry never
    /// expires and is dated by the payload's modification time.
    async fn fallback_sidecar(data_path: &Path, bytes: &[u8]) -> Sidecar {
        let kind = match std::str::from_utf8(bytes) {
            Ok(_) => ContentKind::Text,
            Err(_) => ContentKind::Binary,
        };
        let cached_at = match fs::metadata(data_path).await.and_then(|m| m.modified()) {
            Ok(modified) => OffsetDateTime::from(modified),
            Err(_) => OffsetDateTime::now_utc(),
        };
        Sidecar {
            metadata: EntryMetadata {
                kind,
                cached_at,
                size: bytes.len() as u64,
                checksum: blake3::hash(bytes).to_hex().to_string(),
            },
            expires_at: None,
        }
    }

    /// Write `bytes` to a hidden temporary file next to `target`, ready to be
    /// renamed into place. Encoded key segments never start with `.`, so
    /// staging files can't collide with entries and are skipped by the walk.
    async fn stage(target: &Path, bytes: &[u8]) -> Result<PathBuf> {
        let file_name = target.file_name().and_then(|name| name.to_str()).unwrap_or_default();
        let sequence = STAGING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let staged = target.with_file_name(format!(".{file_name}.{}.{sequence}.tmp", std::process::id()));
        fs::write(&staged, bytes).await.map_err(|e| Self::map_io_error(e, &staged))?;
        Ok(staged)
    }

    async fn remove_entry(paths: &EntryPaths) -> Result<()> {
        Self::remove_optional(&paths.data).await?;
        Self::remove_optional(&paths.meta).await
    }

    /// Map an absolute payload path back to its key.
    fn key_for(&self, data_path: &Path) -> Result<Option<String>> {
        let Some(file_name) = data_path.file_name().and_then(|name| name.to_str()) else {
            return Ok(None);
        };
        let Some(stem) = file_name.strip_suffix(DATA_SUFFIX).filter(|stem| !stem.is_empty()) else {
            return Ok(None);
        };
        let relative = data_path
            .strip_prefix(&self.root)
            .map_err(|_| exn::Exn::from(ErrorKind::InvalidPath(data_path.to_path_buf())))?
            .with_file_name(stem);
        Ok(Some(from_relative_path(&relative)?))
    }

    async fn process_entry(&self, entry: DirEntry) -> Result<WalkEntry> {
        let path = entry.path();
        let metadata = entry.metadata().await.map_err(|e| Self::map_io_error(e, &path))?;
        if metadata.is_dir() {
            return Ok(WalkEntry::Descend(path));
        }
        if metadata.is_file()
            && let Some(key) = self.key_for(&path)?
        {
            return Ok(WalkEntry::File(DataFile { key, len: metadata.len() }));
        }
        // Sidecars, stray files and broken symlinks.
        Ok(WalkEntry::Skip)
    }

    /// Walk the tree, yielding every payload file.
    fn data_files<'a>(&'a self) -> DataFileStream<'a> {
        let mut stack = vec![self.root.clone()];
        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // Nothing has been written yet.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        yield Err(exn::Exn::from(Self::map_io_error(err, &current)));
                        continue 'dirs;
                    }
                };
                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => { yield Err(exn::Exn::from(Self::map_io_error(e, &current))); break 'entries; },
                    };
                    match self.process_entry(entry).await {
                        Ok(WalkEntry::File(file)) => yield Ok(file),
                        Ok(WalkEntry::Descend(dir)) => stack.push(dir),
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }
}

#[async_trait]
impl StorageAdapter for FilesystemAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let paths = self.paths(key)?;
        let Some(bytes) = Self::read_optional(&paths.data).await? else {
            return Ok(None);
        };
        let sidecar = match self.load_sidecar(&paths.meta).await? {
            Some(sidecar) if sidecar.describes(&bytes) => sidecar,
            Some(_) => {
                tracing::warn!(adapter = %self.name, key, "metadata sidecar does not match payload");
                Self::fallback_sidecar(&paths.data, &bytes).await
            },
            None => Self::fallback_sidecar(&paths.data, &bytes).await,
        };
        if sidecar.expires_at.is_some_and(|expiry| expiry <= OffsetDateTime::now_utc()) {
            tracing::trace!(adapter = %self.name, key, "evicting expired entry on read");
            Self::remove_entry(&paths).await?;
            return Ok(None);
        }
        let content = Content::from_bytes(sidecar.metadata.kind, bytes)?;
        Ok(Some(CacheEntry { content, expires_at: sidecar.expires_at, metadata: sidecar.metadata }))
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let paths = self.paths(key)?;
        if let Some(parent) = paths.data.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Self::map_io_error(e, parent))?;
        }
        let sidecar = Sidecar { metadata: entry.metadata.clone(), expires_at: entry.expires_at };
        let sidecar = serde_json::to_vec(&sidecar).or_raise(|| ErrorKind::InvalidData("metadata sidecar"))?;
        let data_staged = Self::stage(&paths.data, &entry.content.to_bytes()).await?;
        let meta_staged = match Self::stage(&paths.meta, &sidecar).await {
            Ok(staged) => staged,
            Err(err) => {
                Self::remove_optional(&data_staged).await?;
                return Err(err);
            },
        };
        // Sidecar last: a reader between the two renames sees a checksum
        // mismatch and ignores the old sidecar.
        fs::rename(&data_staged, &paths.data).await.map_err(|e| Self::map_io_error(e, &paths.data))?;
        fs::rename(&meta_staged, &paths.meta).await.map_err(|e| Self::map_io_error(e, &paths.meta))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let paths = self.paths(key)?;
        Self::remove_entry(&paths).await
    }

    async fn clear(&self) -> Result<()> {
        // Empty the root rather than removing it; it may be a mount point.
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => exn::bail!(Self::map_io_error(err, &self.root)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| Self::map_io_error(e, &self.root))? {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(|e| Self::map_io_error(e, &path))?;
            let removed = if file_type.is_dir() { fs::remove_dir_all(&path).await } else { fs::remove_file(&path).await };
            removed.map_err(|e| Self::map_io_error(e, &path))?;
        }
        Ok(())
    }

    fn keys_stream<'a>(&'a self) -> KeyStream<'a> {
        Box::pin(self.data_files().map_ok(|file| file.key))
    }

    async fn size(&self) -> Result<u64> {
        self.data_files().try_fold(0u64, |total, file| async move { Ok::<_, crate::error::Error>(total + file.len) }).await
    }

    async fn prune(&self) -> Result<u64> {
        let files: Vec<DataFile> = self.data_files().try_collect().await?;
        let now = OffsetDateTime::now_utc();
        let mut removed = 0;
        for file in files {
            let paths = self.paths(&file.key)?;
            let Some(sidecar) = self.load_sidecar(&paths.meta).await? else {
                continue;
            };
            if !sidecar.expires_at.is_some_and(|expiry| expiry <= now) {
                continue;
            }
            // Only an expiry that belongs to the current payload counts.
            let current = Self::read_optional(&paths.data).await?.is_some_and(|bytes| sidecar.describes(&bytes));
            if current {
                Self::remove_entry(&paths).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
