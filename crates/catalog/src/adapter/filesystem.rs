//! Filesystem catalog: one pretty-printed JSON file per resource, all in one
//! directory, named after the percent-encoded key.

use crate::CatalogAdapter;
use crate::error::{ErrorKind, Result};
use crate::metadata::ResourceMetadata;
use async_trait::async_trait;
use exn::ResultExt;
use lectern_storage::{ResourceKey, decode_file_name, encode_file_name};
use std::path::{Path, PathBuf};
use tokio::fs;

const EXTENSION: &str = ".json";

struct CatalogFile {
    name: String,
    key: ResourceKey,
    path: PathBuf,
}

/// Filesystem catalog.
///
/// Protective merges use the default read-compare-write sequence and are not
/// atomic across concurrent writers; see
/// [`CatalogAdapter::put_guarded`].
#[derive(Clone)]
pub struct FilesystemCatalog {
    name: String,
    root: PathBuf,
}
impl FilesystemCatalog {
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

    fn path(&self, key: &ResourceKey) -> Result<PathBuf> {
        let file_name = encode_file_name(&key.to_string()).or_raise(|| ErrorKind::Storage)?;
        Ok(self.root.join(format!("{file_name}{EXTENSION}")))
    }

    fn map_io_error(e: std::io::Error, path: &Path) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
            _ => ErrorKind::Io(e),
        }
    }

    /// Catalog files, sorted by key string. A missing directory is an empty
    /// catalog.
    async fn files(&self) -> Result<Vec<CatalogFile>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => exn::bail!(Self::map_io_error(err, &self.root)),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| Self::map_io_error(e, &self.root))? {
            let path = entry.path();
            let Some(stem) = path.file_name().and_then(|name| name.to_str()).and_then(|name| name.strip_suffix(EXTENSION))
            else {
                continue;
            };
            // Anything that doesn't decode to a resource key was not written
            // by this catalog.
            let Some((name, key)) = decode_file_name(stem)
                .ok()
                .and_then(|name| name.parse::<ResourceKey>().ok().map(|key| (name, key)))
            else {
                tracing::debug!(catalog = %self.name, path = %path.display(), "skipping foreign file");
                continue;
            };
            files.push(CatalogFile { name, key, path });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn read(&self, path: &Path) -> Result<Option<ResourceMetadata>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => exn::bail!(Self::map_io_error(err, path)),
        };
        Ok(Some(serde_json::from_slice(&bytes).or_raise(|| ErrorKind::InvalidData("catalog record"))?))
    }
}

#[async_trait]
impl CatalogAdapter for FilesystemCatalog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<ResourceMetadata>> {
        let path = self.path(key)?;
        self.read(&path).await
    }

    async fn put(&self, key: &ResourceKey, metadata: &ResourceMetadata) -> Result<()> {
        let path = self.path(key)?;
        fs::create_dir_all(&self.root).await.map_err(|e| Self::map_io_error(e, &self.root))?;
        let record = metadata.clone().aligned_to(key);
        let json = serde_json::to_vec_pretty(&record).or_raise(|| ErrorKind::InvalidData("catalog record"))?;
        fs::write(&path, json).await.map_err(|e| Self::map_io_error(e, &path))?;
        Ok(())
    }

    async fn delete(&self, key: &ResourceKey) -> Result<()> {
        let path = self.path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => exn::bail!(Self::map_io_error(err, &path)),
        }
    }

    async fn clear(&self) -> Result<()> {
        for CatalogFile { path, .. } in self.files().await? {
            match fs::remove_file(&path).await {
                Ok(()) => {},
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
                Err(err) => exn::bail!(Self::map_io_error(err, &path)),
            }
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<ResourceKey>> {
        Ok(self.files().await?.into_iter().map(|file| file.key).collect())
    }

    async fn list(&self) -> Result<Vec<ResourceMetadata>> {
        let mut records = Vec::new();
        for CatalogFile { path, .. } in self.files().await? {
            // Deleted between listing and reading.
            if let Some(metadata) = self.read(&path).await? {
                records.push(metadata);
            }
        }
        Ok(records)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.files().await?.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ult() -> ResourceMetadata {
        ResourceMetadata::new("git.door43.org", "unfoldingWord", "en", "ult", "Aligned Bible", "ULT")
    }

    #[test]
    fn test_new_requires_absolute_directory() {
        assert!(FilesystemCatalog::new("fs", "relative").is_err());
        let temp_dir = tempfile::tempdir().unwrap();
        let catalog = FilesystemCatalog::new("fs", temp_dir.path().join("catalog")).unwrap();
        assert!(!catalog.root().exists());
    }

    #[tokio::test]
    async fn test_layout_on_disk() {
        let temp_dir = tempfile::tempdir().unwrap();
        let catalog = FilesystemCatalog::new("fs", temp_dir.path()).unwrap();
        catalog.put(&ult().key(), &ult()).await.unwrap();
        let path = temp_dir.path().join("git.door43.org%2FunfoldingWord%2Fen%2Fult.json");
        let stored: ResourceMetadata = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(stored, ult());
    }

    #[tokio::test]
    async fn test_foreign_files_are_ignored() {
        let temp_dir = tempfile::tempdir().unwrap();
        let catalog = FilesystemCatalog::new("fs", temp_dir.path()).unwrap();
        catalog.put(&ult().key(), &ult()).await.unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), b"hello").unwrap();
        std::fs::write(temp_dir.path().join("%FF.json"), b"{}").unwrap();
        std::fs::write(temp_dir.path().join("readme.json"), b"{\"note\": true}").unwrap();
        std::fs::write(temp_dir.path().join("a%2Fb.json"), b"[]").unwrap();
        assert_eq!(catalog.keys().await.unwrap(), vec![ult().key()]);
        assert_eq!(catalog.list().await.unwrap(), vec![ult()]);
        assert_eq!(catalog.count().await.unwrap(), 1);
        catalog.clear().await.unwrap();
        assert!(temp_dir.path().join("notes.txt").exists());
        assert!(temp_dir.path().join("readme.json").exists());
        assert_eq!(catalog.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let catalog = FilesystemCatalog::new("fs", temp_dir.path()).unwrap();
        catalog.put(&ult().key(), &ult()).await.unwrap();
        std::fs::write(catalog.path(&ult().key()).unwrap(), b"{\"server\":").unwrap();
        let err = catalog.get(&ult().key()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData(_)));
    }
}
