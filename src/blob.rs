//! Audio blob storage: maps a track's storage key to a file on disk.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Invalid storage key: {0:?}")]
    InvalidKey(String),
    #[error("Blob not found: {0}")]
    Missing(String),
    #[error("Blob is empty: {0}")]
    Empty(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where audio bytes live. Analysis only ever calls [`BlobStore::resolve`].
pub trait BlobStore: Send + Sync {
    /// Readable path for `key`. Fails if the blob is missing or empty.
    fn resolve(&self, key: &str) -> Result<PathBuf, BlobError>;

    /// Copy `source` in under a fresh key with the given extension.
    fn put(&self, source: &Path, extension: &str) -> Result<String, BlobError>;

    /// Remove a blob. Removing a blob that is already gone is not an error.
    fn remove(&self, key: &str) -> Result<(), BlobError>;
}

/// Blob store backed by a flat directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Keys are a single normal path component.
    fn path_for(&self, key: &str) -> Result<PathBuf, BlobError> {
        let mut components = Path::new(key).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(key)),
            _ => Err(BlobError::InvalidKey(key.to_string())),
        }
    }
}

impl BlobStore for FsBlobStore {
    fn resolve(&self, key: &str) -> Result<PathBuf, BlobError> {
        let path = self.path_for(key)?;
        match std::fs::metadata(&path) {
            Ok(meta) if !meta.is_file() => Err(BlobError::Missing(key.to_string())),
            Ok(meta) if meta.len() == 0 => Err(BlobError::Empty(key.to_string())),
            Ok(_) => Ok(path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::Missing(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, source: &Path, extension: &str) -> Result<String, BlobError> {
        let key = format!(
            "{}.{}",
            uuid::Uuid::new_v4().simple(),
            extension.to_lowercase()
        );
        let target = self.path_for(&key)?;
        std::fs::copy(source, &target)?;
        log::debug!("Stored {} as {}", source.display(), key);
        Ok(key)
    }

    fn remove(&self, key: &str) -> Result<(), BlobError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_resolve_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().join("audio")).unwrap();

        let source = dir.path().join("song.MP3");
        std::fs::write(&source, b"ID3 not really audio").unwrap();

        let key = store.put(&source, "MP3").unwrap();
        assert!(key.ends_with(".mp3"));
        assert_eq!(key.len(), 32 + 4);

        let path = store.resolve(&key).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"ID3 not really audio");

        store.remove(&key).unwrap();
        assert!(matches!(store.resolve(&key), Err(BlobError::Missing(_))));
        // Second remove is a no-op.
        store.remove(&key).unwrap();
    }

    #[test]
    fn test_empty_blob_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("empty.wav"), b"").unwrap();
        assert!(matches!(store.resolve("empty.wav"), Err(BlobError::Empty(_))));
    }

    #[test]
    fn test_keys_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        for key in ["../etc/passwd", "a/b.mp3", "/abs.mp3", "", ".."] {
            assert!(
                matches!(store.resolve(key), Err(BlobError::InvalidKey(_))),
                "key {key:?} should be rejected"
            );
        }
    }
}
