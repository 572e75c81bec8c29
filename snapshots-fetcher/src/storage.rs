//! Persistent content storage, keyed by content id.
//!
//! The [`ContentStorage`] trait is the only way the fetcher touches stored content. Two
//! implementations are provided: [`FsStorage`], one file per id in a directory, and
//! [`MemStorage`] which keeps everything in memory.
use std::{
    collections::HashMap,
    fmt::Debug,
    future::Future,
    io,
    path::{Path, PathBuf},
    pin::Pin,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

/// A readable stream of stored content.
pub type ContentReader = Pin<Box<dyn AsyncRead + Send>>;

/// Storage backend for content-addressed blobs.
///
/// Each operation is assumed to be individually atomic. Storing under an existing id
/// replaces the content.
pub trait ContentStorage: Debug + Send + Sync + 'static {
    /// Returns whether content is stored under `id`.
    fn exists(&self, id: &str) -> impl Future<Output = io::Result<bool>> + Send;

    /// Stores all bytes of `reader` under `id`.
    fn store<R>(&self, id: &str, reader: R) -> impl Future<Output = io::Result<()>> + Send
    where
        R: AsyncRead + Send + Unpin;

    /// Opens the content stored under `id`, `None` if there is none.
    fn retrieve(&self, id: &str) -> impl Future<Output = io::Result<Option<ContentReader>>> + Send;

    /// Deletes the content stored under each of `ids`. Missing ids are ignored.
    fn delete(&self, ids: &[String]) -> impl Future<Output = io::Result<()>> + Send;
}

/// Stores each blob as a file named by its id inside a root directory.
///
/// Writes go to a hidden temporary file next to the target which is renamed into place once
/// complete, so a partially written blob is never visible under its id.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: Arc<PathBuf>,
}

impl FsStorage {
    /// Opens the storage at `root`, creating the directory if needed.
    pub async fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root: Arc::new(root),
        })
    }

    /// The directory blobs are stored in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The path the blob `id` is stored at.
    pub fn path(&self, id: &str) -> io::Result<PathBuf> {
        if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid content id: {id:?}"),
            ));
        }
        Ok(self.root.join(id))
    }
}

impl ContentStorage for FsStorage {
    async fn exists(&self, id: &str) -> io::Result<bool> {
        tokio::fs::try_exists(self.path(id)?).await
    }

    async fn store<R>(&self, id: &str, mut reader: R) -> io::Result<()>
    where
        R: AsyncRead + Send + Unpin,
    {
        let target = self.path(id)?;
        let tmp = self
            .root
            .join(format!(".{id}.{:016x}.tmp", rand::random::<u64>()));
        let res = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            let written = tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &target).await?;
            trace!(%id, written, "stored content");
            io::Result::Ok(())
        }
        .await;
        if res.is_err() {
            tokio::fs::remove_file(&tmp).await.ok();
        }
        res
    }

    async fn retrieve(&self, id: &str) -> io::Result<Option<ContentReader>> {
        match tokio::fs::File::open(self.path(id)?).await {
            Ok(file) => Ok(Some(Box::pin(file))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn delete(&self, ids: &[String]) -> io::Result<()> {
        for id in ids {
            match tokio::fs::remove_file(self.path(id)?).await {
                Ok(()) => debug!(%id, "deleted content"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Keeps all blobs in memory.
#[derive(Debug, Clone, Default)]
pub struct MemStorage {
    blobs: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl MemStorage {
    /// Creates an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the content stored under `id`.
    pub fn get(&self, id: &str) -> Option<Bytes> {
        self.blobs.lock().expect("poisoned").get(id).cloned()
    }

    /// Stores `content` under `id` without going through a reader.
    pub fn insert(&self, id: impl Into<String>, content: impl Into<Bytes>) {
        self.blobs
            .lock()
            .expect("poisoned")
            .insert(id.into(), content.into());
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.lock().expect("poisoned").len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContentStorage for MemStorage {
    async fn exists(&self, id: &str) -> io::Result<bool> {
        Ok(self.blobs.lock().expect("poisoned").contains_key(id))
    }

    async fn store<R>(&self, id: &str, mut reader: R) -> io::Result<()>
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        self.insert(id, buf);
        Ok(())
    }

    async fn retrieve(&self, id: &str) -> io::Result<Option<ContentReader>> {
        Ok(self
            .get(id)
            .map(|bytes| Box::pin(io::Cursor::new(bytes)) as ContentReader))
    }

    async fn delete(&self, ids: &[String]) -> io::Result<()> {
        let mut blobs = self.blobs.lock().expect("poisoned");
        for id in ids {
            blobs.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(reader: Option<ContentReader>) -> Vec<u8> {
        let mut buf = Vec::new();
        reader.unwrap().read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn fs_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path().join("contents")).await.unwrap();

        assert!(!storage.exists("a").await.unwrap());
        assert!(storage.retrieve("a").await.unwrap().is_none());

        storage.store("a", &b"hello"[..]).await.unwrap();
        assert!(storage.exists("a").await.unwrap());
        assert_eq!(read_all(storage.retrieve("a").await.unwrap()).await, b"hello");

        // no temporary files are left behind
        let mut entries = tokio::fs::read_dir(storage.root()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().into_string().unwrap());
        }
        assert_eq!(names, vec!["a".to_string()]);

        storage
            .delete(&["a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert!(!storage.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn fs_storage_rejects_paths() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path()).await.unwrap();
        let err = storage.store("../escape", &b"x"[..]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn mem_storage_roundtrip() {
        let storage = MemStorage::new();
        assert!(storage.is_empty());
        storage.store("a", &b"hello"[..]).await.unwrap();
        assert!(storage.exists("a").await.unwrap());
        assert_eq!(read_all(storage.retrieve("a").await.unwrap()).await, b"hello");
        storage.delete(&["a".to_string()]).await.unwrap();
        assert!(storage.retrieve("a").await.unwrap().is_none());
    }
}
