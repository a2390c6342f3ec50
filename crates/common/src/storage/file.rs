use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{Storage, StorageError, StorageProvider, StorageStat};

/// Storage backed by a single file on disk
///
/// The file (and its parent directories) is created lazily on first use.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    file: Mutex<FileState>,
}

#[derive(Debug)]
enum FileState {
    Closed,
    Open(File),
    Destroyed,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(FileState::Closed),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open_file(&self) -> Result<File, StorageError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .await?;
        Ok(file)
    }
}

/// Run `op` against the open file, opening it first if needed
macro_rules! with_file {
    ($self:ident, $file:ident => $body:expr) => {{
        let mut state = $self.file.lock().await;
        if matches!(*state, FileState::Closed) {
            *state = FileState::Open($self.open_file().await?);
        }
        match &mut *state {
            FileState::Open($file) => $body,
            _ => Err(StorageError::Destroyed),
        }
    }};
}

#[async_trait]
impl Storage for FileStorage {
    async fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>, StorageError> {
        with_file!(self, file => {
            let size = file.metadata().await?.len();
            if offset.checked_add(len).map_or(true, |end| end > size) {
                return Err(StorageError::OutOfBounds { offset, len, size });
            }
            let mut buf = vec![0u8; len as usize];
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(&mut buf).await?;
            Ok(buf)
        })
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        with_file!(self, file => {
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(data).await?;
            Ok(())
        })
    }

    async fn stat(&self) -> Result<StorageStat, StorageError> {
        with_file!(self, file => {
            let size = file.metadata().await?.len();
            Ok(StorageStat { size })
        })
    }

    async fn truncate(&self, size: u64) -> Result<(), StorageError> {
        with_file!(self, file => {
            file.set_len(size).await?;
            Ok(())
        })
    }

    async fn flush(&self) -> Result<(), StorageError> {
        with_file!(self, file => {
            file.flush().await?;
            file.sync_data().await?;
            Ok(())
        })
    }

    async fn destroy(&self) -> Result<(), StorageError> {
        let mut state = self.file.lock().await;
        *state = FileState::Destroyed;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Hands out [`FileStorage`] rooted at a directory
#[derive(Debug, Clone)]
pub struct FileStorageProvider {
    root: PathBuf,
}

impl FileStorageProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl StorageProvider for FileStorageProvider {
    fn open(&self, path: &str) -> Result<Arc<dyn Storage>, StorageError> {
        let relative = Path::new(path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(StorageError::Internal(format!(
                "storage path must stay inside the root: {}",
                path
            )));
        }
        Ok(Arc::new(FileStorage::new(self.root.join(relative))))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_file_storage_persists_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileStorageProvider::new(dir.path());

        let storage = provider.open("feeds/ab/abcd").unwrap();
        storage.write(0, b"durable bytes").await.unwrap();
        storage.flush().await.unwrap();
        drop(storage);

        let reopened = provider.open("feeds/ab/abcd").unwrap();
        assert_eq!(reopened.stat().await.unwrap().size, 13);
        assert_eq!(reopened.read(8, 5).await.unwrap(), b"bytes");
        assert!(dir.path().join("feeds/ab/abcd").exists());

        reopened.destroy().await.unwrap();
        assert!(!dir.path().join("feeds/ab/abcd").exists());
        assert!(matches!(
            reopened.read(0, 1).await,
            Err(StorageError::Destroyed)
        ));
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let provider = FileStorageProvider::new("/tmp/strand");
        assert!(provider.open("../etc/passwd").is_err());
    }
}
