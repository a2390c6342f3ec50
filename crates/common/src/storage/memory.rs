use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{Storage, StorageError, StorageProvider, StorageStat};

/// In-memory storage. Clones share the same bytes.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<RwLock<MemoryStorageInner>>,
}

#[derive(Debug, Default)]
struct MemoryStorageInner {
    data: Vec<u8>,
    destroyed: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_destroyed(&self) -> bool {
        self.inner.read().map(|inner| inner.destroyed).unwrap_or(true)
    }
}

fn lock_error(e: impl std::fmt::Display) -> StorageError {
    StorageError::Internal(format!("failed to acquire lock: {}", e))
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>, StorageError> {
        let inner = self.inner.read().map_err(lock_error)?;
        if inner.destroyed {
            return Err(StorageError::Destroyed);
        }
        let size = inner.data.len() as u64;
        let end = offset.checked_add(len).filter(|end| *end <= size).ok_or(
            StorageError::OutOfBounds { offset, len, size },
        )?;
        Ok(inner.data[offset as usize..end as usize].to_vec())
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.inner.write().map_err(lock_error)?;
        if inner.destroyed {
            return Err(StorageError::Destroyed);
        }
        let start = offset as usize;
        let end = start + data.len();
        if inner.data.len() < end {
            inner.data.resize(end, 0);
        }
        inner.data[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn stat(&self) -> Result<StorageStat, StorageError> {
        let inner = self.inner.read().map_err(lock_error)?;
        if inner.destroyed {
            return Err(StorageError::Destroyed);
        }
        Ok(StorageStat {
            size: inner.data.len() as u64,
        })
    }

    async fn truncate(&self, size: u64) -> Result<(), StorageError> {
        let mut inner = self.inner.write().map_err(lock_error)?;
        if inner.destroyed {
            return Err(StorageError::Destroyed);
        }
        inner.data.truncate(size as usize);
        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn destroy(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.write().map_err(lock_error)?;
        inner.data = Vec::new();
        inner.destroyed = true;
        Ok(())
    }
}

/// Hands out [`MemoryStorage`] by path. Re-opening a path returns the same
/// bytes, which lets tests simulate a restart without touching disk.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorageProvider {
    files: Arc<RwLock<HashMap<String, MemoryStorage>>>,
}

impl MemoryStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageProvider for MemoryStorageProvider {
    fn open(&self, path: &str) -> Result<Arc<dyn Storage>, StorageError> {
        let mut files = self.files.write().map_err(lock_error)?;
        let storage = files.entry(path.to_string()).or_default();
        if storage.is_destroyed() {
            *storage = MemoryStorage::new();
        }
        Ok(Arc::new(storage.clone()))
    }
}
