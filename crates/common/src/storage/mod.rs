//! Random-access byte storage
//!
//! Feeds persist through the [`Storage`] trait: a flat, growable byte file
//! addressed by offset. A [`StorageProvider`] hands out storage by relative
//! path, so the same feed code runs against memory or the filesystem.

mod file;
mod memory;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use crate::crypto::PublicKey;

pub use file::{FileStorage, FileStorageProvider};
pub use memory::{MemoryStorage, MemoryStorageProvider};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A read reached past the end of the stored bytes
    #[error("read out of bounds: offset {offset}, len {len}, size {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
    /// The storage was destroyed and can no longer be used
    #[error("storage destroyed")]
    Destroyed,
    #[error("storage error: {0}")]
    Internal(String),
}

/// Size information for a storage file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStat {
    pub size: u64,
}

#[async_trait]
pub trait Storage: Send + Sync + Debug {
    /// Read exactly `len` bytes starting at `offset`
    ///
    /// # Errors
    /// * `StorageError::OutOfBounds` - the range extends past the stored size
    async fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>, StorageError>;

    /// Write `data` at `offset`, growing the file if needed
    async fn write(&self, offset: u64, data: &[u8]) -> Result<(), StorageError>;

    async fn stat(&self) -> Result<StorageStat, StorageError>;

    /// Drop everything past `size`
    async fn truncate(&self, size: u64) -> Result<(), StorageError>;

    /// Make previous writes durable
    async fn flush(&self) -> Result<(), StorageError>;

    /// Remove the stored bytes. Further calls fail with `Destroyed`.
    async fn destroy(&self) -> Result<(), StorageError>;
}

pub trait StorageProvider: Send + Sync + Debug {
    /// Open (creating if absent) the storage at a relative `path`
    fn open(&self, path: &str) -> Result<Arc<dyn Storage>, StorageError>;
}

/// Relative path for a feed's block file: `feeds/<first byte hex>/<key hex>`
pub fn feed_path(key: &PublicKey) -> String {
    let hex = key.to_hex();
    format!("feeds/{}/{}", &hex[..2], hex)
}
