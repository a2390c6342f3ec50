//! Registry of open feeds
//!
//! The store guarantees at most one live [`Feed`] handle per key, so every
//! component that opens a feed observes the same log and length watch.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::crypto::{PublicKey, SecretKey};
use crate::feed::{Feed, FeedError};
use crate::storage::{feed_path, StorageError, StorageProvider};

#[derive(Debug, thiserror::Error)]
pub enum FeedStoreError {
    /// The secret supplied for a read-write open belongs to another key
    #[error("secret key does not match feed {0}")]
    KeyMismatch(PublicKey),
    #[error("feed store closed")]
    Closed,
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct FeedStore {
    inner: Arc<FeedStoreInner>,
}

#[derive(Debug)]
struct FeedStoreInner {
    provider: Arc<dyn StorageProvider>,
    feeds: Mutex<Option<HashMap<PublicKey, Feed>>>,
}

impl FeedStore {
    pub fn new(provider: Arc<dyn StorageProvider>) -> Self {
        Self {
            inner: Arc::new(FeedStoreInner {
                provider,
                feeds: Mutex::new(Some(HashMap::new())),
            }),
        }
    }

    /// Open a feed we can append to
    ///
    /// If the feed is already open read-only, the existing handle is
    /// upgraded in place.
    ///
    /// # Errors
    /// * `FeedStoreError::KeyMismatch` - `secret` is not the secret of `key`
    pub async fn open_read_write_feed(
        &self,
        key: PublicKey,
        secret: SecretKey,
    ) -> Result<Feed, FeedStoreError> {
        if secret.public() != key {
            return Err(FeedStoreError::KeyMismatch(key));
        }
        self.open(key, Some(secret)).await
    }

    /// Open a feed for replication and reading only
    pub async fn open_read_only_feed(&self, key: PublicKey) -> Result<Feed, FeedStoreError> {
        self.open(key, None).await
    }

    async fn open(&self, key: PublicKey, secret: Option<SecretKey>) -> Result<Feed, FeedStoreError> {
        let mut guard = self.inner.feeds.lock().await;
        let feeds = guard.as_mut().ok_or(FeedStoreError::Closed)?;

        if let Some(feed) = feeds.get(&key) {
            if let Some(secret) = secret {
                if !feed.is_writable() {
                    tracing::debug!("upgrading feed {} to read-write", key.short());
                    feed.set_secret(secret)?;
                }
            }
            return Ok(feed.clone());
        }

        let storage = self.inner.provider.open(&feed_path(&key))?;
        let feed = Feed::open(key, secret, storage).await?;
        feeds.insert(key, feed.clone());
        Ok(feed)
    }

    /// The open handle for `key`, if any
    pub async fn get(&self, key: &PublicKey) -> Option<Feed> {
        self.inner
            .feeds
            .lock()
            .await
            .as_ref()
            .and_then(|feeds| feeds.get(key).cloned())
    }

    /// Keys of every open feed, sorted
    pub async fn feeds(&self) -> Vec<PublicKey> {
        let guard = self.inner.feeds.lock().await;
        let mut keys: Vec<_> = guard
            .as_ref()
            .map(|feeds| feeds.keys().copied().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Remove a feed and its stored blocks. Deleting an absent feed is a no-op.
    pub async fn delete_feed(&self, key: &PublicKey) -> Result<(), FeedStoreError> {
        let mut guard = self.inner.feeds.lock().await;
        let feeds = guard.as_mut().ok_or(FeedStoreError::Closed)?;
        match feeds.remove(key) {
            Some(feed) => feed.destroy().await?,
            None => {
                let storage = self.inner.provider.open(&feed_path(key))?;
                if storage.stat().await?.size == 0 {
                    tracing::debug!("feed {} already absent", key.short());
                }
                storage.destroy().await?;
            }
        }
        Ok(())
    }

    /// Flush and close every feed. Later opens fail with `Closed`.
    pub async fn close(&self) -> Result<(), FeedStoreError> {
        let feeds = self.inner.feeds.lock().await.take();
        for (key, feed) in feeds.into_iter().flatten() {
            if let Err(e) = feed.close().await {
                tracing::warn!("failed to close feed {}: {}", key.short(), e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::MemoryStorageProvider;

    #[tokio::test]
    async fn test_open_dedupes_handles() {
        let store = FeedStore::new(Arc::new(MemoryStorageProvider::new()));
        let secret = SecretKey::generate();
        let key = secret.public();

        let writer = store.open_read_write_feed(key, secret).await.unwrap();
        let reader = store.open_read_only_feed(key).await.unwrap();
        writer.append(b"shared".to_vec()).await.unwrap();

        assert_eq!(reader.length(), 1);
        assert!(reader.is_writable());
        assert_eq!(store.feeds().await, vec![key]);
    }

    #[tokio::test]
    async fn test_read_only_upgrades_and_rejects_wrong_secret() {
        let store = FeedStore::new(Arc::new(MemoryStorageProvider::new()));
        let secret = SecretKey::generate();
        let key = secret.public();

        let reader = store.open_read_only_feed(key).await.unwrap();
        assert!(!reader.is_writable());

        assert!(matches!(
            store
                .open_read_write_feed(key, SecretKey::generate())
                .await,
            Err(FeedStoreError::KeyMismatch(k)) if k == key
        ));

        store.open_read_write_feed(key, secret).await.unwrap();
        assert!(reader.is_writable());
    }

    #[tokio::test]
    async fn test_delete_and_close() {
        let provider = Arc::new(MemoryStorageProvider::new());
        let store = FeedStore::new(provider.clone());
        let secret = SecretKey::generate();
        let key = secret.public();

        let feed = store.open_read_write_feed(key, secret.clone()).await.unwrap();
        feed.append(b"gone".to_vec()).await.unwrap();
        store.delete_feed(&key).await.unwrap();
        store.delete_feed(&key).await.unwrap();
        assert!(store.get(&key).await.is_none());

        let fresh = store.open_read_write_feed(key, secret).await.unwrap();
        assert_eq!(fresh.length(), 0);

        store.close().await.unwrap();
        assert!(matches!(
            store.open_read_only_feed(key).await,
            Err(FeedStoreError::Closed)
        ));
    }
}
