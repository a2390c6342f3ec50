use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};

use super::block::{BlockHash, FeedBlock};
use super::FeedError;
use crate::codec;
use crate::crypto::{PublicKey, SecretKey};
use crate::storage::Storage;

/// Bytes in the little-endian length prefix of each stored frame
const FRAME_HEADER_SIZE: u64 = 4;

/// Result of inserting a replicated block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The block extended the feed
    Appended,
    /// An identical block was already stored at that position
    Duplicate,
}

/// An append-only, signed, hash-chained log of blocks
///
/// A feed is addressed by its public key. Holding the secret makes it
/// writable through [`Feed::append`]; every feed also accepts replicated
/// blocks through [`Feed::put`], which verifies signature and chaining and
/// only ever extends the log contiguously. Clones share the same log.
#[derive(Clone)]
pub struct Feed {
    inner: Arc<FeedInner>,
}

struct FeedInner {
    key: PublicKey,
    secret: RwLock<Option<SecretKey>>,
    storage: Arc<dyn Storage>,
    log: Mutex<FeedLog>,
    length: watch::Sender<u64>,
    corrupt: AtomicBool,
    closed: AtomicBool,
}

#[derive(Debug, Default)]
struct FeedLog {
    frames: Vec<Frame>,
    /// Offset one past the last valid frame
    end: u64,
    head: BlockHash,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    offset: u64,
    len: u64,
    hash: BlockHash,
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("key", &self.inner.key)
            .field("length", &self.length())
            .field("writable", &self.is_writable())
            .finish()
    }
}

impl Feed {
    /// Open a feed over `storage`, re-verifying every stored block
    ///
    /// A partially written trailing frame (from a crash mid-append) is
    /// truncated away. A complete frame that fails verification makes the
    /// whole feed unusable.
    ///
    /// # Errors
    /// * `FeedError::KeyMismatch` - `secret` does not belong to `key`
    /// * `FeedError::Corrupt` - a stored block failed verification
    pub async fn open(
        key: PublicKey,
        secret: Option<SecretKey>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, FeedError> {
        if let Some(secret) = &secret {
            if secret.public() != key {
                return Err(FeedError::KeyMismatch(key));
            }
        }

        let log = load(&key, storage.as_ref()).await?;
        tracing::debug!(
            "opened feed {} with {} blocks (writable: {})",
            key.short(),
            log.frames.len(),
            secret.is_some()
        );
        let (length, _) = watch::channel(log.frames.len() as u64);

        Ok(Self {
            inner: Arc::new(FeedInner {
                key,
                secret: RwLock::new(secret),
                storage,
                log: Mutex::new(log),
                length,
                corrupt: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn key(&self) -> PublicKey {
        self.inner.key
    }

    /// Number of blocks stored
    pub fn length(&self) -> u64 {
        *self.inner.length.borrow()
    }

    pub fn is_writable(&self) -> bool {
        self.inner.secret.read().is_some()
    }

    pub fn is_corrupt(&self) -> bool {
        self.inner.corrupt.load(Ordering::SeqCst)
    }

    /// Watch the feed length. The receiver sees every growth of the log.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.length.subscribe()
    }

    /// Grant write access to an already open read-only feed
    pub(crate) fn set_secret(&self, secret: SecretKey) -> Result<(), FeedError> {
        if secret.public() != self.inner.key {
            return Err(FeedError::KeyMismatch(self.inner.key));
        }
        *self.inner.secret.write() = Some(secret);
        Ok(())
    }

    /// Sign and append `payload`, returning its sequence number
    ///
    /// The block is durable in storage once this returns.
    ///
    /// # Errors
    /// * `FeedError::NotWritable` - no secret is held for this feed
    /// * `FeedError::Storage` - the write failed; the feed is marked corrupt
    pub async fn append(&self, payload: Vec<u8>) -> Result<u64, FeedError> {
        let secret = self
            .inner
            .secret
            .read()
            .clone()
            .ok_or(FeedError::NotWritable(self.inner.key))?;

        let mut log = self.inner.log.lock().await;
        self.ensure_usable(&log)?;
        let seq = log.frames.len() as u64;
        let block = FeedBlock::sign(&secret, seq, log.head, payload);
        self.write_block(&mut log, &block).await?;
        Ok(seq)
    }

    /// Insert a block received from a peer
    ///
    /// # Errors
    /// * `FeedError::WrongFeed` / `FeedError::InvalidSignature` - the block is not ours
    /// * `FeedError::Gap` - the block skips ahead of the local length
    /// * `FeedError::Fork` - a different block is already stored at that position
    /// * `FeedError::BrokenChain` - `prev_hash` does not match the local head
    pub async fn put(&self, block: FeedBlock) -> Result<PutOutcome, FeedError> {
        if block.feed_key != self.inner.key {
            return Err(FeedError::WrongFeed {
                expected: self.inner.key,
                got: block.feed_key,
            });
        }
        if !block.verify() {
            return Err(FeedError::InvalidSignature { seq: block.seq });
        }

        let mut log = self.inner.log.lock().await;
        self.ensure_usable(&log)?;
        let length = log.frames.len() as u64;

        if block.seq < length {
            return if log.frames[block.seq as usize].hash == block.hash() {
                Ok(PutOutcome::Duplicate)
            } else {
                tracing::warn!("fork detected on feed {} at {}", self.inner.key.short(), block.seq);
                Err(FeedError::Fork { seq: block.seq })
            };
        }
        if block.seq > length {
            return Err(FeedError::Gap {
                expected: length,
                got: block.seq,
            });
        }
        if block.prev_hash != log.head {
            return Err(FeedError::BrokenChain { seq: block.seq });
        }

        self.write_block(&mut log, &block).await?;
        Ok(PutOutcome::Appended)
    }

    /// Read the block at `seq` from local storage
    ///
    /// # Errors
    /// * `FeedError::NotFound` - `seq` is not stored locally
    pub async fn block(&self, seq: u64) -> Result<FeedBlock, FeedError> {
        let frame = {
            let log = self.inner.log.lock().await;
            log.frames
                .get(seq as usize)
                .copied()
                .ok_or(FeedError::NotFound {
                    seq,
                    length: log.frames.len() as u64,
                })?
        };
        let bytes = self
            .inner
            .storage
            .read(frame.offset + FRAME_HEADER_SIZE, frame.len)
            .await?;
        Ok(codec::decode(&bytes)?)
    }

    /// Read the payload at `seq` from local storage
    pub async fn get(&self, seq: u64) -> Result<Vec<u8>, FeedError> {
        Ok(self.block(seq).await?.payload)
    }

    /// Wait until block `seq` is available locally, then read it
    ///
    /// # Errors
    /// * `FeedError::Timeout` - the block did not arrive within `timeout`
    pub async fn wait_for_block(&self, seq: u64, timeout: Duration) -> Result<FeedBlock, FeedError> {
        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|length| *length > seq).await.map(|_| ())
        })
        .await;
        match waited {
            Ok(Ok(())) => self.block(seq).await,
            Ok(Err(_)) => Err(FeedError::Closed),
            Err(_) => Err(FeedError::Timeout { seq }),
        }
    }

    /// Payload variant of [`Feed::wait_for_block`]
    pub async fn get_with_timeout(&self, seq: u64, timeout: Duration) -> Result<Vec<u8>, FeedError> {
        Ok(self.wait_for_block(seq, timeout).await?.payload)
    }

    /// Flush storage and refuse further writes
    pub async fn close(&self) -> Result<(), FeedError> {
        let _log = self.inner.log.lock().await;
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.storage.flush().await?;
        Ok(())
    }

    /// Remove the feed's stored blocks
    pub async fn destroy(&self) -> Result<(), FeedError> {
        let mut log = self.inner.log.lock().await;
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.storage.destroy().await?;
        *log = FeedLog::default();
        Ok(())
    }

    fn ensure_usable(&self, log: &FeedLog) -> Result<(), FeedError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(FeedError::Closed);
        }
        if self.is_corrupt() {
            return Err(FeedError::Corrupt {
                feed: self.inner.key,
                seq: log.frames.len() as u64,
            });
        }
        Ok(())
    }

    async fn write_block(&self, log: &mut FeedLog, block: &FeedBlock) -> Result<(), FeedError> {
        let bytes = codec::encode(block)?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE as usize + bytes.len());
        frame.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        frame.extend_from_slice(&bytes);

        let storage = &self.inner.storage;
        let written = match storage.write(log.end, &frame).await {
            Ok(()) => storage.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.inner.corrupt.store(true, Ordering::SeqCst);
            tracing::error!(
                "write failed on feed {} at {}, marking corrupt: {}",
                self.inner.key.short(),
                block.seq,
                e
            );
            return Err(e.into());
        }

        log.frames.push(Frame {
            offset: log.end,
            len: bytes.len() as u64,
            hash: block.hash(),
        });
        log.end += frame.len() as u64;
        log.head = block.hash();
        self.inner.length.send_replace(log.frames.len() as u64);
        Ok(())
    }
}

/// Scan stored frames, verifying each block against its predecessor
async fn load(key: &PublicKey, storage: &dyn Storage) -> Result<FeedLog, FeedError> {
    let size = storage.stat().await?.size;
    let mut log = FeedLog::default();

    while log.end < size {
        if size - log.end < FRAME_HEADER_SIZE {
            break;
        }
        let header = storage.read(log.end, FRAME_HEADER_SIZE).await?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
        if log.end + FRAME_HEADER_SIZE + len > size {
            break;
        }

        let seq = log.frames.len() as u64;
        let bytes = storage.read(log.end + FRAME_HEADER_SIZE, len).await?;
        let corrupt = FeedError::Corrupt { feed: *key, seq };
        let block: FeedBlock = codec::decode(&bytes).map_err(|e| {
            tracing::error!("feed {} block {} failed to decode: {}", key.short(), seq, e);
            FeedError::Corrupt { feed: *key, seq }
        })?;
        if block.feed_key != *key || block.seq != seq || block.prev_hash != log.head || !block.verify() {
            tracing::error!("feed {} block {} failed verification", key.short(), seq);
            return Err(corrupt);
        }

        let hash = block.hash();
        log.frames.push(Frame {
            offset: log.end,
            len,
            hash,
        });
        log.end += FRAME_HEADER_SIZE + len;
        log.head = hash;
    }

    if log.end < size {
        tracing::warn!(
            "feed {} has a torn trailing frame, truncating {} bytes",
            key.short(),
            size - log.end
        );
        storage.truncate(log.end).await?;
    }
    Ok(log)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::{MemoryStorage, StorageError, StorageStat};
    use async_trait::async_trait;

    async fn writable_feed() -> (Feed, SecretKey, MemoryStorage) {
        let secret = SecretKey::generate();
        let storage = MemoryStorage::new();
        let feed = Feed::open(secret.public(), Some(secret.clone()), Arc::new(storage.clone()))
            .await
            .unwrap();
        (feed, secret, storage)
    }

    #[tokio::test]
    async fn test_append_is_contiguous_and_readable() {
        let (feed, _, _) = writable_feed().await;
        assert_eq!(feed.append(b"a".to_vec()).await.unwrap(), 0);
        assert_eq!(feed.append(b"b".to_vec()).await.unwrap(), 1);
        assert_eq!(feed.length(), 2);
        assert_eq!(feed.get(1).await.unwrap(), b"b");

        let first = feed.block(0).await.unwrap();
        let second = feed.block(1).await.unwrap();
        assert_eq!(first.prev_hash, BlockHash::ZERO);
        assert_eq!(second.prev_hash, first.hash());

        assert!(matches!(
            feed.get(2).await,
            Err(FeedError::NotFound { seq: 2, length: 2 })
        ));
    }

    #[tokio::test]
    async fn test_read_only_feed_rejects_append() {
        let key = SecretKey::generate().public();
        let feed = Feed::open(key, None, Arc::new(MemoryStorage::new()))
            .await
            .unwrap();
        assert!(matches!(
            feed.append(b"nope".to_vec()).await,
            Err(FeedError::NotWritable(k)) if k == key
        ));
    }

    #[tokio::test]
    async fn test_reopen_preserves_blocks() {
        let (feed, secret, storage) = writable_feed().await;
        for i in 0..5u8 {
            feed.append(vec![i]).await.unwrap();
        }
        feed.close().await.unwrap();

        let reopened = Feed::open(secret.public(), Some(secret), Arc::new(storage))
            .await
            .unwrap();
        assert_eq!(reopened.length(), 5);
        assert_eq!(reopened.get(3).await.unwrap(), vec![3]);
        assert_eq!(reopened.append(vec![5]).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated_on_open() {
        let (feed, secret, storage) = writable_feed().await;
        feed.append(b"kept".to_vec()).await.unwrap();
        let size = storage.stat().await.unwrap().size;
        // half a frame header plus garbage, as left by a crash mid-append
        storage.write(size, &[200, 0, 0, 0, 1, 2, 3]).await.unwrap();

        let reopened = Feed::open(secret.public(), Some(secret), Arc::new(storage.clone()))
            .await
            .unwrap();
        assert_eq!(reopened.length(), 1);
        assert_eq!(storage.stat().await.unwrap().size, size);
        assert_eq!(reopened.append(b"next".to_vec()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_corrupted_block_fails_open() {
        let (feed, secret, storage) = writable_feed().await;
        feed.append(b"payload".to_vec()).await.unwrap();
        // flip the last payload byte inside the first frame
        let size = storage.stat().await.unwrap().size;
        let mut last = storage.read(size - 65, 1).await.unwrap();
        last[0] ^= 0xff;
        storage.write(size - 65, &last).await.unwrap();

        assert!(matches!(
            Feed::open(secret.public(), Some(secret), Arc::new(storage)).await,
            Err(FeedError::Corrupt { seq: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_put_replicates_and_detects_conflicts() {
        let (source, secret, _) = writable_feed().await;
        for i in 0..3u8 {
            source.append(vec![i]).await.unwrap();
        }
        let replica = Feed::open(secret.public(), None, Arc::new(MemoryStorage::new()))
            .await
            .unwrap();

        let b0 = source.block(0).await.unwrap();
        let b2 = source.block(2).await.unwrap();
        assert!(matches!(
            replica.put(b2.clone()).await,
            Err(FeedError::Gap {
                expected: 0,
                got: 2
            })
        ));
        assert_eq!(replica.put(b0.clone()).await.unwrap(), PutOutcome::Appended);
        assert_eq!(replica.put(b0.clone()).await.unwrap(), PutOutcome::Duplicate);

        let forked = FeedBlock::sign(&secret, 0, BlockHash::ZERO, b"other".to_vec());
        assert!(matches!(
            replica.put(forked).await,
            Err(FeedError::Fork { seq: 0 })
        ));

        let mut forged = source.block(1).await.unwrap();
        forged.payload = b"forged".to_vec();
        assert!(matches!(
            replica.put(forged).await,
            Err(FeedError::InvalidSignature { seq: 1 })
        ));

        let stranger = FeedBlock::sign(&SecretKey::generate(), 1, b0.hash(), vec![]);
        assert!(matches!(
            replica.put(stranger).await,
            Err(FeedError::WrongFeed { .. })
        ));
        assert_eq!(replica.length(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_block_times_out_then_resolves() {
        let (feed, _, _) = writable_feed().await;
        assert!(matches!(
            feed.get_with_timeout(0, Duration::from_millis(20)).await,
            Err(FeedError::Timeout { seq: 0 })
        ));

        let writer = feed.clone();
        let waiter = tokio::spawn(async move {
            writer.get_with_timeout(0, Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        feed.append(b"late".to_vec()).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), b"late");
    }

    #[derive(Debug, Default)]
    struct FailingStorage {
        inner: MemoryStorage,
    }

    #[async_trait]
    impl Storage for FailingStorage {
        async fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>, StorageError> {
            self.inner.read(offset, len).await
        }
        async fn write(&self, _offset: u64, _data: &[u8]) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::other("disk full")))
        }
        async fn stat(&self) -> Result<StorageStat, StorageError> {
            self.inner.stat().await
        }
        async fn truncate(&self, size: u64) -> Result<(), StorageError> {
            self.inner.truncate(size).await
        }
        async fn flush(&self) -> Result<(), StorageError> {
            Ok(())
        }
        async fn destroy(&self) -> Result<(), StorageError> {
            self.inner.destroy().await
        }
    }

    #[tokio::test]
    async fn test_write_failure_marks_feed_corrupt() {
        let secret = SecretKey::generate();
        let feed = Feed::open(
            secret.public(),
            Some(secret),
            Arc::new(FailingStorage::default()),
        )
        .await
        .unwrap();

        assert!(matches!(
            feed.append(b"x".to_vec()).await,
            Err(FeedError::Storage(_))
        ));
        assert!(feed.is_corrupt());
        assert!(matches!(
            feed.append(b"y".to_vec()).await,
            Err(FeedError::Corrupt { seq: 0, .. })
        ));
        assert_eq!(feed.length(), 0);
    }
}
