use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{Feed, FeedBlock, FeedError};
use crate::crypto::PublicKey;

/// Messages exchanged while replicating a single feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedMessage {
    /// Advertise the sender's current length
    Have { length: u64 },
    /// Ask for blocks `start..end`
    Request { start: u64, end: u64 },
    Blocks { blocks: Vec<FeedBlock> },
}

/// Tuning for feed replication
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Most blocks requested or served in one message
    pub batch_size: u64,
    /// First delay before an unanswered request is re-sent
    pub min_retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Re-sends before a request is dropped until the next `Have`
    pub max_retries: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            min_retry_delay: Duration::from_millis(200),
            max_retry_delay: Duration::from_secs(10),
            max_retries: 8,
        }
    }
}

/// A running replication session for one feed against one remote
///
/// Messages from the remote go in through [`FeedReplication::send`];
/// messages for the remote come out of [`FeedReplication::recv`]. The session
/// stops when dropped or when the inbound side is closed.
pub struct FeedReplication {
    feed_key: PublicKey,
    inbound: flume::Sender<FeedMessage>,
    outbound: flume::Receiver<FeedMessage>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for FeedReplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedReplication")
            .field("feed_key", &self.feed_key)
            .finish()
    }
}

impl FeedReplication {
    pub fn feed_key(&self) -> PublicKey {
        self.feed_key
    }

    /// Deliver a message received from the remote
    pub fn send(&self, message: FeedMessage) -> Result<(), FeedError> {
        self.inbound.send(message).map_err(|_| FeedError::Closed)
    }

    /// Next message to forward to the remote, `None` once the session ended
    pub async fn recv(&self) -> Option<FeedMessage> {
        self.outbound.recv_async().await.ok()
    }

    pub fn outbound(&self) -> flume::Receiver<FeedMessage> {
        self.outbound.clone()
    }
}

impl Drop for FeedReplication {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Feed {
    /// Start replicating this feed with a remote replica
    ///
    /// The initiator advertises its length first; the other side answers
    /// with its own. Whichever side is behind requests the missing range,
    /// re-sending with exponential backoff until blocks arrive.
    pub fn replicate(&self, is_initiator: bool, config: ReplicationConfig) -> FeedReplication {
        let (inbound_tx, inbound_rx) = flume::unbounded();
        let (outbound_tx, outbound_rx) = flume::unbounded();
        let session = Session {
            feed: self.clone(),
            config,
            outbound: outbound_tx,
            advertised: None,
            heard: false,
            remote_length: 0,
            pending: None,
        };
        let task = tokio::spawn(session.run(is_initiator, inbound_rx));
        FeedReplication {
            feed_key: self.key(),
            inbound: inbound_tx,
            outbound: outbound_rx,
            task,
        }
    }
}

struct PendingRequest {
    start: u64,
    end: u64,
    deadline: Instant,
    backoff: ExponentialBackoff,
}

struct Session {
    feed: Feed,
    config: ReplicationConfig,
    outbound: flume::Sender<FeedMessage>,
    advertised: Option<u64>,
    /// Whether the remote advertised anything yet
    heard: bool,
    remote_length: u64,
    pending: Option<PendingRequest>,
}

impl Session {
    async fn run(mut self, is_initiator: bool, inbound: flume::Receiver<FeedMessage>) {
        let mut length_rx = self.feed.subscribe();
        if is_initiator && self.advertise().is_err() {
            return;
        }

        loop {
            let retry_at = self.pending.as_ref().map(|p| p.deadline);
            let result = tokio::select! {
                message = inbound.recv_async() => match message {
                    Ok(message) => self.handle(message).await,
                    Err(_) => break,
                },
                changed = length_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.on_local_growth()
                }
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry()
                }
            };
            if let Err(e) = result {
                tracing::debug!("replication of feed {} stopped: {}", self.feed.key().short(), e);
                break;
            }
        }
    }

    fn emit(&self, message: FeedMessage) -> Result<(), FeedError> {
        self.outbound.send(message).map_err(|_| FeedError::Closed)
    }

    fn advertise(&mut self) -> Result<(), FeedError> {
        let length = self.feed.length();
        self.advertised = Some(length);
        self.emit(FeedMessage::Have { length })
    }

    async fn handle(&mut self, message: FeedMessage) -> Result<(), FeedError> {
        match message {
            FeedMessage::Have { length } => {
                self.remote_length = self.remote_length.max(length);
                // answer the first advertisement even if ours went out
                // before the remote was listening
                let first = !std::mem::replace(&mut self.heard, true);
                if self.advertised.is_none() || first {
                    self.advertise()?;
                }
                self.maybe_request()
            }
            FeedMessage::Request { start, end } => self.serve(start, end).await,
            FeedMessage::Blocks { blocks } => {
                for block in blocks {
                    let seq = block.seq;
                    match self.feed.put(block).await {
                        Ok(_) => {}
                        Err(FeedError::Gap { .. }) => {
                            tracing::debug!("dropping out-of-order block {} for {}", seq, self.feed.key().short());
                            break;
                        }
                        Err(e @ (FeedError::Corrupt { .. } | FeedError::Closed | FeedError::Storage(_))) => {
                            return Err(e);
                        }
                        Err(e) => {
                            tracing::warn!(
                                "rejected block {} of feed {} from remote: {}",
                                seq,
                                self.feed.key().short(),
                                e
                            );
                            break;
                        }
                    }
                }
                self.settle_pending();
                self.maybe_request()
            }
        }
    }

    async fn serve(&mut self, start: u64, end: u64) -> Result<(), FeedError> {
        let length = self.feed.length();
        let end = end.min(length).min(start.saturating_add(self.config.batch_size));
        if start >= end {
            return self.emit(FeedMessage::Have { length });
        }
        let mut blocks = Vec::with_capacity((end - start) as usize);
        for seq in start..end {
            blocks.push(self.feed.block(seq).await?);
        }
        self.emit(FeedMessage::Blocks { blocks })
    }

    fn on_local_growth(&mut self) -> Result<(), FeedError> {
        let length = self.feed.length();
        if self.advertised.is_some_and(|advertised| length > advertised) {
            self.advertise()?;
        }
        self.settle_pending();
        self.maybe_request()
    }

    fn settle_pending(&mut self) {
        let length = self.feed.length();
        if self.pending.as_ref().is_some_and(|p| length >= p.end) {
            self.pending = None;
        }
    }

    fn maybe_request(&mut self) -> Result<(), FeedError> {
        let length = self.feed.length();
        if self.pending.is_some() || self.remote_length <= length {
            return Ok(());
        }
        let end = self.remote_length.min(length + self.config.batch_size);
        let mut backoff = ExponentialBuilder::default()
            .with_min_delay(self.config.min_retry_delay)
            .with_max_delay(self.config.max_retry_delay)
            .with_max_times(self.config.max_retries)
            .with_jitter()
            .build();
        let delay = backoff.next().unwrap_or(self.config.max_retry_delay);
        self.pending = Some(PendingRequest {
            start: length,
            end,
            deadline: Instant::now() + delay,
            backoff,
        });
        self.emit(FeedMessage::Request { start: length, end })
    }

    fn retry(&mut self) -> Result<(), FeedError> {
        let length = self.feed.length();
        let Some(pending) = self.pending.as_mut() else {
            return Ok(());
        };
        match pending.backoff.next() {
            Some(delay) => {
                pending.start = pending.start.max(length);
                pending.deadline = Instant::now() + delay;
                tracing::debug!(
                    "re-requesting blocks {}..{} of feed {}",
                    pending.start,
                    pending.end,
                    self.feed.key().short()
                );
                let (start, end) = (pending.start, pending.end);
                self.emit(FeedMessage::Request { start, end })
            }
            None => {
                tracing::warn!(
                    "giving up on blocks {}..{} of feed {} until the next advertisement",
                    pending.start,
                    pending.end,
                    self.feed.key().short()
                );
                self.pending = None;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::crypto::SecretKey;
    use crate::storage::MemoryStorage;

    /// Pump messages between two sessions until `done` or timeout
    async fn link(a: FeedReplication, b: FeedReplication) -> (FeedReplication, FeedReplication) {
        let a_out = a.outbound();
        let b_out = b.outbound();
        let a_in = a.inbound.clone();
        let b_in = b.inbound.clone();
        tokio::spawn(async move {
            while let Ok(message) = a_out.recv_async().await {
                if b_in.send(message).is_err() {
                    break;
                }
            }
        });
        tokio::spawn(async move {
            while let Ok(message) = b_out.recv_async().await {
                if a_in.send(message).is_err() {
                    break;
                }
            }
        });
        (a, b)
    }

    #[tokio::test]
    async fn test_replica_catches_up_and_follows() {
        let secret = SecretKey::generate();
        let source = Feed::open(secret.public(), Some(secret.clone()), Arc::new(MemoryStorage::new()))
            .await
            .unwrap();
        for i in 0..150u32 {
            source.append(i.to_le_bytes().to_vec()).await.unwrap();
        }
        let replica = Feed::open(secret.public(), None, Arc::new(MemoryStorage::new()))
            .await
            .unwrap();

        let config = ReplicationConfig {
            batch_size: 16,
            ..Default::default()
        };
        let _sessions = link(
            source.replicate(true, config.clone()),
            replica.replicate(false, config),
        )
        .await;

        replica
            .wait_for_block(149, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(replica.get(42).await.unwrap(), 42u32.to_le_bytes());

        source.append(b"live".to_vec()).await.unwrap();
        assert_eq!(
            replica
                .get_with_timeout(150, Duration::from_secs(5))
                .await
                .unwrap(),
            b"live"
        );
    }

    #[tokio::test]
    async fn test_unanswered_request_is_retried() {
        let secret = SecretKey::generate();
        let replica = Feed::open(secret.public(), None, Arc::new(MemoryStorage::new()))
            .await
            .unwrap();
        let config = ReplicationConfig {
            min_retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(20),
            max_retries: 2,
            ..Default::default()
        };
        let session = replica.replicate(false, config);
        session.send(FeedMessage::Have { length: 3 }).unwrap();

        assert_eq!(session.recv().await, Some(FeedMessage::Have { length: 0 }));
        assert_eq!(
            session.recv().await,
            Some(FeedMessage::Request { start: 0, end: 3 })
        );
        // nobody answers, so the request is re-sent
        let retried = tokio::time::timeout(Duration::from_secs(2), session.recv())
            .await
            .unwrap();
        assert_eq!(retried, Some(FeedMessage::Request { start: 0, end: 3 }));
    }
}
