//! Append-only signed feeds
//!
//! A feed is a single-writer log of [`FeedBlock`]s. Blocks are signed by the
//! feed key and chained by hash, so any replica can verify a block it
//! received from an untrusted peer before storing it.

mod block;
#[allow(clippy::module_inception)]
mod feed;
mod replicate;

pub use block::{BlockHash, FeedBlock};
pub use feed::{Feed, PutOutcome};
pub use replicate::{FeedMessage, FeedReplication, ReplicationConfig};

use crate::codec::CodecError;
use crate::crypto::PublicKey;
use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// Append on a feed we do not hold the secret for
    #[error("feed {0} is read-only")]
    NotWritable(PublicKey),
    /// A secret was supplied for a different feed key
    #[error("secret key does not match feed {0}")]
    KeyMismatch(PublicKey),
    #[error("block {seq} not found (feed length {length})")]
    NotFound { seq: u64, length: u64 },
    #[error("timed out waiting for block {seq}")]
    Timeout { seq: u64 },
    /// Stored data failed verification, or a write failed part way
    #[error("feed {feed} is corrupt at block {seq}")]
    Corrupt { feed: PublicKey, seq: u64 },
    #[error("invalid signature on block {seq}")]
    InvalidSignature { seq: u64 },
    #[error("block belongs to feed {got}, expected {expected}")]
    WrongFeed { expected: PublicKey, got: PublicKey },
    /// A replicated block skipped ahead of the local length
    #[error("expected block {expected}, got {got}")]
    Gap { expected: u64, got: u64 },
    /// A different block is already stored at this position
    #[error("conflicting block at {seq}")]
    Fork { seq: u64 },
    #[error("block {seq} does not chain to its predecessor")]
    BrokenChain { seq: u64 },
    #[error("feed closed")]
    Closed,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}
