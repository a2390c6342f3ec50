//! Spaces: shared, replicated object models
//!
//! A space is a set of feeds, one per writing device, merged by the
//! [`Pipeline`] into a single deterministic order. Credentials in that
//! order decide membership and which feeds may write; mutations build the
//! [`ObjectModel`].

mod message;
mod model;
mod pipeline;
#[allow(clippy::module_inception)]
mod space;

pub use message::{Mutation, Payload, SpaceMessage};
pub use model::{ModelError, Object, ObjectId, ObjectModel, Value};
pub use pipeline::{OrderKey, Pipeline};
pub use space::{Space, SpaceConfig, SpaceContext, WriteReceipt};

use crate::codec::CodecError;
use crate::credentials::{CredentialError, StateChange};
use crate::crypto::{KeyError, PublicKey};
use crate::feed::FeedError;
use crate::feed_store::FeedStoreError;

#[derive(Debug, thiserror::Error)]
pub enum SpaceError {
    #[error("feed {0} is already part of the space")]
    AlreadyAdmitted(PublicKey),
    #[error("feed {0} is not part of the space")]
    UnknownFeed(PublicKey),
    /// The local feed is not (or no longer) admitted to write mutations
    #[error("local feed is not authorized to write")]
    NotWritable,
    /// Credentials were submitted for another space or identity
    #[error("invalid admission: {0}")]
    InvalidAdmission(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("space closed")]
    Closed,
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    FeedStore(#[from] FeedStoreError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Why a mutation was not applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Its feed was not admitted, revoked, or its writer lost write access
    Unauthorized,
    /// It did not apply to the current model
    Invalid(String),
}

/// Observable progress of a space
#[derive(Debug, Clone, PartialEq)]
pub enum SpaceEvent {
    /// A block was consumed by the pipeline (the processing receipt)
    Processed { feed_key: PublicKey, seq: u64 },
    /// A mutation changed the object model
    Updated { feed_key: PublicKey, seq: u64 },
    StateChanged(StateChange),
    CredentialRejected {
        feed_key: PublicKey,
        seq: u64,
        reason: String,
    },
    MutationDropped {
        feed_key: PublicKey,
        seq: u64,
        reason: DropReason,
    },
    /// A block that could not be decoded; it still advances the timeframe
    Malformed { feed_key: PublicKey, seq: u64 },
    /// A late block forced the state to be re-folded from the ordered log
    Rebuilt,
    /// A feed could not be read and is skipped from now on
    FeedDegraded { feed_key: PublicKey, reason: String },
}

#[cfg(test)]
mod pipeline_test;
