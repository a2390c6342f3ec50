use common::codec::CodecError;
use common::credentials::CredentialError;
use common::crypto::{KeyError, PublicKey};
use common::feed_store::FeedStoreError;
use common::invitation::{InvitationDecodeError, InvitationError};
use common::network::NetworkError;
use common::space::SpaceError;

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node has no identity yet")]
    NoIdentity,
    #[error("node already has identity {0}")]
    IdentityExists(PublicKey),
    #[error("unknown space {0}")]
    UnknownSpace(PublicKey),
    #[error("already a member of space {0}")]
    SpaceExists(PublicKey),
    #[error("node closed")]
    Closed,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Space(#[from] SpaceError),
    #[error(transparent)]
    Invitation(#[from] InvitationError),
    #[error(transparent)]
    InvitationDecode(#[from] InvitationDecodeError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    FeedStore(#[from] FeedStoreError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}
