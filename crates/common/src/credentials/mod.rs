//! Signed credentials and the state machines that interpret them
//!
//! Credentials are written into feeds like any other message. Folding them
//! in the space's deterministic order through a [`SpaceStateMachine`]
//! decides who is a member, which devices act for which identity and which
//! feeds may carry mutations.

mod assertion;
mod chain;
mod credential;
mod identity;
mod space_state;

pub use assertion::{Assertion, SpaceRole};
pub use chain::{build_chain, verify_chain};
pub use credential::{Credential, CredentialId, Proof};
pub use identity::{DeviceChainTrigger, IdentityStateMachine, MAX_CHAIN_DEPTH};
pub use space_state::{AdmittedFeed, Member, SpaceGenesisKind, SpaceStateMachine};

use crate::codec::CodecError;
use crate::crypto::{KeyError, PublicKey};

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("invalid signature on {kind} credential")]
    InvalidSignature { kind: String },
    /// A device signed without proving it acts for the issuer
    #[error("credential signed by a device carries no chain")]
    MissingChain,
    #[error("invalid credential chain: {0}")]
    InvalidChain(String),
    #[error("credential chain exceeds {} links", MAX_CHAIN_DEPTH)]
    ChainTooDeep,
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The signing device was revoked or never authorized
    #[error("device {0} is not authorized")]
    Revoked(PublicKey),
    #[error("genesis credential not processed yet")]
    NotInitialized,
    #[error("genesis credential already processed")]
    AlreadyInitialized,
    #[error("malformed credential: {0}")]
    Malformed(String),
    #[error("timed out waiting for credential")]
    Timeout,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Result of processing a credential that was not rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialOutcome {
    Applied(StateChange),
    /// Already processed; processing is idempotent
    Duplicate,
    /// Valid shape but not relevant to this state machine
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    SpaceGenesis,
    IdentityGenesis(PublicKey),
    MemberAdmitted {
        identity_key: PublicKey,
        role: SpaceRole,
    },
    MemberRevoked(PublicKey),
    FeedAdmitted {
        feed_key: PublicKey,
        identity_key: PublicKey,
        device_key: PublicKey,
    },
    FeedRevoked(PublicKey),
    DeviceAuthorized {
        identity_key: PublicKey,
        device_key: PublicKey,
    },
    DeviceRevoked {
        identity_key: PublicKey,
        device_key: PublicKey,
    },
}
