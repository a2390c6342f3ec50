//! Invitations: admitting a new member or device through an ephemeral swarm
//!
//! The host generates an [`Invitation`], hands its encoded form to the guest
//! out of band and waits on the invitation's swarm. The guest decodes it,
//! joins the same swarm and, once both sides agree on the shared secret,
//! sends the credentials it needs written. The host writes them through its
//! [`AdmissionHandler`] and replies with what the guest needs to start
//! replicating.
//!
//! Both sides observe progress through an [`InvitationHandle`].

mod guest;
mod handle;
mod host;
#[allow(clippy::module_inception)]
mod invitation;
mod messages;

pub use guest::accept_invitation;
pub use handle::{InvitationHandle, InvitationState};
pub use host::{create_invitation, InvitationOffer};
pub use invitation::{AuthMethod, Invitation, InvitationDecodeError, InvitationKind};
pub use messages::{AdmissionRequest, AdmissionResponse, AuthStatus, InvitationMessage};

use std::time::Duration;

use async_trait::async_trait;

use crate::codec::CodecError;
use crate::network::{NetworkError, PortError};

#[derive(Debug, thiserror::Error)]
pub enum InvitationError {
    #[error(transparent)]
    Decode(#[from] InvitationDecodeError),
    #[error("invitation expired")]
    Expired,
    #[error("invitation cancelled")]
    Cancelled,
    /// The guest presented the wrong code; a new invitation is needed
    #[error("invalid authentication code")]
    InvalidCode,
    #[error("too many failed authentication attempts")]
    TooManyAttempts,
    /// The invitation was already redeemed
    #[error("invitation already used")]
    AlreadyUsed,
    #[error("remote does not know this invitation")]
    UnknownInvitation,
    /// The host refused or failed the admission
    #[error("admission rejected: {0}")]
    Rejected(String),
    #[error("invitation protocol error: {0}")]
    Protocol(String),
    #[error("timed out waiting for the remote")]
    Timeout,
    #[error("invitation result already taken")]
    AlreadyAwaited,
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Tuning for both sides of an invitation
#[derive(Debug, Clone)]
pub struct InvitationConfig {
    /// How long a new invitation stays valid
    pub timeout: Duration,
    /// Digits in a generated shared-secret code
    pub auth_code_length: usize,
    /// Wrong codes the host accepts before failing the invitation
    pub max_auth_attempts: usize,
    /// Longest wait for any single handshake message
    pub handshake_timeout: Duration,
}

impl Default for InvitationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            auth_code_length: 6,
            max_auth_attempts: 3,
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

/// Supplies the code the guest presents
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn secret(&self) -> Result<String, InvitationError>;
}

/// Checks a code presented by the guest
pub trait SecretValidator: Send + Sync {
    fn validate(&self, code: &str) -> bool;
}

/// A code known up front, usable on either side
#[derive(Clone)]
pub struct StaticSecret(String);

impl StaticSecret {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }
}

impl std::fmt::Debug for StaticSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticSecret(..)")
    }
}

#[async_trait]
impl SecretProvider for StaticSecret {
    async fn secret(&self) -> Result<String, InvitationError> {
        Ok(self.0.clone())
    }
}

impl SecretValidator for StaticSecret {
    fn validate(&self, code: &str) -> bool {
        // compare without short-circuiting on the first differing byte
        let (a, b) = (self.0.as_bytes(), code.as_bytes());
        a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

/// Host-side hook that writes a guest's credentials
#[async_trait]
pub trait AdmissionHandler: Send + Sync {
    async fn admit(&self, request: AdmissionRequest) -> Result<AdmissionResponse, InvitationError>;
}
