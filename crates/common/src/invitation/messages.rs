use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::invitation::AuthMethod;
use crate::codec::{self, CodecError};
use crate::credentials::Credential;
use crate::crypto::PublicKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthStatus {
    Ok,
    InvalidCode,
    TooManyAttempts,
}

/// What the guest asks the host to write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmissionRequest {
    /// Make `identity_key` a member and admit the feed its device signed for
    Space {
        identity_key: PublicKey,
        device_key: PublicKey,
        /// `AdmittedFeed` credential signed by the guest's device
        feed_admission: Credential,
    },
    /// Authorize `device_key` for the host's identity, writing to `feed_key`
    Device {
        device_key: PublicKey,
        feed_key: PublicKey,
    },
}

/// What the guest needs to open the space it was admitted to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionResponse {
    pub space_key: PublicKey,
    pub genesis_feed: PublicKey,
    /// The identity the space is rooted at or administered by
    pub identity_key: PublicKey,
}

/// Frames of the invitation handshake, in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvitationMessage {
    Introduce { invitation_id: Uuid },
    IntroduceReply { auth_method: AuthMethod },
    Authenticate { code: String },
    AuthenticateReply { status: AuthStatus },
    Admit(AdmissionRequest),
    AdmitReply(AdmissionResponse),
    Error { reason: String },
}

impl InvitationMessage {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        codec::decode(bytes)
    }
}
