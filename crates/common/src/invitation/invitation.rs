use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{self, CodecError};
use crate::crypto::PublicKey;

/// Leading byte of an encoded invitation, bumped on format changes
const INVITATION_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvitationKind {
    /// Join a data space as a new member
    Space,
    /// Add a device to the host's identity
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    None,
    /// The guest must present a code shown by the host
    SharedSecret,
}

/// Everything a guest needs to find the host and redeem the invitation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub invitation_id: Uuid,
    pub kind: InvitationKind,
    /// Ephemeral topic both sides meet on
    pub swarm_key: PublicKey,
    pub auth_method: AuthMethod,
    /// Space the guest is invited to, for space invitations
    pub space_key: Option<PublicKey>,
    /// Device key of the host
    pub host_key: PublicKey,
    /// Absolute expiry, unix milliseconds
    pub expires_at: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum InvitationDecodeError {
    #[error("invitation is not valid base58check: {0}")]
    Base58(String),
    #[error("empty invitation")]
    Empty,
    #[error("unsupported invitation version {0}")]
    Version(u8),
    #[error("malformed invitation: {0}")]
    Malformed(#[from] CodecError),
}

impl Invitation {
    /// Encode as a Base58Check string safe for links and QR codes
    pub fn encode(&self) -> Result<String, CodecError> {
        let mut bytes = vec![INVITATION_VERSION];
        bytes.extend(codec::encode(self)?);
        Ok(bs58::encode(bytes).with_check().into_string())
    }

    pub fn decode(encoded: &str) -> Result<Self, InvitationDecodeError> {
        let bytes = bs58::decode(encoded.trim())
            .with_check(None)
            .into_vec()
            .map_err(|e| InvitationDecodeError::Base58(e.to_string()))?;
        let (version, body) = bytes.split_first().ok_or(InvitationDecodeError::Empty)?;
        if *version != INVITATION_VERSION {
            return Err(InvitationDecodeError::Version(*version));
        }
        Ok(codec::decode(body)?)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| chrono::Utc::now().timestamp_millis() >= expires_at)
    }

    /// Time left before expiry, `None` if the invitation never expires
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.expires_at.map(|expires_at| {
            let left = expires_at - chrono::Utc::now().timestamp_millis();
            std::time::Duration::from_millis(left.max(0) as u64)
        })
    }
}
