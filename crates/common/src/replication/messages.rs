use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::crypto::{hash_parts, PublicKey, Signature, BLAKE3_HASH_SIZE};
use crate::feed::FeedMessage;

/// Size of the nonce each side challenges the other with
pub const CHALLENGE_SIZE: usize = 32;

const CHALLENGE_CONTEXT: &[u8] = b"strand-replication-challenge";

/// Frames exchanged on a replication connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// First frame from each side: a fresh nonce the remote must sign
    Challenge { nonce: [u8; CHALLENGE_SIZE] },
    /// Answer to a challenge, signed by the sender's device key
    Authenticate { signature: Signature },
    /// Sent once the remote is authenticated: the space and every feed held for it
    Hello {
        space_key: PublicKey,
        feeds: Vec<PublicKey>,
    },
    /// A message of one feed's replication session
    Feed { feed: PublicKey, message: FeedMessage },
    /// The sender is closing the connection
    Error { reason: String },
}

impl ReplicationMessage {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        codec::decode(bytes)
    }
}

/// Bytes a device signs to answer `nonce` for `space_key`
pub fn challenge_digest(
    space_key: &PublicKey,
    nonce: &[u8; CHALLENGE_SIZE],
) -> [u8; BLAKE3_HASH_SIZE] {
    hash_parts(&[CHALLENGE_CONTEXT, &space_key.to_bytes(), nonce])
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::SecretKey;

    #[test]
    fn test_challenge_is_bound_to_space_and_nonce() {
        let device = SecretKey::generate();
        let space = SecretKey::generate().public();
        let nonce = [7u8; CHALLENGE_SIZE];
        let signature = device.sign(&challenge_digest(&space, &nonce));

        let frame = ReplicationMessage::Authenticate { signature }.encode().unwrap();
        let ReplicationMessage::Authenticate { signature } = ReplicationMessage::decode(&frame).unwrap() else {
            panic!("decoded the wrong frame");
        };
        assert!(device
            .public()
            .verify(&challenge_digest(&space, &nonce), &signature)
            .is_ok());
        assert!(device
            .public()
            .verify(&challenge_digest(&space, &[8u8; CHALLENGE_SIZE]), &signature)
            .is_err());
        let other_space = SecretKey::generate().public();
        assert!(device
            .public()
            .verify(&challenge_digest(&other_space, &nonce), &signature)
            .is_err());
    }
}
