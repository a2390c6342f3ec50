use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{hash_parts, PublicKey, SecretKey, Signature, BLAKE3_HASH_SIZE};

const BLOCK_DOMAIN: &[u8] = b"strand/feed-block/v1";

/// blake3 hash of a signed block, chaining each block to its predecessor
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct BlockHash([u8; BLAKE3_HASH_SIZE]);

impl BlockHash {
    /// The `prev_hash` of block zero
    pub const ZERO: BlockHash = BlockHash([0; BLAKE3_HASH_SIZE]);

    pub fn as_bytes(&self) -> &[u8; BLAKE3_HASH_SIZE] {
        &self.0
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", &hex::encode(self.0)[..12])
    }
}

/// A signed entry of a feed
///
/// The signature covers the feed key, sequence number, predecessor hash and
/// payload, so a block cannot be replayed into another feed or position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedBlock {
    pub feed_key: PublicKey,
    pub seq: u64,
    pub prev_hash: BlockHash,
    pub payload: Vec<u8>,
    pub signature: Signature,
}

impl FeedBlock {
    /// Sign a new block with the feed's secret key
    pub fn sign(secret: &SecretKey, seq: u64, prev_hash: BlockHash, payload: Vec<u8>) -> Self {
        let feed_key = secret.public();
        let signature = secret.sign(&signing_bytes(&feed_key, seq, &prev_hash, &payload));
        Self {
            feed_key,
            seq,
            prev_hash,
            payload,
            signature,
        }
    }

    /// Check the signature against the block's feed key
    pub fn verify(&self) -> bool {
        self.feed_key
            .verify(
                &signing_bytes(&self.feed_key, self.seq, &self.prev_hash, &self.payload),
                &self.signature,
            )
            .is_ok()
    }

    pub fn hash(&self) -> BlockHash {
        BlockHash(hash_parts(&[
            &signing_bytes(&self.feed_key, self.seq, &self.prev_hash, &self.payload),
            &self.signature.to_bytes(),
        ]))
    }
}

fn signing_bytes(feed_key: &PublicKey, seq: u64, prev_hash: &BlockHash, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(BLOCK_DOMAIN.len() + 32 + 8 + 32 + 8 + payload.len());
    bytes.extend_from_slice(BLOCK_DOMAIN);
    bytes.extend_from_slice(&feed_key.to_bytes());
    bytes.extend_from_slice(&seq.to_le_bytes());
    bytes.extend_from_slice(prev_hash.as_bytes());
    bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_block_signature_binds_position() {
        let secret = SecretKey::generate();
        let block = FeedBlock::sign(&secret, 0, BlockHash::ZERO, b"genesis".to_vec());
        assert!(block.verify());

        let mut moved = block.clone();
        moved.seq = 1;
        assert!(!moved.verify());

        let mut tampered = block.clone();
        tampered.payload = b"genesis!".to_vec();
        assert!(!tampered.verify());

        let next = FeedBlock::sign(&secret, 1, block.hash(), b"next".to_vec());
        assert!(next.verify());
        assert_ne!(next.hash(), block.hash());
    }
}
