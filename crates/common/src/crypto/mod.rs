//! Cryptographic primitives
//!
//! - **Keys**: Ed25519 keypairs wrapping iroh's key types. Every principal
//!   (feed, device, identity, space, peer) is named by a [`PublicKey`].
//! - **Keyring**: the shared store of secrets a node can sign with.
//! - **Passcodes**: short numeric codes for shared-secret invitations.
//! - **Hashes**: blake3 digests used for block chaining and credential ids.

mod keyring;
mod keys;
mod passcode;

pub use ed25519_dalek::Signature;
pub use keyring::Keyring;
pub use keys::{KeyError, PublicKey, SecretKey, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE};
pub use passcode::generate_passcode;

/// Size of a blake3 digest in bytes
pub const BLAKE3_HASH_SIZE: usize = 32;

/// Hash a list of byte slices as one blake3 input
pub fn hash_parts(parts: &[&[u8]]) -> [u8; BLAKE3_HASH_SIZE] {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}
