use std::fmt;
use std::ops::Deref;

use iroh::{PublicKey as PPublicKey, SecretKey as SSecretKey};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Size of Ed25519 private key in bytes
pub const PRIVATE_KEY_SIZE: usize = 32;
/// Size of Ed25519 public key in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Errors that can occur during key operations
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// Input was not valid hex of the right width
    #[error("invalid hex encoding for {0}")]
    InvalidHex(&'static str),
    /// Raw key material had the wrong length
    #[error("invalid key size, expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },
    /// The bytes do not describe a point on the curve
    #[error("invalid public key: {0}")]
    InvalidPoint(String),
    /// PEM framing was malformed or carried the wrong tag
    #[error("invalid PEM: {0}")]
    Pem(String),
    /// A signing request named a key the keyring does not hold
    #[error("no secret held for key {0}")]
    MissingSecret(PublicKey),
}

/// Public half of an Ed25519 keypair
///
/// A thin wrapper around Iroh's `PublicKey`. The same type names every
/// principal in the system:
/// - **Feeds**: a feed is addressed by the key that signs its blocks
/// - **Identities and devices**: members of a space and the devices acting for them
/// - **Spaces and swarms**: the space genesis key doubles as its swarm topic
/// - **Peers**: the device key is the network peer id (equivalent to Iroh's NodeId)
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Copy)]
pub struct PublicKey(PPublicKey);

impl Deref for PublicKey {
    type Target = PPublicKey;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<PPublicKey> for PublicKey {
    fn from(key: PPublicKey) -> Self {
        PublicKey(key)
    }
}

impl From<PublicKey> for PPublicKey {
    fn from(key: PublicKey) -> Self {
        key.0
    }
}

impl TryFrom<[u8; PUBLIC_KEY_SIZE]> for PublicKey {
    type Error = KeyError;
    fn try_from(bytes: [u8; PUBLIC_KEY_SIZE]) -> Result<Self, Self::Error> {
        PPublicKey::from_bytes(&bytes)
            .map(PublicKey)
            .map_err(|e| KeyError::InvalidPoint(e.to_string()))
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = KeyError;
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(KeyError::InvalidLength {
                expected: PUBLIC_KEY_SIZE,
                got: bytes.len(),
            });
        }
        let mut buff = [0; PUBLIC_KEY_SIZE];
        buff.copy_from_slice(bytes);
        buff.try_into()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::str::FromStr for PublicKey {
    type Err = KeyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl PublicKey {
    /// Parse a public key from a hexadecimal string
    ///
    /// Accepts both plain hex and "0x"-prefixed hex strings.
    pub fn from_hex(hex: &str) -> Result<Self, KeyError> {
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        let mut buff = [0; PUBLIC_KEY_SIZE];
        hex::decode_to_slice(hex, &mut buff).map_err(|_| KeyError::InvalidHex("public key"))?;
        buff.try_into()
    }

    /// Convert public key to raw bytes
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.0.as_bytes()
    }

    /// Convert public key to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// First eight hex characters, for log lines
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(8);
        hex
    }

    /// Verify an Ed25519 signature on a message.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The public key bytes are invalid
    /// - The signature verification fails
    pub fn verify(
        &self,
        msg: &[u8],
        signature: &ed25519_dalek::Signature,
    ) -> Result<(), ed25519_dalek::SignatureError> {
        let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&self.to_bytes())?;
        verifying_key.verify_strict(msg, signature)
    }
}

/// Secret half of an Ed25519 keypair
///
/// A thin wrapper around Iroh's `SecretKey`. Secrets live in a
/// [`Keyring`](super::Keyring) and are only written to disk by the node
/// metadata store.
#[derive(Clone)]
pub struct SecretKey(SSecretKey);

impl From<[u8; PRIVATE_KEY_SIZE]> for SecretKey {
    fn from(secret: [u8; PRIVATE_KEY_SIZE]) -> Self {
        Self(SSecretKey::from_bytes(&secret))
    }
}

impl Deref for SecretKey {
    type Target = SSecretKey;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(public={})", self.public().short())
    }
}

impl SecretKey {
    /// Parse a secret key from a hexadecimal string
    ///
    /// Accepts both plain hex and "0x"-prefixed hex strings.
    pub fn from_hex(hex: &str) -> Result<Self, KeyError> {
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        let mut buff = [0; PRIVATE_KEY_SIZE];
        hex::decode_to_slice(hex, &mut buff).map_err(|_| KeyError::InvalidHex("secret key"))?;
        Ok(Self::from(buff))
    }

    /// Generate a new random secret key using the thread-local CSPRNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; PRIVATE_KEY_SIZE];
        rand::rng().fill(&mut bytes);
        Self::from(bytes)
    }

    /// Derive the public key from this secret key
    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.public())
    }

    /// Convert secret key to raw bytes
    pub fn to_bytes(&self) -> [u8; PRIVATE_KEY_SIZE] {
        self.0.to_bytes()
    }

    /// Convert secret key to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Encode secret key in PEM format for secure storage
    ///
    /// Returns a PEM-encoded string with tag "PRIVATE KEY".
    pub fn to_pem(&self) -> String {
        let pem = pem::Pem::new("PRIVATE KEY", self.to_bytes());
        pem::encode(&pem)
    }

    /// Parse a secret key from PEM format
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The PEM string is malformed
    /// - The PEM tag is not "PRIVATE KEY"
    /// - The key size is incorrect
    pub fn from_pem(pem_str: &str) -> Result<Self, KeyError> {
        let pem = pem::parse(pem_str).map_err(|e| KeyError::Pem(e.to_string()))?;

        if pem.tag() != "PRIVATE KEY" {
            return Err(KeyError::Pem(format!(
                "invalid tag {}, expected PRIVATE KEY",
                pem.tag()
            )));
        }

        let contents = pem.contents();
        if contents.len() != PRIVATE_KEY_SIZE {
            return Err(KeyError::InvalidLength {
                expected: PRIVATE_KEY_SIZE,
                got: contents.len(),
            });
        }

        let mut bytes = [0u8; PRIVATE_KEY_SIZE];
        bytes.copy_from_slice(contents);
        Ok(Self::from(bytes))
    }

    /// Sign a message with this secret key using Ed25519.
    ///
    /// Returns a detached signature that can be verified with the corresponding public key.
    pub fn sign(&self, msg: &[u8]) -> ed25519_dalek::Signature {
        // iroh uses a different version of ed25519_dalek, so we need to convert
        // the signature via bytes (both versions have the same 64-byte representation)
        let sig = self.0.sign(msg);
        ed25519_dalek::Signature::from_bytes(&sig.to_bytes())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_keypair_hex_round_trip() {
        let private_key = SecretKey::generate();
        let public_key = private_key.public();

        let recovered_private = SecretKey::from_hex(&private_key.to_hex()).unwrap();
        assert_eq!(private_key.to_bytes(), recovered_private.to_bytes());

        let recovered_public: PublicKey = public_key.to_hex().parse().unwrap();
        assert_eq!(public_key, recovered_public);
        assert_eq!(
            PublicKey::from_hex(&format!("0x{}", public_key.to_hex())).unwrap(),
            public_key
        );
    }

    #[test]
    fn test_pem_serialization() {
        let private_key = SecretKey::generate();

        let pem = private_key.to_pem();
        let recovered_private = SecretKey::from_pem(&pem).unwrap();
        assert_eq!(private_key.public(), recovered_private.public());

        let wrong_tag = pem::encode(&pem::Pem::new("PUBLIC KEY", private_key.to_bytes()));
        assert!(matches!(
            SecretKey::from_pem(&wrong_tag),
            Err(KeyError::Pem(_))
        ));
    }

    #[test]
    fn test_rejects_bad_lengths() {
        assert!(matches!(
            PublicKey::try_from(&[0u8; 12][..]),
            Err(KeyError::InvalidLength {
                expected: 32,
                got: 12
            })
        ));
        assert!(matches!(
            PublicKey::from_hex("abcd"),
            Err(KeyError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_sign_and_verify() {
        let secret_key = SecretKey::generate();
        let public_key = secret_key.public();
        let message = b"hello, world!";

        let signature = secret_key.sign(message);
        assert!(public_key.verify(message, &signature).is_ok());

        assert!(public_key.verify(b"hello, world?", &signature).is_err());

        let other_key = SecretKey::generate().public();
        assert!(other_key.verify(message, &signature).is_err());
    }
}
