use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{KeyError, PublicKey, SecretKey, Signature};

/// Shared store of the secret keys a node holds
///
/// Cloning is cheap; all clones see the same keys. Identity, device, feed
/// and (briefly) space genesis keys all live here so that signing code can
/// ask for a key by its public half.
#[derive(Clone, Default)]
pub struct Keyring {
    keys: Arc<RwLock<HashMap<PublicKey, SecretKey>>>,
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("keys", &self.keys.read().len())
            .finish()
    }
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate and store a fresh keypair, returning its public key
    pub fn generate(&self) -> PublicKey {
        self.insert(SecretKey::generate())
    }

    /// Store an existing secret, returning its public key
    pub fn insert(&self, secret: SecretKey) -> PublicKey {
        let public = secret.public();
        self.keys.write().insert(public, secret);
        public
    }

    pub fn get(&self, key: &PublicKey) -> Option<SecretKey> {
        self.keys.read().get(key).cloned()
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.keys.read().contains_key(key)
    }

    /// Forget a secret. Used to discard space genesis keys once the
    /// genesis credentials are written.
    pub fn remove(&self, key: &PublicKey) -> Option<SecretKey> {
        self.keys.write().remove(key)
    }

    /// Sign `msg` with the secret behind `key`
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::MissingSecret`] if the keyring does not hold `key`.
    pub fn sign(&self, key: &PublicKey, msg: &[u8]) -> Result<Signature, KeyError> {
        let keys = self.keys.read();
        let secret = keys.get(key).ok_or(KeyError::MissingSecret(*key))?;
        Ok(secret.sign(msg))
    }

    pub fn public_keys(&self) -> Vec<PublicKey> {
        let mut keys: Vec<_> = self.keys.read().keys().copied().collect();
        keys.sort();
        keys
    }
}
