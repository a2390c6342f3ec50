use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use tokio::sync::watch;

use super::{Assertion, Credential, CredentialError, CredentialId, CredentialOutcome, StateChange};
use crate::crypto::PublicKey;

/// Deepest chain of device authorizations that is followed
pub const MAX_CHAIN_DEPTH: usize = 8;

/// Fires once the local device's authorization credential is processed
pub type DeviceChainTrigger = Arc<watch::Sender<Option<Credential>>>;

/// Tracks which devices may act for one identity
///
/// A device is authorized by an `AuthorizedDevice` credential whose proof
/// chain ends at the identity key, and loses that status on `RevokeDevice`.
/// Authority is always checked against current state, so revoking a device
/// invalidates any later credential that relies on it.
#[derive(Debug)]
pub struct IdentityStateMachine {
    identity_key: PublicKey,
    active: bool,
    devices: BTreeMap<PublicKey, Credential>,
    revoked: BTreeSet<PublicKey>,
    seen: HashSet<CredentialId>,
    local_device: Option<(PublicKey, DeviceChainTrigger)>,
}

impl IdentityStateMachine {
    /// An identity that becomes active once its genesis credential is processed
    pub fn new(identity_key: PublicKey) -> Self {
        Self {
            identity_key,
            active: false,
            devices: BTreeMap::new(),
            revoked: BTreeSet::new(),
            seen: HashSet::new(),
            local_device: None,
        }
    }

    /// An identity whose key is already trusted, e.g. an admitted space member
    pub fn trusted(identity_key: PublicKey) -> Self {
        Self {
            active: true,
            ..Self::new(identity_key)
        }
    }

    /// Fire `trigger` when `device` is authorized for this identity
    pub fn with_local_device(mut self, device: PublicKey, trigger: DeviceChainTrigger) -> Self {
        self.local_device = Some((device, trigger));
        self
    }

    pub fn identity_key(&self) -> PublicKey {
        self.identity_key
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_device_authorized(&self, device: &PublicKey) -> bool {
        *device == self.identity_key || self.devices.contains_key(device)
    }

    pub fn authorized_devices(&self) -> impl Iterator<Item = &PublicKey> {
        self.devices.keys()
    }

    /// The credential authorizing `device`, usable as a proof chain
    pub fn device_credential(&self, device: &PublicKey) -> Option<&Credential> {
        self.devices.get(device)
    }

    pub fn process(&mut self, credential: &Credential) -> Result<CredentialOutcome, CredentialError> {
        self.process_at_depth(credential, 0)
    }

    fn process_at_depth(
        &mut self,
        credential: &Credential,
        depth: usize,
    ) -> Result<CredentialOutcome, CredentialError> {
        if depth > MAX_CHAIN_DEPTH {
            return Err(CredentialError::ChainTooDeep);
        }
        let id = credential.id()?;
        if self.seen.contains(&id) {
            return Ok(CredentialOutcome::Duplicate);
        }

        let outcome = match &credential.assertion {
            Assertion::IdentityGenesis => {
                if credential.subject != self.identity_key
                    || credential.issuer != self.identity_key
                    || credential.proof.signer != self.identity_key
                {
                    return Err(CredentialError::Unauthorized(
                        "identity genesis must be self-signed by the identity".into(),
                    ));
                }
                credential.verify_signature()?;
                self.active = true;
                CredentialOutcome::Applied(StateChange::IdentityGenesis(self.identity_key))
            }
            Assertion::AuthorizedDevice {
                identity_key,
                device_key,
            } => {
                if *identity_key != self.identity_key {
                    return Ok(CredentialOutcome::Ignored);
                }
                self.check_shape(credential, device_key)?;
                self.authorize_at_depth(credential, depth)?;
                self.devices.insert(*device_key, credential.clone());
                self.revoked.remove(device_key);
                if let Some((local, trigger)) = &self.local_device {
                    if local == device_key {
                        trigger.send_replace(Some(credential.clone()));
                    }
                }
                CredentialOutcome::Applied(StateChange::DeviceAuthorized {
                    identity_key: self.identity_key,
                    device_key: *device_key,
                })
            }
            Assertion::RevokeDevice {
                identity_key,
                device_key,
            } => {
                if *identity_key != self.identity_key {
                    return Ok(CredentialOutcome::Ignored);
                }
                self.check_shape(credential, device_key)?;
                self.authorize_at_depth(credential, depth)?;
                self.devices.remove(device_key);
                self.revoked.insert(*device_key);
                CredentialOutcome::Applied(StateChange::DeviceRevoked {
                    identity_key: self.identity_key,
                    device_key: *device_key,
                })
            }
            _ => return Ok(CredentialOutcome::Ignored),
        };

        self.seen.insert(id);
        Ok(outcome)
    }

    fn check_shape(&self, credential: &Credential, device_key: &PublicKey) -> Result<(), CredentialError> {
        if !self.active {
            return Err(CredentialError::NotInitialized);
        }
        if credential.issuer != self.identity_key || credential.subject != *device_key {
            return Err(CredentialError::Malformed(format!(
                "{} must be issued by the identity about the device",
                credential.kind()
            )));
        }
        Ok(())
    }

    /// Check that `credential` was signed by this identity or a device
    /// currently acting for it
    ///
    /// # Errors
    /// * `CredentialError::MissingChain` - a device signed without a chain
    /// * `CredentialError::InvalidChain` - the chain does not link signer to identity
    /// * `CredentialError::Revoked` - the signing device is no longer authorized
    pub fn authorize_signer(&mut self, credential: &Credential) -> Result<(), CredentialError> {
        self.authorize_at_depth(credential, 0)
    }

    fn authorize_at_depth(&mut self, credential: &Credential, depth: usize) -> Result<(), CredentialError> {
        credential.verify_signature()?;
        let signer = credential.proof.signer;
        if signer == self.identity_key {
            return Ok(());
        }

        let chain = credential
            .proof
            .chain
            .as_deref()
            .ok_or(CredentialError::MissingChain)?;
        match &chain.assertion {
            Assertion::AuthorizedDevice {
                identity_key,
                device_key,
            } if *identity_key == self.identity_key && *device_key == signer => {}
            _ => {
                return Err(CredentialError::InvalidChain(format!(
                    "chain does not authorize {} for {}",
                    signer.short(),
                    self.identity_key.short()
                )))
            }
        }
        self.process_at_depth(chain, depth + 1)?;

        if !self.is_device_authorized(&signer) {
            return Err(CredentialError::Revoked(signer));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::Keyring;

    fn genesis(keyring: &Keyring, identity: PublicKey) -> Credential {
        Credential::issue(
            keyring,
            &identity,
            identity,
            identity,
            Assertion::IdentityGenesis,
            None,
        )
        .unwrap()
    }

    fn authorize(
        keyring: &Keyring,
        signer: &PublicKey,
        identity: PublicKey,
        device: PublicKey,
        chain: Option<Credential>,
    ) -> Credential {
        Credential::issue(
            keyring,
            signer,
            identity,
            device,
            Assertion::AuthorizedDevice {
                identity_key: identity,
                device_key: device,
            },
            chain,
        )
        .unwrap()
    }

    #[test]
    fn test_device_chain_through_other_device() {
        let keyring = Keyring::new();
        let identity = keyring.generate();
        let first = keyring.generate();
        let second = keyring.generate();

        let trigger: DeviceChainTrigger = Arc::new(watch::channel(None).0);
        let mut rx = trigger.subscribe();
        let mut machine =
            IdentityStateMachine::new(identity).with_local_device(second, trigger.clone());

        machine.process(&genesis(&keyring, identity)).unwrap();
        let first_auth = authorize(&keyring, &identity, identity, first, None);
        // second is authorized by first, carrying first's authorization as chain
        let second_auth = authorize(&keyring, &first, identity, second, Some(first_auth.clone()));

        assert!(matches!(
            machine.process(&second_auth).unwrap(),
            CredentialOutcome::Applied(StateChange::DeviceAuthorized { .. })
        ));
        assert!(machine.is_device_authorized(&first));
        assert!(machine.is_device_authorized(&second));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_ref(), Some(&second_auth));

        assert_eq!(
            machine.process(&first_auth).unwrap(),
            CredentialOutcome::Duplicate
        );
    }

    #[test]
    fn test_rejects_unrooted_and_revoked_signers() {
        let keyring = Keyring::new();
        let identity = keyring.generate();
        let device = keyring.generate();
        let stranger = keyring.generate();
        let mut machine = IdentityStateMachine::new(identity);

        let early = authorize(&keyring, &identity, identity, device, None);
        assert!(matches!(
            machine.process(&early),
            Err(CredentialError::NotInitialized)
        ));
        machine.process(&genesis(&keyring, identity)).unwrap();

        // a stranger cannot authorize itself
        let forged = authorize(&keyring, &stranger, identity, stranger, None);
        assert!(matches!(
            machine.process(&forged),
            Err(CredentialError::MissingChain)
        ));

        machine.process(&early).unwrap();
        let revoke = Credential::issue(
            &keyring,
            &identity,
            identity,
            device,
            Assertion::RevokeDevice {
                identity_key: identity,
                device_key: device,
            },
            None,
        )
        .unwrap();
        machine.process(&revoke).unwrap();
        assert!(!machine.is_device_authorized(&device));

        // the revoked device can no longer vouch for new devices
        let other = keyring.generate();
        let via_revoked = authorize(&keyring, &device, identity, other, Some(early));
        assert!(matches!(
            machine.process(&via_revoked),
            Err(CredentialError::Revoked(k)) if k == device
        ));
        assert!(!machine.is_device_authorized(&other));
    }
}
