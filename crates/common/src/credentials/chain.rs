use super::identity::MAX_CHAIN_DEPTH;
use super::{Assertion, Credential, CredentialError};
use crate::crypto::PublicKey;

/// Check, without any membership state, that `credential` was signed by
/// `root` or by a device whose authorization chain ends at `root`
///
/// Used to vet credentials received from a peer before writing them into
/// a feed. Revocation is not known here; the space state machine applies it
/// when the credential is folded.
pub fn verify_chain(credential: &Credential, root: &PublicKey) -> Result<(), CredentialError> {
    let mut current = credential;
    for _ in 0..=MAX_CHAIN_DEPTH {
        current.verify_signature()?;
        let signer = current.proof.signer;
        if signer == *root && current.issuer == *root {
            return Ok(());
        }
        let chain = current
            .proof
            .chain
            .as_deref()
            .ok_or(CredentialError::MissingChain)?;
        match &chain.assertion {
            Assertion::AuthorizedDevice {
                identity_key,
                device_key,
            } if identity_key == root && *device_key == signer && chain.issuer == *root => {}
            _ => {
                return Err(CredentialError::InvalidChain(format!(
                    "chain link does not authorize {} for {}",
                    signer.short(),
                    root.short()
                )))
            }
        }
        current = chain;
    }
    Err(CredentialError::ChainTooDeep)
}

/// Find the authorization of `device` for `root` among `credentials`,
/// ready to be attached as the `chain` of a credential `device` signs
///
/// # Errors
/// * `CredentialError::MissingChain` - no credential authorizes `device`
/// * any error from [`verify_chain`] on the credential found
pub fn build_chain<'a>(
    credentials: impl IntoIterator<Item = &'a Credential>,
    root: &PublicKey,
    device: &PublicKey,
) -> Result<Credential, CredentialError> {
    let authorization = credentials
        .into_iter()
        .find(|credential| {
            matches!(
                &credential.assertion,
                Assertion::AuthorizedDevice { identity_key, device_key }
                    if identity_key == root && device_key == device
            )
        })
        .ok_or(CredentialError::MissingChain)?;
    verify_chain(authorization, root)?;
    Ok(authorization.clone())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::Keyring;

    #[test]
    fn test_verify_chain_follows_device_links() {
        let keyring = Keyring::new();
        let identity = keyring.generate();
        let device = keyring.generate();
        let feed = keyring.generate();
        let space = keyring.generate();

        let device_auth = Credential::issue(
            &keyring,
            &identity,
            identity,
            device,
            Assertion::AuthorizedDevice {
                identity_key: identity,
                device_key: device,
            },
            None,
        )
        .unwrap();
        let admission = Credential::issue(
            &keyring,
            &device,
            identity,
            feed,
            Assertion::AdmittedFeed {
                space_key: space,
                identity_key: identity,
                device_key: device,
            },
            Some(device_auth.clone()),
        )
        .unwrap();

        verify_chain(&admission, &identity).unwrap();
        let rebuilt = build_chain([&admission, &device_auth], &identity, &device).unwrap();
        assert_eq!(rebuilt, device_auth);
        assert!(matches!(
            build_chain([&admission], &identity, &device),
            Err(CredentialError::MissingChain)
        ));
        assert!(matches!(
            verify_chain(&admission, &space),
            Err(CredentialError::InvalidChain(_))
        ));

        let unchained = Credential::issue(
            &keyring,
            &device,
            identity,
            feed,
            admission.assertion.clone(),
            None,
        )
        .unwrap();
        assert!(matches!(
            verify_chain(&unchained, &identity),
            Err(CredentialError::MissingChain)
        ));
    }
}
