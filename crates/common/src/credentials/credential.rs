use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Assertion, CredentialError};
use crate::codec;
use crate::crypto::{hash_parts, Keyring, PublicKey, Signature, BLAKE3_HASH_SIZE};

const CREDENTIAL_DOMAIN: &str = "strand/credential/v1";

/// Content hash of a signed credential
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CredentialId([u8; BLAKE3_HASH_SIZE]);

impl CredentialId {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialId({})", &self.to_hex()[..12])
    }
}

/// A signed statement by `issuer` about `subject`
///
/// When the signer is not the issuer itself, `proof.chain` carries the
/// credential that authorizes the signer to act for the issuer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub subject: PublicKey,
    pub issuer: PublicKey,
    /// Unix milliseconds at signing
    pub issued_at: i64,
    pub assertion: Assertion,
    pub proof: Proof,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub signer: PublicKey,
    pub signature: Signature,
    pub chain: Option<Box<Credential>>,
}

impl Credential {
    /// Sign a new credential with `signer` from the keyring
    ///
    /// # Arguments
    /// * `keyring` - must hold the secret for `signer`
    /// * `signer` - the key producing the signature
    /// * `issuer` - the principal the credential speaks for
    /// * `subject` - the key the assertion is about
    /// * `chain` - proof that `signer` acts for `issuer`, when they differ
    pub fn issue(
        keyring: &Keyring,
        signer: &PublicKey,
        issuer: PublicKey,
        subject: PublicKey,
        assertion: Assertion,
        chain: Option<Credential>,
    ) -> Result<Self, CredentialError> {
        let issued_at = chrono::Utc::now().timestamp_millis();
        let bytes = signing_bytes(&subject, &issuer, issued_at, &assertion, signer)?;
        let signature = keyring.sign(signer, &bytes)?;
        Ok(Self {
            subject,
            issuer,
            issued_at,
            assertion,
            proof: Proof {
                signer: *signer,
                signature,
                chain: chain.map(Box::new),
            },
        })
    }

    pub fn kind(&self) -> &str {
        self.assertion.kind()
    }

    pub fn id(&self) -> Result<CredentialId, CredentialError> {
        Ok(CredentialId(hash_parts(&[&codec::encode(self)?])))
    }

    /// Check the signature alone. Authority is decided by the state machines.
    pub fn verify_signature(&self) -> Result<(), CredentialError> {
        let bytes = signing_bytes(
            &self.subject,
            &self.issuer,
            self.issued_at,
            &self.assertion,
            &self.proof.signer,
        )?;
        self.proof
            .signer
            .verify(&bytes, &self.proof.signature)
            .map_err(|_| CredentialError::InvalidSignature {
                kind: self.kind().to_string(),
            })
    }
}

fn signing_bytes(
    subject: &PublicKey,
    issuer: &PublicKey,
    issued_at: i64,
    assertion: &Assertion,
    signer: &PublicKey,
) -> Result<Vec<u8>, CredentialError> {
    Ok(codec::encode(&(
        CREDENTIAL_DOMAIN,
        subject,
        issuer,
        issued_at,
        assertion,
        signer,
    ))?)
}
