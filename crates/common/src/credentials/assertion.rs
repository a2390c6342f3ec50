use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::codec;
use crate::crypto::PublicKey;

/// Role of a member within a space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SpaceRole {
    /// May admit and revoke members
    Admin,
    /// May write mutations
    Editor,
    /// May replicate and read only
    Reader,
}

/// The claim a credential makes about its subject
///
/// On the wire every assertion is a `(kind, body)` pair. Kinds this
/// version does not know decode to [`Assertion::Unknown`] with the body
/// kept verbatim, so the credential still re-encodes to the signed bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assertion {
    /// Root of an identity; subject, issuer and signer are the identity key
    IdentityGenesis,
    /// `device_key` may act on behalf of `identity_key`
    AuthorizedDevice {
        identity_key: PublicKey,
        device_key: PublicKey,
    },
    RevokeDevice {
        identity_key: PublicKey,
        device_key: PublicKey,
    },
    /// Root of a space; subject, issuer and signer are the space key
    SpaceGenesis,
    /// The subject identity is a member of `space_key`
    SpaceMember { space_key: PublicKey, role: SpaceRole },
    RevokeMember { space_key: PublicKey },
    /// The subject feed, written by `device_key` for `identity_key`, is part of the space
    AdmittedFeed {
        space_key: PublicKey,
        identity_key: PublicKey,
        device_key: PublicKey,
    },
    RevokeFeed { space_key: PublicKey },
    Unknown { kind: String, body: Vec<u8> },
}

impl Assertion {
    pub fn kind(&self) -> &str {
        match self {
            Assertion::IdentityGenesis => "identity-genesis",
            Assertion::AuthorizedDevice { .. } => "authorized-device",
            Assertion::RevokeDevice { .. } => "revoke-device",
            Assertion::SpaceGenesis => "space-genesis",
            Assertion::SpaceMember { .. } => "space-member",
            Assertion::RevokeMember { .. } => "revoke-member",
            Assertion::AdmittedFeed { .. } => "admitted-feed",
            Assertion::RevokeFeed { .. } => "revoke-feed",
            Assertion::Unknown { kind, .. } => kind,
        }
    }

    fn body(&self) -> Result<Vec<u8>, codec::CodecError> {
        match self {
            Assertion::IdentityGenesis | Assertion::SpaceGenesis => Ok(Vec::new()),
            Assertion::AuthorizedDevice {
                identity_key,
                device_key,
            }
            | Assertion::RevokeDevice {
                identity_key,
                device_key,
            } => codec::encode(&(identity_key, device_key)),
            Assertion::SpaceMember { space_key, role } => codec::encode(&(space_key, role)),
            Assertion::RevokeMember { space_key } | Assertion::RevokeFeed { space_key } => {
                codec::encode(space_key)
            }
            Assertion::AdmittedFeed {
                space_key,
                identity_key,
                device_key,
            } => codec::encode(&(space_key, identity_key, device_key)),
            Assertion::Unknown { body, .. } => Ok(body.clone()),
        }
    }

    fn from_parts(kind: String, body: Vec<u8>) -> Result<Self, codec::CodecError> {
        let assertion = match kind.as_str() {
            "identity-genesis" => Assertion::IdentityGenesis,
            "space-genesis" => Assertion::SpaceGenesis,
            "authorized-device" => {
                let (identity_key, device_key) = codec::decode(&body)?;
                Assertion::AuthorizedDevice {
                    identity_key,
                    device_key,
                }
            }
            "revoke-device" => {
                let (identity_key, device_key) = codec::decode(&body)?;
                Assertion::RevokeDevice {
                    identity_key,
                    device_key,
                }
            }
            "space-member" => {
                let (space_key, role) = codec::decode(&body)?;
                Assertion::SpaceMember { space_key, role }
            }
            "revoke-member" => Assertion::RevokeMember {
                space_key: codec::decode(&body)?,
            },
            "admitted-feed" => {
                let (space_key, identity_key, device_key) = codec::decode(&body)?;
                Assertion::AdmittedFeed {
                    space_key,
                    identity_key,
                    device_key,
                }
            }
            "revoke-feed" => Assertion::RevokeFeed {
                space_key: codec::decode(&body)?,
            },
            _ => Assertion::Unknown { kind, body },
        };
        Ok(assertion)
    }
}

impl Serialize for Assertion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let body = self.body().map_err(S::Error::custom)?;
        (self.kind(), body).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Assertion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (kind, body) = <(String, Vec<u8>)>::deserialize(deserializer)?;
        Assertion::from_parts(kind, body).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::SecretKey;

    #[test]
    fn test_unknown_kind_keeps_body() {
        let bytes = codec::encode(&("future-claim", vec![1u8, 2, 3])).unwrap();
        let assertion: Assertion = codec::decode(&bytes).unwrap();
        assert_eq!(
            assertion,
            Assertion::Unknown {
                kind: "future-claim".to_string(),
                body: vec![1, 2, 3]
            }
        );
        assert_eq!(codec::encode(&assertion).unwrap(), bytes);
    }

    #[test]
    fn test_known_kind_with_bad_body_is_rejected() {
        let bytes = codec::encode(&("space-member", vec![9u8])).unwrap();
        assert!(codec::decode::<Assertion>(&bytes).is_err());

        let space_key = SecretKey::generate().public();
        let member = Assertion::SpaceMember {
            space_key,
            role: SpaceRole::Editor,
        };
        let decoded: Assertion = codec::decode(&codec::encode(&member).unwrap()).unwrap();
        assert_eq!(decoded, member);
    }
}
