use std::collections::{BTreeMap, HashSet};

use super::identity::{DeviceChainTrigger, IdentityStateMachine};
use super::{
    Assertion, Credential, CredentialError, CredentialId, CredentialOutcome, SpaceRole,
    StateChange,
};
use crate::crypto::PublicKey;

/// How the space was rooted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceGenesisKind {
    /// A shared data space rooted at a throwaway space key
    Space,
    /// A personal identity space rooted at the identity key
    Identity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub role: SpaceRole,
    pub revoked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmittedFeed {
    pub identity_key: PublicKey,
    pub device_key: PublicKey,
    pub revoked: bool,
}

/// Membership and feed admission for one space, derived by folding its
/// credentials in order
///
/// Every credential is checked against the state reached so far; nothing
/// is re-evaluated retroactively. Folding the same ordered credentials
/// always yields the same state.
#[derive(Debug)]
pub struct SpaceStateMachine {
    space_key: PublicKey,
    genesis: Option<SpaceGenesisKind>,
    members: BTreeMap<PublicKey, Member>,
    identities: BTreeMap<PublicKey, IdentityStateMachine>,
    feeds: BTreeMap<PublicKey, AdmittedFeed>,
    seen: HashSet<CredentialId>,
    local_device: Option<(PublicKey, DeviceChainTrigger)>,
}

impl SpaceStateMachine {
    pub fn new(space_key: PublicKey) -> Self {
        Self {
            space_key,
            genesis: None,
            members: BTreeMap::new(),
            identities: BTreeMap::new(),
            feeds: BTreeMap::new(),
            seen: HashSet::new(),
            local_device: None,
        }
    }

    /// Fire `trigger` when any member identity authorizes `device`
    pub fn with_local_device(mut self, device: PublicKey, trigger: DeviceChainTrigger) -> Self {
        self.local_device = Some((device, trigger));
        self
    }

    pub fn space_key(&self) -> PublicKey {
        self.space_key
    }

    pub fn genesis(&self) -> Option<SpaceGenesisKind> {
        self.genesis
    }

    pub fn members(&self) -> impl Iterator<Item = (&PublicKey, &Member)> {
        self.members.iter()
    }

    /// Role of an unrevoked member
    pub fn member_role(&self, identity: &PublicKey) -> Option<SpaceRole> {
        self.members
            .get(identity)
            .filter(|member| !member.revoked)
            .map(|member| member.role)
    }

    pub fn identity(&self, identity: &PublicKey) -> Option<&IdentityStateMachine> {
        self.identities.get(identity)
    }

    pub fn feed(&self, feed: &PublicKey) -> Option<&AdmittedFeed> {
        self.feeds.get(feed)
    }

    /// Every feed ever admitted, including revoked ones (their history still replicates)
    pub fn admitted_feeds(&self) -> Vec<PublicKey> {
        self.feeds.keys().copied().collect()
    }

    /// Whether `device` currently acts for an unrevoked member, through
    /// that identity's device chain
    pub fn is_device_admitted(&self, device: &PublicKey) -> bool {
        self.identities.iter().any(|(identity, machine)| {
            self.member_role(identity).is_some() && machine.is_device_authorized(device)
        })
    }

    /// Whether mutations from `feed` are currently accepted
    pub fn is_feed_writable(&self, feed: &PublicKey) -> bool {
        let Some(info) = self.feeds.get(feed).filter(|info| !info.revoked) else {
            return false;
        };
        let role_allows = matches!(
            self.member_role(&info.identity_key),
            Some(SpaceRole::Admin | SpaceRole::Editor)
        );
        let device_allowed = self
            .identities
            .get(&info.identity_key)
            .is_some_and(|identity| identity.is_device_authorized(&info.device_key));
        role_allows && device_allowed
    }

    pub fn process(&mut self, credential: &Credential) -> Result<CredentialOutcome, CredentialError> {
        let id = credential.id()?;
        if self.seen.contains(&id) {
            return Ok(CredentialOutcome::Duplicate);
        }

        let outcome = match &credential.assertion {
            Assertion::SpaceGenesis => self.process_space_genesis(credential)?,
            Assertion::IdentityGenesis if credential.subject == self.space_key => {
                self.process_identity_genesis(credential)?
            }
            _ if self.genesis.is_none() => return Err(CredentialError::NotInitialized),
            Assertion::SpaceMember { space_key, role } => {
                if *space_key != self.space_key {
                    return Ok(CredentialOutcome::Ignored);
                }
                self.authorize_admin(credential)?;
                let identity = credential.subject;
                self.members.insert(
                    identity,
                    Member {
                        role: *role,
                        revoked: false,
                    },
                );
                if !self.identities.contains_key(&identity) {
                    let machine = self.identity_machine(IdentityStateMachine::trusted(identity));
                    self.identities.insert(identity, machine);
                }
                CredentialOutcome::Applied(StateChange::MemberAdmitted {
                    identity_key: identity,
                    role: *role,
                })
            }
            Assertion::RevokeMember { space_key } => {
                if *space_key != self.space_key {
                    return Ok(CredentialOutcome::Ignored);
                }
                self.authorize_admin(credential)?;
                let member = self
                    .members
                    .get_mut(&credential.subject)
                    .ok_or_else(|| CredentialError::Unauthorized("not a member".into()))?;
                member.revoked = true;
                CredentialOutcome::Applied(StateChange::MemberRevoked(credential.subject))
            }
            Assertion::AdmittedFeed {
                space_key,
                identity_key,
                device_key,
            } => {
                if *space_key != self.space_key {
                    return Ok(CredentialOutcome::Ignored);
                }
                if credential.issuer != *identity_key {
                    return Err(CredentialError::Malformed(
                        "feed admission must be issued by the owning identity".into(),
                    ));
                }
                self.authorize_member(credential, identity_key)?;
                let device_ok = self
                    .identities
                    .get(identity_key)
                    .is_some_and(|identity| identity.is_device_authorized(device_key));
                if !device_ok {
                    return Err(CredentialError::Unauthorized(format!(
                        "device {} is not authorized for {}",
                        device_key.short(),
                        identity_key.short()
                    )));
                }
                self.feeds.insert(
                    credential.subject,
                    AdmittedFeed {
                        identity_key: *identity_key,
                        device_key: *device_key,
                        revoked: false,
                    },
                );
                CredentialOutcome::Applied(StateChange::FeedAdmitted {
                    feed_key: credential.subject,
                    identity_key: *identity_key,
                    device_key: *device_key,
                })
            }
            Assertion::RevokeFeed { space_key } => {
                if *space_key != self.space_key {
                    return Ok(CredentialOutcome::Ignored);
                }
                let owner = self
                    .feeds
                    .get(&credential.subject)
                    .map(|info| info.identity_key)
                    .ok_or_else(|| CredentialError::Unauthorized("feed not admitted".into()))?;
                if credential.issuer == owner {
                    self.authorize_member(credential, &owner)?;
                } else {
                    self.authorize_admin(credential)?;
                }
                if let Some(info) = self.feeds.get_mut(&credential.subject) {
                    info.revoked = true;
                }
                CredentialOutcome::Applied(StateChange::FeedRevoked(credential.subject))
            }
            Assertion::AuthorizedDevice { identity_key, .. }
            | Assertion::RevokeDevice { identity_key, .. } => {
                let identity = self.identities.get_mut(identity_key).ok_or_else(|| {
                    CredentialError::Unauthorized(format!(
                        "{} is not a member identity",
                        identity_key.short()
                    ))
                })?;
                identity.process(credential)?
            }
            Assertion::IdentityGenesis | Assertion::Unknown { .. } => CredentialOutcome::Ignored,
        };

        self.seen.insert(id);
        Ok(outcome)
    }

    fn identity_machine(&self, machine: IdentityStateMachine) -> IdentityStateMachine {
        match &self.local_device {
            Some((device, trigger)) => machine.with_local_device(*device, trigger.clone()),
            None => machine,
        }
    }

    fn process_space_genesis(&mut self, credential: &Credential) -> Result<CredentialOutcome, CredentialError> {
        if self.genesis.is_some() {
            return Err(CredentialError::AlreadyInitialized);
        }
        if credential.subject != self.space_key
            || credential.issuer != self.space_key
            || credential.proof.signer != self.space_key
        {
            return Err(CredentialError::Unauthorized(
                "space genesis must be self-signed by the space key".into(),
            ));
        }
        credential.verify_signature()?;
        self.genesis = Some(SpaceGenesisKind::Space);
        Ok(CredentialOutcome::Applied(StateChange::SpaceGenesis))
    }

    fn process_identity_genesis(
        &mut self,
        credential: &Credential,
    ) -> Result<CredentialOutcome, CredentialError> {
        if self.genesis.is_some() {
            return Err(CredentialError::AlreadyInitialized);
        }
        let mut identity = self.identity_machine(IdentityStateMachine::new(self.space_key));
        let outcome = identity.process(credential)?;
        self.genesis = Some(SpaceGenesisKind::Identity);
        self.members.insert(
            self.space_key,
            Member {
                role: SpaceRole::Admin,
                revoked: false,
            },
        );
        self.identities.insert(self.space_key, identity);
        Ok(outcome)
    }

    /// The credential must come from the space key itself or an admin member
    fn authorize_admin(&mut self, credential: &Credential) -> Result<(), CredentialError> {
        if credential.issuer == self.space_key && self.genesis == Some(SpaceGenesisKind::Space) {
            if credential.proof.signer != self.space_key {
                return Err(CredentialError::Unauthorized(
                    "space key credentials must be signed by the space key".into(),
                ));
            }
            return credential.verify_signature();
        }
        if self.member_role(&credential.issuer) != Some(SpaceRole::Admin) {
            return Err(CredentialError::Unauthorized(format!(
                "{} is not an admin of the space",
                credential.issuer.short()
            )));
        }
        let issuer = credential.issuer;
        self.authorize_member(credential, &issuer)
    }

    /// The credential must be signed by `identity` (or its device) and
    /// `identity` must be an unrevoked member
    fn authorize_member(&mut self, credential: &Credential, identity: &PublicKey) -> Result<(), CredentialError> {
        if self.member_role(identity).is_none() {
            return Err(CredentialError::Unauthorized(format!(
                "{} is not a member of the space",
                identity.short()
            )));
        }
        let machine = self
            .identities
            .get_mut(identity)
            .ok_or(CredentialError::NotInitialized)?;
        machine.authorize_signer(credential)
    }
}
