use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::handle::{Channel, Outcome};
use super::{
    AdmissionHandler, AdmissionRequest, AuthMethod, AuthStatus, Invitation, InvitationConfig,
    InvitationError, InvitationHandle, InvitationKind, InvitationMessage, InvitationState,
    SecretValidator, StaticSecret,
};
use crate::crypto::{generate_passcode, PublicKey, SecretKey};
use crate::network::{NetworkError, NetworkManager, PeerSession, SwarmProtocol, Topology};

/// What the host is offering
#[derive(Debug, Clone, Copy)]
pub struct InvitationOffer {
    pub kind: InvitationKind,
    /// Required for [`InvitationKind::Space`]
    pub space_key: Option<PublicKey>,
    pub auth_method: AuthMethod,
}

/// Create an invitation and wait for a guest on its swarm
///
/// The handle resolves with the guest's request once `handler` has admitted
/// it. The swarm is left when the invitation reaches any terminal state.
///
/// # Errors
/// * `InvitationError::Protocol` - a space invitation without a space key
/// * `InvitationError::Network` - the swarm could not be joined
pub async fn create_invitation(
    network: &Arc<NetworkManager>,
    offer: InvitationOffer,
    handler: Arc<dyn AdmissionHandler>,
    config: &InvitationConfig,
) -> Result<InvitationHandle<AdmissionRequest>, InvitationError> {
    if offer.kind == InvitationKind::Space && offer.space_key.is_none() {
        return Err(InvitationError::Protocol(
            "space invitation without a space key".to_string(),
        ));
    }

    let host_key = network.local_key();
    let timeout = i64::try_from(config.timeout.as_millis()).unwrap_or(i64::MAX);
    let expires_at = chrono::Utc::now().timestamp_millis().saturating_add(timeout);
    let invitation = Invitation {
        invitation_id: Uuid::new_v4(),
        kind: offer.kind,
        swarm_key: SecretKey::generate().public(),
        auth_method: offer.auth_method,
        space_key: offer.space_key,
        host_key,
        expires_at: Some(expires_at),
    };
    let auth_code = match offer.auth_method {
        AuthMethod::SharedSecret => Some(generate_passcode(config.auth_code_length)),
        AuthMethod::None => None,
    };

    let (outcome, result) = Outcome::new();
    let protocol = HostProtocol {
        invitation: invitation.clone(),
        validator: auth_code.clone().map(StaticSecret::new),
        handler,
        outcome: outcome.clone(),
        attempts: AtomicUsize::new(0),
        used: AtomicBool::new(false),
        config: config.clone(),
    };
    network
        .join_swarm(
            invitation.swarm_key,
            Arc::new(protocol),
            Some(Topology::Star(host_key)),
        )
        .await?;
    outcome.advance(InvitationState::Connecting);
    tracing::info!(
        "invitation {} waiting on swarm {}",
        invitation.invitation_id,
        invitation.swarm_key.short()
    );

    let cancel = CancellationToken::new();
    supervise(network.clone(), &invitation, outcome.clone(), cancel.clone());
    Ok(InvitationHandle::new(
        invitation,
        auth_code,
        &outcome,
        cancel,
        result,
    ))
}

/// End the invitation on cancellation or expiry, and leave its swarm once it is over
pub(crate) fn supervise<T: Send + 'static>(
    network: Arc<NetworkManager>,
    invitation: &Invitation,
    outcome: Arc<Outcome<T>>,
    cancel: CancellationToken,
) {
    let swarm_key = invitation.swarm_key;
    let remaining = invitation.remaining();
    let done = outcome.done();
    tokio::spawn(async move {
        let expiry = async {
            match remaining {
                Some(remaining) => tokio::time::sleep(remaining).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = done.cancelled() => {}
            _ = cancel.cancelled() => outcome.finish(Err(InvitationError::Cancelled)),
            _ = expiry => outcome.finish(Err(InvitationError::Expired)),
        }
        network.leave_swarm(&swarm_key).await;
    });
}

struct HostProtocol {
    invitation: Invitation,
    validator: Option<StaticSecret>,
    handler: Arc<dyn AdmissionHandler>,
    outcome: Arc<Outcome<AdmissionRequest>>,
    /// Wrong codes across every session of this invitation
    attempts: AtomicUsize,
    used: AtomicBool,
    config: InvitationConfig,
}

#[async_trait]
impl SwarmProtocol for HostProtocol {
    async fn run(&self, session: PeerSession) -> Result<(), NetworkError> {
        if self.outcome.is_finished() {
            return Ok(());
        }
        let channel = Channel::new(session.port.clone(), self.config.handshake_timeout);
        match self.serve(&channel, &session).await {
            Ok(()) => Ok(()),
            Err(InvitationError::Network(e)) => Err(e),
            Err(e) => {
                channel.fail(e.to_string()).await;
                Err(NetworkError::Protocol(e.to_string()))
            }
        }
    }
}

impl HostProtocol {
    async fn serve(&self, channel: &Channel, session: &PeerSession) -> Result<(), InvitationError> {
        match channel.recv().await? {
            InvitationMessage::Introduce { invitation_id }
                if invitation_id == self.invitation.invitation_id => {}
            InvitationMessage::Introduce { .. } => return Err(InvitationError::UnknownInvitation),
            other => return Err(unexpected("Introduce", &other)),
        }
        if self.invitation.is_expired() {
            return Err(InvitationError::Expired);
        }
        tracing::debug!(
            "guest {} introduced for invitation {}",
            session.remote.short(),
            self.invitation.invitation_id
        );
        self.outcome.advance(InvitationState::Authenticating);
        channel
            .send(InvitationMessage::IntroduceReply {
                auth_method: self.invitation.auth_method,
            })
            .await?;

        if let Some(validator) = &self.validator {
            let code = match channel.recv().await? {
                InvitationMessage::Authenticate { code } => code,
                other => return Err(unexpected("Authenticate", &other)),
            };
            if !validator.validate(&code) {
                let attempts = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::warn!(
                    "invalid code from {} ({}/{})",
                    session.remote.short(),
                    attempts,
                    self.config.max_auth_attempts
                );
                let status = if attempts >= self.config.max_auth_attempts {
                    AuthStatus::TooManyAttempts
                } else {
                    AuthStatus::InvalidCode
                };
                channel
                    .send(InvitationMessage::AuthenticateReply { status })
                    .await?;
                if status == AuthStatus::TooManyAttempts {
                    self.outcome.finish(Err(InvitationError::TooManyAttempts));
                }
                return Ok(());
            }
            channel
                .send(InvitationMessage::AuthenticateReply {
                    status: AuthStatus::Ok,
                })
                .await?;
        }

        let request = match channel.recv().await? {
            InvitationMessage::Admit(request) => request,
            other => return Err(unexpected("Admit", &other)),
        };
        let kind = match request {
            AdmissionRequest::Space { .. } => InvitationKind::Space,
            AdmissionRequest::Device { .. } => InvitationKind::Device,
        };
        if kind != self.invitation.kind {
            return Err(InvitationError::Protocol(format!(
                "{:?} request on a {:?} invitation",
                kind, self.invitation.kind
            )));
        }
        if self.used.swap(true, Ordering::SeqCst) {
            return Err(InvitationError::AlreadyUsed);
        }

        match self.handler.admit(request.clone()).await {
            Ok(response) => {
                channel.send(InvitationMessage::AdmitReply(response)).await?;
                // the guest hangs up once it has the reply
                let _ = tokio::time::timeout(self.config.handshake_timeout, session.port.closed())
                    .await;
                tracing::info!(
                    "invitation {} redeemed by {}",
                    self.invitation.invitation_id,
                    session.remote.short()
                );
                self.outcome.finish(Ok(request));
                Ok(())
            }
            Err(e) => {
                channel.fail(e.to_string()).await;
                self.outcome.finish(Err(InvitationError::Rejected(e.to_string())));
                Ok(())
            }
        }
    }
}

pub(crate) fn unexpected(expected: &str, got: &InvitationMessage) -> InvitationError {
    InvitationError::Protocol(format!("expected {}, got {:?}", expected, got))
}
