use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::handle::{Channel, Outcome};
use super::host::{supervise, unexpected};
use super::{
    AdmissionRequest, AdmissionResponse, AuthMethod, AuthStatus, Invitation, InvitationConfig,
    InvitationError, InvitationHandle, InvitationKind, InvitationMessage, InvitationState,
    SecretProvider,
};
use crate::network::{NetworkError, NetworkManager, PeerSession, SwarmProtocol, Topology};

/// Redeem `invitation`, asking the host to admit `request`
///
/// The handshake runs once; a wrong code or a rejected request ends the
/// invitation and the host has to issue a new one.
///
/// # Errors
/// * `InvitationError::Expired` - the invitation expired before it was accepted
/// * `InvitationError::Network` - the swarm could not be joined
pub async fn accept_invitation(
    network: &Arc<NetworkManager>,
    invitation: Invitation,
    secret: Arc<dyn SecretProvider>,
    request: AdmissionRequest,
    config: &InvitationConfig,
) -> Result<InvitationHandle<AdmissionResponse>, InvitationError> {
    if invitation.is_expired() {
        return Err(InvitationError::Expired);
    }

    let (outcome, result) = Outcome::new();
    let protocol = GuestProtocol {
        invitation: invitation.clone(),
        secret,
        request,
        outcome: outcome.clone(),
        started: AtomicBool::new(false),
        config: config.clone(),
    };
    network
        .join_swarm(
            invitation.swarm_key,
            Arc::new(protocol),
            Some(Topology::Star(invitation.host_key)),
        )
        .await?;
    outcome.advance(InvitationState::Connecting);

    let cancel = CancellationToken::new();
    supervise(network.clone(), &invitation, outcome.clone(), cancel.clone());
    Ok(InvitationHandle::new(invitation, None, &outcome, cancel, result))
}

struct GuestProtocol {
    invitation: Invitation,
    secret: Arc<dyn SecretProvider>,
    request: AdmissionRequest,
    outcome: Arc<Outcome<AdmissionResponse>>,
    started: AtomicBool,
    config: InvitationConfig,
}

#[async_trait]
impl SwarmProtocol for GuestProtocol {
    async fn run(&self, session: PeerSession) -> Result<(), NetworkError> {
        if session.remote != self.invitation.host_key {
            return Ok(());
        }
        // one handshake per invitation, redials after it are idle
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.outcome.advance(InvitationState::Authenticating);
        let channel = Channel::new(session.port.clone(), self.config.handshake_timeout);
        let result = self.handshake(&channel).await;
        if let Err(e) = &result {
            if !matches!(e, InvitationError::Rejected(_)) {
                channel.fail(e.to_string()).await;
            }
        }
        self.outcome.finish(result);
        Ok(())
    }
}

impl GuestProtocol {
    async fn handshake(&self, channel: &Channel) -> Result<AdmissionResponse, InvitationError> {
        channel
            .send(InvitationMessage::Introduce {
                invitation_id: self.invitation.invitation_id,
            })
            .await?;
        let auth_method = match channel.recv().await? {
            InvitationMessage::IntroduceReply { auth_method } => auth_method,
            other => return Err(unexpected("IntroduceReply", &other)),
        };

        if auth_method == AuthMethod::SharedSecret {
            let code = self.secret.secret().await?;
            channel
                .send(InvitationMessage::Authenticate { code })
                .await?;
            match channel.recv().await? {
                InvitationMessage::AuthenticateReply {
                    status: AuthStatus::Ok,
                } => {}
                InvitationMessage::AuthenticateReply {
                    status: AuthStatus::InvalidCode,
                } => return Err(InvitationError::InvalidCode),
                InvitationMessage::AuthenticateReply {
                    status: AuthStatus::TooManyAttempts,
                } => return Err(InvitationError::TooManyAttempts),
                other => return Err(unexpected("AuthenticateReply", &other)),
            }
        }

        channel
            .send(InvitationMessage::Admit(self.request.clone()))
            .await?;
        let response = match channel.recv().await? {
            InvitationMessage::AdmitReply(response) => response,
            other => return Err(unexpected("AdmitReply", &other)),
        };
        if self.invitation.kind == InvitationKind::Space
            && Some(response.space_key) != self.invitation.space_key
        {
            return Err(InvitationError::Protocol(format!(
                "admitted to space {} instead of the invited one",
                response.space_key.short()
            )));
        }
        tracing::info!(
            "invitation {} accepted, space {}",
            self.invitation.invitation_id,
            response.space_key.short()
        );
        Ok(response)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::crypto::{PublicKey, SecretKey};
    use crate::invitation::{create_invitation, AdmissionHandler, InvitationOffer, StaticSecret};
    use crate::network::{MemoryNetwork, SwarmConfig};

    /// Records requests and answers with a fixed space
    struct Recorder {
        space_key: PublicKey,
        requests: Mutex<Vec<AdmissionRequest>>,
    }

    #[async_trait]
    impl AdmissionHandler for Recorder {
        async fn admit(
            &self,
            request: AdmissionRequest,
        ) -> Result<AdmissionResponse, InvitationError> {
            self.requests.lock().push(request);
            Ok(AdmissionResponse {
                space_key: self.space_key,
                genesis_feed: self.space_key,
                identity_key: self.space_key,
            })
        }
    }

    fn manager(network: &MemoryNetwork) -> Arc<NetworkManager> {
        let key = SecretKey::generate().public();
        Arc::new(NetworkManager::new(
            Arc::new(network.clone()),
            Arc::new(network.transport(key)),
            SwarmConfig {
                reconnect_min_delay: Duration::from_millis(10),
                reconnect_max_delay: Duration::from_millis(100),
                ..Default::default()
            },
        ))
    }

    fn config() -> InvitationConfig {
        InvitationConfig {
            handshake_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn device_request() -> AdmissionRequest {
        AdmissionRequest::Device {
            device_key: SecretKey::generate().public(),
            feed_key: SecretKey::generate().public(),
        }
    }

    async fn host(
        network: &Arc<NetworkManager>,
        config: &InvitationConfig,
    ) -> (InvitationHandle<AdmissionRequest>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder {
            space_key: SecretKey::generate().public(),
            requests: Mutex::new(Vec::new()),
        });
        let offer = InvitationOffer {
            kind: InvitationKind::Device,
            space_key: None,
            auth_method: AuthMethod::SharedSecret,
        };
        let handle = create_invitation(network, offer, recorder.clone(), config)
            .await
            .unwrap();
        (handle, recorder)
    }

    async fn within<T>(future: impl std::future::Future<Output = T>) -> T {
        tokio::time::timeout(Duration::from_secs(10), future)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_guest_admitted_with_right_code() {
        let network = MemoryNetwork::new();
        let (host_net, guest_net) = (manager(&network), manager(&network));
        let (hosted, recorder) = host(&host_net, &config()).await;
        assert_eq!(hosted.state(), InvitationState::Connecting);

        let encoded = hosted.encoded().unwrap();
        let invitation = Invitation::decode(&encoded).unwrap();
        let code = hosted.auth_code().unwrap().to_string();
        let request = device_request();
        let accepted = accept_invitation(
            &guest_net,
            invitation,
            Arc::new(StaticSecret::new(code)),
            request.clone(),
            &config(),
        )
        .await
        .unwrap();

        let response = within(accepted.wait()).await.unwrap();
        assert_eq!(response.space_key, recorder.space_key);
        assert_eq!(within(hosted.wait()).await.unwrap(), request);
        assert_eq!(accepted.state(), InvitationState::Success);
        assert_eq!(hosted.state(), InvitationState::Success);
        assert_eq!(recorder.requests.lock().len(), 1);
        assert!(matches!(
            hosted.wait().await,
            Err(InvitationError::AlreadyAwaited)
        ));

        // both sides leave the ephemeral swarm
        let swarm_key = hosted.invitation().swarm_key;
        within(async {
            while host_net.swarm(&swarm_key).await.is_some()
                || guest_net.swarm(&swarm_key).await.is_some()
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
    }

    #[tokio::test]
    async fn test_wrong_code_fails_without_retry() {
        let network = MemoryNetwork::new();
        let (host_net, guest_net) = (manager(&network), manager(&network));
        let config = InvitationConfig {
            max_auth_attempts: 1,
            ..config()
        };
        let (hosted, recorder) = host(&host_net, &config).await;
        let accepted = accept_invitation(
            &guest_net,
            hosted.invitation().clone(),
            Arc::new(StaticSecret::new("not the code")),
            device_request(),
            &config,
        )
        .await
        .unwrap();

        assert!(matches!(
            within(accepted.wait()).await,
            Err(InvitationError::TooManyAttempts)
        ));
        assert!(matches!(
            within(hosted.wait()).await,
            Err(InvitationError::TooManyAttempts)
        ));
        assert_eq!(accepted.state(), InvitationState::Error);
        assert_eq!(hosted.state(), InvitationState::Error);
        assert!(recorder.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_code_leaves_host_waiting() {
        let network = MemoryNetwork::new();
        let (host_net, guest_net) = (manager(&network), manager(&network));
        let (hosted, _recorder) = host(&host_net, &config()).await;
        let accepted = accept_invitation(
            &guest_net,
            hosted.invitation().clone(),
            Arc::new(StaticSecret::new("000")),
            device_request(),
            &config(),
        )
        .await
        .unwrap();

        assert!(matches!(
            within(accepted.wait()).await,
            Err(InvitationError::InvalidCode)
        ));
        assert!(!hosted.state().is_terminal());
        hosted.cancel();
        assert!(matches!(
            within(hosted.wait()).await,
            Err(InvitationError::Cancelled)
        ));
        assert_eq!(hosted.state(), InvitationState::Cancelled);
    }

    #[tokio::test]
    async fn test_invitation_expires() {
        let network = MemoryNetwork::new();
        let host_net = manager(&network);
        let config = InvitationConfig {
            timeout: Duration::from_millis(50),
            ..config()
        };
        let (hosted, _recorder) = host(&host_net, &config).await;
        assert!(matches!(
            within(hosted.wait()).await,
            Err(InvitationError::Expired)
        ));
        assert_eq!(hosted.state(), InvitationState::Expired);

        let guest_net = manager(&network);
        assert!(matches!(
            accept_invitation(
                &guest_net,
                hosted.invitation().clone(),
                Arc::new(StaticSecret::new("")),
                device_request(),
                &config,
            )
            .await,
            Err(InvitationError::Expired)
        ));
    }
}
