use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::{Invitation, InvitationError};
use crate::network::Port;

/// Progress of an invitation; states only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InvitationState {
    Init,
    /// Waiting on the swarm for the other side
    Connecting,
    Authenticating,
    Success,
    Error,
    Expired,
    Cancelled,
}

impl InvitationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvitationState::Success
                | InvitationState::Error
                | InvitationState::Expired
                | InvitationState::Cancelled
        )
    }
}

/// Shared completion of one invitation; the first outcome wins
pub(crate) struct Outcome<T> {
    state: watch::Sender<InvitationState>,
    result: Mutex<Option<oneshot::Sender<Result<T, InvitationError>>>>,
    done: CancellationToken,
}

impl<T> Outcome<T> {
    pub(crate) fn new() -> (Arc<Self>, oneshot::Receiver<Result<T, InvitationError>>) {
        let (tx, rx) = oneshot::channel();
        let outcome = Arc::new(Self {
            state: watch::channel(InvitationState::Init).0,
            result: Mutex::new(Some(tx)),
            done: CancellationToken::new(),
        });
        (outcome, rx)
    }

    pub(crate) fn advance(&self, state: InvitationState) {
        self.state.send_if_modified(|current| {
            if current.is_terminal() || state <= *current {
                return false;
            }
            tracing::debug!("invitation {:?} -> {:?}", current, state);
            *current = state;
            true
        });
    }

    pub(crate) fn finish(&self, result: Result<T, InvitationError>) {
        let Some(sender) = self.result.lock().take() else {
            return;
        };
        let state = match &result {
            Ok(_) => InvitationState::Success,
            Err(InvitationError::Expired) => InvitationState::Expired,
            Err(InvitationError::Cancelled) => InvitationState::Cancelled,
            Err(_) => InvitationState::Error,
        };
        if let Err(e) = &result {
            tracing::warn!("invitation failed: {}", e);
        }
        self.advance(state);
        let _ = sender.send(result);
        self.done.cancel();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }

    pub(crate) fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<InvitationState> {
        self.state.subscribe()
    }
}

/// Progress and result of one side of an invitation
///
/// `T` is what the side learns on success: the guest's
/// [`AdmissionRequest`](super::AdmissionRequest) for the host, the
/// [`AdmissionResponse`](super::AdmissionResponse) for the guest.
pub struct InvitationHandle<T> {
    invitation: Invitation,
    auth_code: Option<String>,
    state: watch::Receiver<InvitationState>,
    cancel: CancellationToken,
    result: tokio::sync::Mutex<Option<oneshot::Receiver<Result<T, InvitationError>>>>,
}

impl<T> std::fmt::Debug for InvitationHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvitationHandle")
            .field("invitation_id", &self.invitation.invitation_id)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl<T> InvitationHandle<T> {
    pub(crate) fn new(
        invitation: Invitation,
        auth_code: Option<String>,
        outcome: &Outcome<T>,
        cancel: CancellationToken,
        result: oneshot::Receiver<Result<T, InvitationError>>,
    ) -> Self {
        Self {
            invitation,
            auth_code,
            state: outcome.subscribe(),
            cancel,
            result: tokio::sync::Mutex::new(Some(result)),
        }
    }

    pub fn invitation(&self) -> &Invitation {
        &self.invitation
    }

    /// The invitation in its shareable form
    pub fn encoded(&self) -> Result<String, InvitationError> {
        Ok(self.invitation.encode()?)
    }

    /// Code to show the guest, for shared-secret invitations created here
    pub fn auth_code(&self) -> Option<&str> {
        self.auth_code.as_deref()
    }

    pub fn state(&self) -> InvitationState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<InvitationState> {
        self.state.clone()
    }

    /// Abort the invitation, leaving its swarm
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the invitation to finish
    ///
    /// # Errors
    /// * `InvitationError::AlreadyAwaited` - the result was taken by an earlier call
    pub async fn wait(&self) -> Result<T, InvitationError> {
        let receiver = self
            .result
            .lock()
            .await
            .take()
            .ok_or(InvitationError::AlreadyAwaited)?;
        receiver.await.map_err(|_| InvitationError::Cancelled)?
    }
}

/// Exchange helpers shared by host and guest
pub(crate) struct Channel {
    port: Arc<dyn Port>,
    inbound: flume::Receiver<Vec<u8>>,
    timeout: std::time::Duration,
}

impl Channel {
    pub(crate) fn new(port: Arc<dyn Port>, timeout: std::time::Duration) -> Self {
        Self {
            inbound: port.subscribe(),
            port,
            timeout,
        }
    }

    pub(crate) async fn send(&self, message: super::InvitationMessage) -> Result<(), InvitationError> {
        self.port.send(message.encode()?).await?;
        Ok(())
    }

    /// Next message, turning a remote `Error` into [`InvitationError::Rejected`]
    pub(crate) async fn recv(&self) -> Result<super::InvitationMessage, InvitationError> {
        let next = async {
            tokio::select! {
                biased;
                frame = self.inbound.recv_async() => frame.ok(),
                _ = self.port.closed() => None,
            }
        };
        let frame = tokio::time::timeout(self.timeout, next)
            .await
            .map_err(|_| InvitationError::Timeout)?
            .ok_or(InvitationError::Port(crate::network::PortError::Closed))?;
        match super::InvitationMessage::decode(&frame)? {
            super::InvitationMessage::Error { reason } => Err(InvitationError::Rejected(reason)),
            message => Ok(message),
        }
    }

    pub(crate) async fn fail(&self, reason: impl Into<String>) {
        let _ = self
            .send(super::InvitationMessage::Error {
                reason: reason.into(),
            })
            .await;
    }
}
