use std::collections::HashMap;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::broadcast::error::RecvError;

use super::messages::{challenge_digest, ReplicationMessage, CHALLENGE_SIZE};
use crate::credentials::StateChange;
use crate::crypto::PublicKey;
use crate::feed::{FeedMessage, FeedReplication, ReplicationConfig};
use crate::network::{NetworkError, PeerSession, Port, SwarmProtocol};
use crate::space::{Space, SpaceError, SpaceEvent};

/// Replicates every feed of one space with each peer of its swarm
///
/// Both sides first sign the other's challenge with their device key.
/// Feeds are only exchanged with a remote the space's credentials admit,
/// and a connection is dropped as soon as a revocation removes the remote.
#[derive(Debug, Clone)]
pub struct ReplicationProtocol {
    space: Space,
    config: ReplicationConfig,
}

impl ReplicationProtocol {
    pub fn new(space: Space, config: ReplicationConfig) -> Self {
        Self { space, config }
    }
}

#[async_trait]
impl SwarmProtocol for ReplicationProtocol {
    async fn run(&self, session: PeerSession) -> Result<(), NetworkError> {
        let mut connection = Connection {
            space: self.space.clone(),
            config: self.config.clone(),
            remote: session.remote,
            port: session.port.clone(),
            nonce: [0; CHALLENGE_SIZE],
            authenticated: false,
            sessions: HashMap::new(),
            outbound: flume::unbounded(),
        };
        connection.run().await
    }
}

struct Connection {
    space: Space,
    config: ReplicationConfig,
    remote: PublicKey,
    port: std::sync::Arc<dyn Port>,
    /// Challenge sent to the remote
    nonce: [u8; CHALLENGE_SIZE],
    authenticated: bool,
    sessions: HashMap<PublicKey, FeedReplication>,
    /// Messages from every feed session, tagged with their feed
    outbound: (
        flume::Sender<(PublicKey, FeedMessage)>,
        flume::Receiver<(PublicKey, FeedMessage)>,
    ),
}

impl Connection {
    async fn run(&mut self) -> Result<(), NetworkError> {
        let inbound = self.port.subscribe();
        let outbound = self.outbound.1.clone();
        let mut events = self.space.subscribe();

        rand::rng().fill(&mut self.nonce);
        self.send(&ReplicationMessage::Challenge { nonce: self.nonce })
            .await?;

        loop {
            tokio::select! {
                // revocations are acted on before anything else leaves
                biased;
                event = events.recv() => match event {
                    Ok(SpaceEvent::StateChanged(StateChange::FeedAdmitted { feed_key, .. })) => {
                        if self.authenticated {
                            self.open(feed_key, true);
                        }
                    }
                    Ok(SpaceEvent::StateChanged(
                        StateChange::MemberRevoked(_)
                        | StateChange::DeviceRevoked { .. }
                        | StateChange::FeedRevoked(_),
                    ))
                    | Ok(SpaceEvent::Rebuilt) => self.recheck().await?,
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        tracing::debug!("replication missed {} space events, rescanning feeds", missed);
                        self.recheck().await?;
                        if self.authenticated {
                            for feed_key in self.space.feeds() {
                                self.open(feed_key, true);
                            }
                        }
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
                frame = inbound.recv_async() => {
                    let Ok(frame) = frame else {
                        return Ok(());
                    };
                    let message = match ReplicationMessage::decode(&frame) {
                        Ok(message) => message,
                        Err(e) => {
                            tracing::warn!("undecodable frame from {}: {}", self.remote.short(), e);
                            continue;
                        }
                    };
                    if self.handle(message).await? {
                        return Ok(());
                    }
                }
                Ok((feed, message)) = outbound.recv_async() => {
                    self.send(&ReplicationMessage::Feed { feed, message }).await?;
                }
            }
        }
    }

    /// Returns true once the connection should end
    async fn handle(&mut self, message: ReplicationMessage) -> Result<bool, NetworkError> {
        match message {
            ReplicationMessage::Challenge { nonce } => {
                let digest = challenge_digest(&self.space.key(), &nonce);
                let signature = self.space.sign_as_device(&digest).map_err(space_error)?;
                self.send(&ReplicationMessage::Authenticate { signature })
                    .await?;
            }
            ReplicationMessage::Authenticate { signature } => {
                if self.authenticated {
                    return Ok(false);
                }
                let digest = challenge_digest(&self.space.key(), &self.nonce);
                if self.remote.verify(&digest, &signature).is_err() {
                    return self
                        .refuse(format!("{} failed the challenge", self.remote.short()))
                        .await;
                }
                if !self.admitted().await? {
                    return self
                        .refuse(format!(
                            "{} is not admitted to space {}",
                            self.remote.short(),
                            self.space.key().short()
                        ))
                        .await;
                }
                self.authenticated = true;
                tracing::debug!(
                    "authenticated {} for space {}",
                    self.remote.short(),
                    self.space.key().short()
                );
                self.send(&ReplicationMessage::Hello {
                    space_key: self.space.key(),
                    feeds: self.space.feeds(),
                })
                .await?;
            }
            ReplicationMessage::Hello { .. } | ReplicationMessage::Feed { .. } if !self.authenticated => {
                return self
                    .refuse(format!("{} replicated before authenticating", self.remote.short()))
                    .await;
            }
            ReplicationMessage::Hello { space_key, feeds } => {
                if space_key != self.space.key() {
                    let reason = format!("not replicating space {}", space_key.short());
                    self.send(&ReplicationMessage::Error { reason: reason.clone() })
                        .await?;
                    return Err(NetworkError::Protocol(reason));
                }
                tracing::debug!(
                    "{} holds {} feeds of space {}",
                    self.remote.short(),
                    feeds.len(),
                    space_key.short()
                );
                for feed_key in feeds {
                    self.open(feed_key, true);
                }
            }
            ReplicationMessage::Feed { feed, message } => {
                if !self.sessions.contains_key(&feed) {
                    self.open(feed, false);
                }
                match self.sessions.get(&feed) {
                    Some(session) => {
                        if session.send(message).is_err() {
                            self.sessions.remove(&feed);
                        }
                    }
                    None => tracing::trace!(
                        "ignoring feed {} not held for space {}",
                        feed.short(),
                        self.space.key().short()
                    ),
                }
            }
            ReplicationMessage::Error { reason } => {
                tracing::warn!("{} closed replication: {}", self.remote.short(), reason);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn admitted(&self) -> Result<bool, NetworkError> {
        self.space
            .admits_peer(self.remote)
            .await
            .map_err(space_error)
    }

    /// Drop an authenticated remote the credentials no longer admit
    async fn recheck(&mut self) -> Result<(), NetworkError> {
        if self.authenticated && !self.admitted().await? {
            self.sessions.clear();
            self.refuse(format!(
                "{} was revoked from space {}",
                self.remote.short(),
                self.space.key().short()
            ))
            .await?;
        }
        Ok(())
    }

    /// Tell the remote why it is refused and end the connection
    async fn refuse(&mut self, reason: String) -> Result<bool, NetworkError> {
        tracing::info!("refusing replication: {}", reason);
        self.send(&ReplicationMessage::Error { reason: reason.clone() })
            .await?;
        Err(NetworkError::Unauthorized(reason))
    }

    /// Start a session for `feed_key` if the space holds it
    ///
    /// Sessions opened proactively advertise first; ones opened in response
    /// to a remote message answer it.
    fn open(&mut self, feed_key: PublicKey, advertise: bool) {
        if self.sessions.contains_key(&feed_key) {
            return;
        }
        let Some(feed) = self.space.feed(&feed_key) else {
            return;
        };
        let session = feed.replicate(advertise, self.config.clone());
        let messages = session.outbound();
        let outbound = self.outbound.0.clone();
        tokio::spawn(async move {
            while let Ok(message) = messages.recv_async().await {
                if outbound.send((feed_key, message)).is_err() {
                    break;
                }
            }
        });
        tracing::trace!("replicating feed {} with {}", feed_key.short(), self.remote.short());
        self.sessions.insert(feed_key, session);
    }

    async fn send(&self, message: &ReplicationMessage) -> Result<(), NetworkError> {
        self.port.send(message.encode()?).await?;
        Ok(())
    }
}

fn space_error(e: SpaceError) -> NetworkError {
    match e {
        SpaceError::Closed => NetworkError::Closed,
        e => NetworkError::Protocol(e.to_string()),
    }
}
