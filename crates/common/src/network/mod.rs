//! Peer discovery and transport
//!
//! - **Port**: a bidirectional message channel to one remote peer.
//! - **Transport**: opens ports to peers and accepts incoming ones, per topic.
//! - **Signaling**: tells peers on the same topic about each other.
//! - **Swarm**: joins a topic, connects according to a [`Topology`] and runs
//!   a [`SwarmProtocol`] over every connection, reconnecting with backoff.
//!
//! Two backends ship with the crate: an in-process [`MemoryNetwork`] with
//! fault injection, and [`IrohTransport`] over QUIC.

mod connection;
mod iroh;
mod memory;
mod port;
mod swarm;
mod topology;

pub use self::iroh::{IrohTransport, ALPN};
pub use connection::{ConnectionInfo, ConnectionState};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use port::{ChannelPort, Port, PortError};
pub use swarm::{NetworkManager, PeerSession, Swarm, SwarmConfig, SwarmProtocol, SwarmState};
pub use topology::Topology;

use std::sync::Arc;

use async_trait::async_trait;

use crate::codec::CodecError;
use crate::crypto::PublicKey;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// The signaling service cannot be reached; local work continues
    #[error("signaling unavailable")]
    SignalingUnavailable,
    #[error("peer {0} is unreachable")]
    Unreachable(PublicKey),
    #[error("already joined swarm {0}")]
    AlreadyJoined(PublicKey),
    #[error("already listening on topic {0}")]
    AlreadyListening(PublicKey),
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The remote failed authentication or is not allowed on the topic
    #[error("unauthorized peer: {0}")]
    Unauthorized(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out: {0}")]
    Timeout(&'static str),
    #[error("network closed")]
    Closed,
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A connection accepted on a listened topic
#[derive(Debug, Clone)]
pub struct Incoming {
    pub remote: PublicKey,
    pub port: Arc<dyn Port>,
}

/// Discovery notifications for one topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    PeerJoined(PublicKey),
    PeerLeft(PublicKey),
}

/// Rendezvous service that introduces peers sharing a topic
#[async_trait]
pub trait SignalingService: Send + Sync + std::fmt::Debug {
    /// Announce `peer` on `topic`
    ///
    /// The returned channel first reports every peer already on the topic,
    /// then joins and leaves as they happen. It closes if the service
    /// drops the registration.
    async fn join(
        &self,
        topic: PublicKey,
        peer: PublicKey,
    ) -> Result<flume::Receiver<SignalEvent>, NetworkError>;

    async fn leave(&self, topic: PublicKey, peer: PublicKey) -> Result<(), NetworkError>;
}

/// Opens and accepts ports, multiplexed by topic
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Key other peers reach this transport at
    fn local_key(&self) -> PublicKey;

    async fn connect(&self, remote: PublicKey, topic: PublicKey) -> Result<Arc<dyn Port>, NetworkError>;

    /// Start accepting connections for `topic`
    async fn listen(&self, topic: PublicKey) -> Result<flume::Receiver<Incoming>, NetworkError>;

    async fn unlisten(&self, topic: PublicKey);
}
