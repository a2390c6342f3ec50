use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::port::{ChannelPort, Port};
use super::{Incoming, NetworkError, SignalEvent, SignalingService, Transport};
use crate::crypto::PublicKey;

/// In-process signaling and transport shared by many peers
///
/// Peers get a transport through [`MemoryNetwork::transport`]; the network
/// itself is the signaling service. Links can be cut or blocked and
/// signaling switched off to exercise failure handling.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

#[derive(Debug)]
struct NetworkState {
    signaling_available: bool,
    topics: HashMap<PublicKey, BTreeMap<PublicKey, flume::Sender<SignalEvent>>>,
    listeners: HashMap<(PublicKey, PublicKey), flume::Sender<Incoming>>,
    blocked: HashSet<(PublicKey, PublicKey)>,
    links: Vec<Link>,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            signaling_available: true,
            topics: HashMap::new(),
            listeners: HashMap::new(),
            blocked: HashSet::new(),
            links: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct Link {
    pair: (PublicKey, PublicKey),
    port: ChannelPort,
}

fn pair(a: PublicKey, b: PublicKey) -> (PublicKey, PublicKey) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for the peer identified by `local`
    pub fn transport(&self, local: PublicKey) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local,
        }
    }

    /// Switch signaling on or off
    ///
    /// Turning it off drops every registration, so joined swarms see their
    /// signal channel close and must re-join.
    pub fn set_signaling_available(&self, available: bool) {
        let mut state = self.state.lock();
        state.signaling_available = available;
        if !available {
            state.topics.clear();
        }
        tracing::debug!("memory signaling available: {}", available);
    }

    /// Close every open link between `a` and `b`; they may reconnect
    pub fn disconnect(&self, a: PublicKey, b: PublicKey) {
        let key = pair(a, b);
        let mut state = self.state.lock();
        state.links.retain(|link| {
            if link.pair == key {
                link.port.close();
                false
            } else {
                true
            }
        });
    }

    /// Cut `a` and `b` apart until [`MemoryNetwork::unblock`]
    pub fn block(&self, a: PublicKey, b: PublicKey) {
        self.state.lock().blocked.insert(pair(a, b));
        self.disconnect(a, b);
    }

    pub fn unblock(&self, a: PublicKey, b: PublicKey) {
        self.state.lock().blocked.remove(&pair(a, b));
    }

    /// Number of live links between `a` and `b`
    pub fn link_count(&self, a: PublicKey, b: PublicKey) -> usize {
        let key = pair(a, b);
        let mut state = self.state.lock();
        state.links.retain(|link| !link.port.is_closed());
        state.links.iter().filter(|link| link.pair == key).count()
    }
}

#[async_trait]
impl SignalingService for MemoryNetwork {
    async fn join(
        &self,
        topic: PublicKey,
        peer: PublicKey,
    ) -> Result<flume::Receiver<SignalEvent>, NetworkError> {
        let mut state = self.state.lock();
        if !state.signaling_available {
            return Err(NetworkError::SignalingUnavailable);
        }
        let (tx, rx) = flume::unbounded();
        let members = state.topics.entry(topic).or_default();
        members.retain(|other, sender| {
            if *other == peer {
                return false;
            }
            let _ = tx.send(SignalEvent::PeerJoined(*other));
            sender.send(SignalEvent::PeerJoined(peer)).is_ok()
        });
        members.insert(peer, tx);
        tracing::trace!("{} joined topic {}", peer.short(), topic.short());
        Ok(rx)
    }

    async fn leave(&self, topic: PublicKey, peer: PublicKey) -> Result<(), NetworkError> {
        let mut state = self.state.lock();
        if let Some(members) = state.topics.get_mut(&topic) {
            members.remove(&peer);
            members.retain(|_, sender| sender.send(SignalEvent::PeerLeft(peer)).is_ok());
            if members.is_empty() {
                state.topics.remove(&topic);
            }
        }
        Ok(())
    }
}

/// One peer's view of a [`MemoryNetwork`]
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: PublicKey,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_key(&self) -> PublicKey {
        self.local
    }

    async fn connect(&self, remote: PublicKey, topic: PublicKey) -> Result<Arc<dyn Port>, NetworkError> {
        let key = pair(self.local, remote);
        let mut state = self.network.state.lock();
        if state.blocked.contains(&key) {
            return Err(NetworkError::Unreachable(remote));
        }
        let listener = state
            .listeners
            .get(&(remote, topic))
            .cloned()
            .ok_or(NetworkError::Unreachable(remote))?;

        let (local_end, remote_end) = ChannelPort::pair();
        listener
            .send(Incoming {
                remote: self.local,
                port: Arc::new(remote_end),
            })
            .map_err(|_| NetworkError::Unreachable(remote))?;
        state.links.push(Link {
            pair: key,
            port: local_end.clone(),
        });
        Ok(Arc::new(local_end))
    }

    async fn listen(&self, topic: PublicKey) -> Result<flume::Receiver<Incoming>, NetworkError> {
        let mut state = self.network.state.lock();
        let slot = (self.local, topic);
        if state
            .listeners
            .get(&slot)
            .is_some_and(|sender| !sender.is_disconnected())
        {
            return Err(NetworkError::AlreadyListening(topic));
        }
        let (tx, rx) = flume::unbounded();
        state.listeners.insert(slot, tx);
        Ok(rx)
    }

    async fn unlisten(&self, topic: PublicKey) {
        self.network.state.lock().listeners.remove(&(self.local, topic));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::SecretKey;

    #[tokio::test]
    async fn test_signaling_reports_existing_and_new_peers() {
        let network = MemoryNetwork::new();
        let topic = SecretKey::generate().public();
        let a = SecretKey::generate().public();
        let b = SecretKey::generate().public();

        let a_events = network.join(topic, a).await.unwrap();
        let b_events = network.join(topic, b).await.unwrap();
        assert_eq!(b_events.recv_async().await.unwrap(), SignalEvent::PeerJoined(a));
        assert_eq!(a_events.recv_async().await.unwrap(), SignalEvent::PeerJoined(b));

        network.leave(topic, b).await.unwrap();
        assert_eq!(a_events.recv_async().await.unwrap(), SignalEvent::PeerLeft(b));

        network.set_signaling_available(false);
        assert!(matches!(
            network.join(topic, b).await,
            Err(NetworkError::SignalingUnavailable)
        ));
        // registrations were dropped with the service
        assert!(a_events.recv_async().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_and_block() {
        let network = MemoryNetwork::new();
        let topic = SecretKey::generate().public();
        let a = SecretKey::generate().public();
        let b = SecretKey::generate().public();
        let a_transport = network.transport(a);
        let b_transport = network.transport(b);

        assert!(matches!(
            a_transport.connect(b, topic).await,
            Err(NetworkError::Unreachable(_))
        ));
        let incoming = b_transport.listen(topic).await.unwrap();
        let port = a_transport.connect(b, topic).await.unwrap();
        let accepted = incoming.recv_async().await.unwrap();
        assert_eq!(accepted.remote, a);

        port.send(b"ping".to_vec()).await.unwrap();
        assert_eq!(accepted.port.subscribe().recv_async().await.unwrap(), b"ping");
        assert_eq!(network.link_count(a, b), 1);

        network.block(b, a);
        accepted.port.closed().await;
        assert!(port.is_closed());
        assert!(matches!(
            a_transport.connect(b, topic).await,
            Err(NetworkError::Unreachable(_))
        ));

        network.unblock(a, b);
        a_transport.connect(b, topic).await.unwrap();
    }
}
