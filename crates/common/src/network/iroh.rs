use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::protocol::{AcceptError, ProtocolHandler, Router};
use iroh::{Endpoint, RelayMode};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::port::{ChannelPort, Port};
use super::{Incoming, NetworkError, Transport};
use crate::codec;
use crate::crypto::{PublicKey, SecretKey};

/// ALPN identifier for swarm connections
pub const ALPN: &[u8] = b"/strand/swarm/1";

/// Largest frame accepted from a remote
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// First frame on every stream, selecting the topic listener
#[derive(Debug, Serialize, Deserialize)]
struct Handshake {
    topic: PublicKey,
}

type Listeners = Arc<RwLock<HashMap<PublicKey, flume::Sender<Incoming>>>>;

/// [`Transport`] over QUIC connections of an iroh [`Endpoint`]
///
/// Each port is one bidirectional stream carrying `[u32 LE length][bytes]`
/// frames. The endpoint's node id is the peer's device key.
#[derive(Debug, Clone)]
pub struct IrohTransport {
    endpoint: Endpoint,
    router: Router,
    listeners: Listeners,
}

impl IrohTransport {
    /// Bind an endpoint for `secret` and start accepting swarm connections
    ///
    /// Relays are disabled; peers must be given each other's direct
    /// addresses (see [`IrohTransport::add_peer`]).
    pub async fn bind(secret: &SecretKey) -> Result<Self, NetworkError> {
        let endpoint = Endpoint::builder()
            .secret_key((**secret).clone())
            .relay_mode(RelayMode::Disabled)
            .bind()
            .await
            .map_err(|e| NetworkError::Transport(e.to_string()))?;
        let listeners: Listeners = Arc::default();
        let router = Router::builder(endpoint.clone())
            .accept(
                ALPN,
                SwarmHandler {
                    listeners: listeners.clone(),
                },
            )
            .spawn();
        tracing::info!("iroh transport bound as {}", secret.public().short());
        Ok(Self {
            endpoint,
            router,
            listeners,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Make `other`'s bound sockets known to this endpoint
    pub fn add_peer(&self, other: &IrohTransport) -> Result<(), NetworkError> {
        let addr = iroh::NodeAddr::from_parts(
            other.endpoint.node_id(),
            None,
            other.endpoint.bound_sockets(),
        );
        self.endpoint
            .add_node_addr_with_source(addr, "strand")
            .map_err(|e| NetworkError::Transport(e.to_string()))
    }

    pub async fn shutdown(&self) -> Result<(), NetworkError> {
        self.router
            .shutdown()
            .await
            .map_err(|e| NetworkError::Transport(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Transport for IrohTransport {
    fn local_key(&self) -> PublicKey {
        PublicKey::from(self.endpoint.node_id())
    }

    async fn connect(&self, remote: PublicKey, topic: PublicKey) -> Result<Arc<dyn Port>, NetworkError> {
        let conn = self
            .endpoint
            .connect(*remote, ALPN)
            .await
            .map_err(|e| {
                tracing::debug!("failed to connect to {}: {}", remote.short(), e);
                NetworkError::Unreachable(remote)
            })?;
        let (mut send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| NetworkError::Transport(e.to_string()))?;
        write_frame(&mut send, &codec::encode(&Handshake { topic })?).await?;
        Ok(Arc::new(stream_port(conn, send, recv)))
    }

    async fn listen(&self, topic: PublicKey) -> Result<flume::Receiver<Incoming>, NetworkError> {
        let mut listeners = self.listeners.write();
        if listeners
            .get(&topic)
            .is_some_and(|sender| !sender.is_disconnected())
        {
            return Err(NetworkError::AlreadyListening(topic));
        }
        let (tx, rx) = flume::unbounded();
        listeners.insert(topic, tx);
        Ok(rx)
    }

    async fn unlisten(&self, topic: PublicKey) {
        self.listeners.write().remove(&topic);
    }
}

#[derive(Debug, Clone)]
struct SwarmHandler {
    listeners: Listeners,
}

fn accept_error(e: impl std::fmt::Display) -> AcceptError {
    AcceptError::from(std::io::Error::other(e.to_string()))
}

impl ProtocolHandler for SwarmHandler {
    #[allow(refining_impl_trait)]
    fn accept(&self, conn: Connection) -> BoxFuture<'static, Result<(), AcceptError>> {
        let listeners = self.listeners.clone();
        Box::pin(async move {
            let remote = PublicKey::from(conn.remote_node_id().map_err(accept_error)?);
            let (send, mut recv) = conn.accept_bi().await.map_err(AcceptError::from)?;
            let handshake: Handshake = read_frame(&mut recv)
                .await
                .and_then(|bytes| Ok(codec::decode(&bytes)?))
                .map_err(|e| {
                    tracing::warn!("bad handshake from {}: {}", remote.short(), e);
                    accept_error(e)
                })?;

            let listener = listeners.read().get(&handshake.topic).cloned();
            let Some(listener) = listener else {
                tracing::debug!(
                    "{} dialed unknown topic {}",
                    remote.short(),
                    handshake.topic.short()
                );
                conn.close(1u32.into(), b"unknown topic");
                return Ok(());
            };

            let port = Arc::new(stream_port(conn, send, recv));
            if listener
                .send(Incoming {
                    remote,
                    port: port.clone(),
                })
                .is_err()
            {
                port.close();
            }
            port.closed().await;
            Ok(())
        })
    }
}

/// Pump a QUIC stream into a [`ChannelPort`] until either side closes
fn stream_port(conn: Connection, mut send: SendStream, mut recv: RecvStream) -> ChannelPort {
    let (outbound_tx, outbound_rx) = flume::unbounded::<Vec<u8>>();
    let (inbound_tx, inbound_rx) = flume::unbounded();
    let cancel = CancellationToken::new();

    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                message = outbound_rx.recv_async() => match message {
                    Ok(bytes) => {
                        if let Err(e) = write_frame(&mut send, &bytes).await {
                            tracing::debug!("stream write failed: {}", e);
                            break;
                        }
                    }
                    Err(_) => break,
                },
            }
        }
        let _ = send.finish();
        writer_cancel.cancel();
    });

    let reader_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = reader_cancel.cancelled() => break,
                frame = read_frame(&mut recv) => match frame {
                    Ok(bytes) => {
                        if inbound_tx.send(bytes).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("stream read ended: {}", e);
                        break;
                    }
                },
            }
        }
        reader_cancel.cancel();
        conn.close(0u32.into(), b"closed");
    });

    ChannelPort::from_parts(outbound_tx, inbound_rx, cancel)
}

async fn write_frame(send: &mut SendStream, bytes: &[u8]) -> Result<(), NetworkError> {
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_SIZE)
        .ok_or_else(|| NetworkError::Protocol(format!("frame of {} bytes", bytes.len())))?;
    send.write_all(&len.to_le_bytes())
        .await
        .map_err(|e| NetworkError::Transport(e.to_string()))?;
    send.write_all(bytes)
        .await
        .map_err(|e| NetworkError::Transport(e.to_string()))
}

async fn read_frame(recv: &mut RecvStream) -> Result<Vec<u8>, NetworkError> {
    let mut len = [0u8; 4];
    recv.read_exact(&mut len)
        .await
        .map_err(|e| NetworkError::Transport(e.to_string()))?;
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::Protocol(format!("frame of {} bytes", len)));
    }
    let mut bytes = vec![0u8; len];
    recv.read_exact(&mut bytes)
        .await
        .map_err(|e| NetworkError::Transport(e.to_string()))?;
    Ok(bytes)
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_loopback_port_over_quic() {
        let a_secret = SecretKey::generate();
        let b_secret = SecretKey::generate();
        let a = IrohTransport::bind(&a_secret).await.unwrap();
        let b = IrohTransport::bind(&b_secret).await.unwrap();
        a.add_peer(&b).unwrap();
        b.add_peer(&a).unwrap();

        let topic = SecretKey::generate().public();
        let incoming = b.listen(topic).await.unwrap();
        let port = a.connect(b_secret.public(), topic).await.unwrap();
        port.send(b"hello".to_vec()).await.unwrap();

        let accepted = tokio::time::timeout(Duration::from_secs(10), incoming.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(accepted.remote, a_secret.public());
        let received = tokio::time::timeout(Duration::from_secs(10), accepted.port.subscribe().recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"hello");

        accepted.port.send(b"back".to_vec()).await.unwrap();
        assert_eq!(port.subscribe().recv_async().await.unwrap(), b"back");

        port.close();
        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }
}
