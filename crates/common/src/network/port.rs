use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PortError {
    #[error("port closed")]
    Closed,
}

/// Bidirectional message channel to a single remote peer
///
/// Messages are opaque byte buffers delivered in order. Either side may
/// close the port; both sides then observe [`Port::closed`].
#[async_trait]
pub trait Port: Send + Sync + std::fmt::Debug {
    async fn send(&self, message: Vec<u8>) -> Result<(), PortError>;

    /// Receiving end for messages from the remote
    ///
    /// Every handle returned shares one queue; a message is delivered to
    /// exactly one of them.
    fn subscribe(&self) -> flume::Receiver<Vec<u8>>;

    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Resolves once either side closed the port
    async fn closed(&self);
}

/// [`Port`] backed by a pair of flume channels
///
/// Both in-process links and QUIC streams are exposed through this type;
/// the latter by pumping the channels to and from the stream.
#[derive(Debug, Clone)]
pub struct ChannelPort {
    outbound: flume::Sender<Vec<u8>>,
    inbound: flume::Receiver<Vec<u8>>,
    cancel: CancellationToken,
}

impl ChannelPort {
    /// Two connected ends sharing one close signal
    pub fn pair() -> (ChannelPort, ChannelPort) {
        let (a_tx, a_rx) = flume::unbounded();
        let (b_tx, b_rx) = flume::unbounded();
        let cancel = CancellationToken::new();
        (
            ChannelPort::from_parts(a_tx, b_rx, cancel.clone()),
            ChannelPort::from_parts(b_tx, a_rx, cancel),
        )
    }

    pub fn from_parts(
        outbound: flume::Sender<Vec<u8>>,
        inbound: flume::Receiver<Vec<u8>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            outbound,
            inbound,
            cancel,
        }
    }
}

#[async_trait]
impl Port for ChannelPort {
    async fn send(&self, message: Vec<u8>) -> Result<(), PortError> {
        if self.cancel.is_cancelled() {
            return Err(PortError::Closed);
        }
        self.outbound
            .send_async(message)
            .await
            .map_err(|_| PortError::Closed)
    }

    fn subscribe(&self) -> flume::Receiver<Vec<u8>> {
        self.inbound.clone()
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_in_order_and_closes_both_ends() {
        let (a, b) = ChannelPort::pair();
        let from_a = b.subscribe();

        a.send(b"one".to_vec()).await.unwrap();
        a.send(b"two".to_vec()).await.unwrap();
        assert_eq!(from_a.recv_async().await.unwrap(), b"one");
        assert_eq!(from_a.recv_async().await.unwrap(), b"two");

        b.close();
        a.closed().await;
        assert!(a.is_closed());
        assert_eq!(a.send(b"late".to_vec()).await, Err(PortError::Closed));
    }
}
