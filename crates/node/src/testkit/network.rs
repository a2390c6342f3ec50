use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use common::network::MemoryNetwork;

use super::peer::TestPeer;

/// A coordinator for multiple test nodes
///
/// TestNetwork owns the in-memory network the nodes share and provides
/// utilities for eventual consistency testing.
#[derive(Default)]
pub struct TestNetwork {
    network: MemoryNetwork,
    /// All peers in the network, indexed by name
    peers: HashMap<String, TestPeer>,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// The network the peers talk over, for partitions and outages
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    /// Add an in-memory peer
    pub async fn add_peer(&mut self, name: impl Into<String>) -> Result<TestPeer> {
        self.add_peer_at(name, None).await
    }

    /// Add a peer, persistent when `data_dir` is given
    pub async fn add_peer_at(
        &mut self,
        name: impl Into<String>,
        data_dir: Option<PathBuf>,
    ) -> Result<TestPeer> {
        let name = name.into();
        if self.peers.contains_key(&name) {
            return Err(anyhow::anyhow!("Peer '{}' already exists", name));
        }
        let peer = TestPeer::new(name.clone(), &self.network, data_dir).await?;
        self.peers.insert(name, peer.clone());
        Ok(peer)
    }

    pub fn peer(&self, name: &str) -> Option<&TestPeer> {
        self.peers.get(name)
    }

    /// Cut every link between two peers; the dialing side redials
    pub fn disconnect(&self, a: &TestPeer, b: &TestPeer) {
        self.network.disconnect(a.device_key(), b.device_key());
    }

    /// Keep two peers apart until [`TestNetwork::heal`]
    pub fn partition(&self, a: &TestPeer, b: &TestPeer) {
        self.network.block(a.device_key(), b.device_key());
        self.network.disconnect(a.device_key(), b.device_key());
    }

    pub fn heal(&self, a: &TestPeer, b: &TestPeer) {
        self.network.unblock(a.device_key(), b.device_key());
    }

    /// Stop a peer and forget it
    pub async fn remove_peer(&mut self, name: &str) -> Result<()> {
        if let Some(peer) = self.peers.remove(name) {
            peer.stop().await?;
        }
        Ok(())
    }

    /// Shutdown all peers in the network
    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("Shutting down test network with {} peers", self.peers.len());
        for (name, peer) in self.peers.drain() {
            if let Err(e) = peer.stop().await {
                tracing::error!("Error stopping peer {}: {}", name, e);
            }
        }
        Ok(())
    }

    /// Poll a condition until it succeeds or times out
    ///
    /// This is useful for testing eventual consistency across peers.
    pub async fn eventually<F, Fut>(&self, timeout: Duration, condition: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<bool>>,
    {
        let start = std::time::Instant::now();
        let poll_interval = Duration::from_millis(20);

        loop {
            match condition().await {
                Ok(true) => {
                    tracing::debug!("Eventual condition met after {:?}", start.elapsed());
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => {
                    // transient errors are expected while peers catch up
                    tracing::debug!("Eventual condition check error: {}", e);
                }
            }

            if start.elapsed() > timeout {
                return Err(anyhow::anyhow!(
                    "Condition not met within timeout ({:?})",
                    timeout
                ));
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}
