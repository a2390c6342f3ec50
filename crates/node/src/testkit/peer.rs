use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use common::credentials::SpaceRole;
use common::crypto::PublicKey;
use common::invitation::{AuthMethod, StaticSecret};
use common::network::MemoryNetwork;
use common::space::{Mutation, Space, Value};

use crate::config::NodeConfig;
use crate::node::Node;

/// A test node with convenience methods for integration testing
#[derive(Clone, Debug)]
pub struct TestPeer {
    /// The name of this peer (for debugging)
    pub name: String,
    node: Node,
}

impl TestPeer {
    /// Open a node on `network`
    ///
    /// # Arguments
    /// * `name` - A name for this peer (useful for debugging)
    /// * `data_dir` - Optional directory for a persistent node (in memory if None)
    pub async fn new(
        name: impl Into<String>,
        network: &MemoryNetwork,
        data_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let name = name.into();
        let node = Node::open(Self::config(data_dir), network).await?;
        tracing::info!("[{}] node started with device {}", name, node.device_key().short());
        Ok(Self { name, node })
    }

    /// Timings scaled down for tests
    pub fn config(data_dir: Option<PathBuf>) -> NodeConfig {
        NodeConfig {
            data_dir,
            read_timeout_ms: 5_000,
            reconnect_min_delay_ms: 10,
            reconnect_max_delay_ms: 200,
            ..Default::default()
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn device_key(&self) -> PublicKey {
        self.node.device_key()
    }

    /// Create the identity (if missing) and a fresh space
    pub async fn create_space(&self) -> Result<Space> {
        if self.node.identity().await.is_none() {
            self.node.create_identity().await?;
        }
        Ok(self.node.create_space().await?)
    }

    pub async fn space(&self, space_key: &PublicKey) -> Result<Space> {
        self.node
            .space(space_key)
            .await
            .ok_or_else(|| anyhow!("[{}] unknown space {}", self.name, space_key.short()))
    }

    /// Set a root key of `space`
    pub async fn set(&self, space: &Space, key: &str, value: impl Into<Value>) -> Result<()> {
        let receipt = space.write(Mutation::set(key, value)).await?;
        tracing::debug!(
            "[{}] wrote {} at {}:{}",
            self.name,
            key,
            receipt.feed_key.short(),
            receipt.seq
        );
        Ok(())
    }

    /// Redeem an invitation from `host` to `space_key`, end to end
    pub async fn join_space_of(&self, host: &TestPeer, space_key: &PublicKey) -> Result<Space> {
        if self.node.identity().await.is_none() {
            self.node.create_identity().await?;
        }
        let hosted = host
            .node
            .share_space(space_key, SpaceRole::Editor, AuthMethod::SharedSecret)
            .await?;
        let code = hosted
            .auth_code()
            .ok_or_else(|| anyhow!("shared-secret invitation without a code"))?
            .to_string();

        let pending = self
            .node
            .accept_invitation(&hosted.encoded()?, Arc::new(StaticSecret::new(code)))
            .await?;
        let space = pending.join().await?;
        hosted.wait().await?;
        space.wait_until_writable(Duration::from_secs(10)).await?;
        tracing::info!(
            "[{}] joined space {} from [{}]",
            self.name,
            space_key.short(),
            host.name
        );
        Ok(space)
    }

    /// Close the node
    pub async fn stop(&self) -> Result<()> {
        self.node.close().await?;
        tracing::info!("[{}] node stopped", self.name);
        Ok(())
    }
}
