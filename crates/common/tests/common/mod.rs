//! Shared test utilities for space integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use common::credentials::{Assertion, Credential};
use common::crypto::{Keyring, PublicKey};
use common::feed::ReplicationConfig;
use common::feed_store::FeedStore;
use common::network::{MemoryNetwork, NetworkManager, SwarmConfig};
use common::replication::ReplicationProtocol;
use common::space::{Space, SpaceConfig, SpaceContext};
use common::storage::{MemoryStorageProvider, StorageProvider};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Route test logs through the test writer; repeated calls are fine
pub fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with_test_writer()
        .try_init();
}

/// A device acting as its own identity, with its own storage and network stack
pub struct Device {
    pub keyring: Keyring,
    pub key: PublicKey,
    pub feed_store: FeedStore,
    pub network: Arc<NetworkManager>,
}

impl Device {
    pub fn new(network: &MemoryNetwork) -> Self {
        Self::with_storage(network, Arc::new(MemoryStorageProvider::new()))
    }

    pub fn with_storage(network: &MemoryNetwork, provider: Arc<dyn StorageProvider>) -> Self {
        let keyring = Keyring::new();
        let key = keyring.generate();
        let manager = NetworkManager::new(
            Arc::new(network.clone()),
            Arc::new(network.transport(key)),
            SwarmConfig {
                reconnect_min_delay: Duration::from_millis(10),
                reconnect_max_delay: Duration::from_millis(200),
                ..Default::default()
            },
        );
        Self {
            keyring,
            key,
            feed_store: FeedStore::new(provider),
            network: Arc::new(manager),
        }
    }

    pub fn context(&self) -> SpaceContext {
        SpaceContext {
            keyring: self.keyring.clone(),
            feed_store: self.feed_store.clone(),
            identity_key: self.key,
            device_key: self.key,
            device_chain: None,
            config: SpaceConfig::default(),
        }
    }

    /// Sign an admission of a new local feed into `space_key`
    pub fn feed_admission(&self, space_key: PublicKey) -> Credential {
        let feed_key = self.keyring.generate();
        Credential::issue(
            &self.keyring,
            &self.key,
            self.key,
            feed_key,
            Assertion::AdmittedFeed {
                space_key,
                identity_key: self.key,
                device_key: self.key,
            },
            None,
        )
        .unwrap()
    }

    pub async fn replicate(&self, space: &Space) {
        let protocol = ReplicationProtocol::new(space.clone(), ReplicationConfig::default());
        self.network
            .join_swarm(space.key(), Arc::new(protocol), None)
            .await
            .unwrap();
    }
}
