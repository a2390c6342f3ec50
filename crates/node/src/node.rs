use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use common::credentials::{Assertion, Credential, SpaceRole};
use common::crypto::{Keyring, PublicKey, SecretKey};
use common::feed_store::FeedStore;
use common::invitation::{
    self, AdmissionHandler, AdmissionRequest, AdmissionResponse, AuthMethod, Invitation,
    InvitationError, InvitationHandle, InvitationKind, InvitationOffer, SecretProvider,
};
use common::network::{
    MemoryNetwork, NetworkError, NetworkManager, SignalingService, Transport,
};
use common::replication::ReplicationProtocol;
use common::space::{Space, SpaceConfig, SpaceContext};
use common::storage::{FileStorageProvider, MemoryStorageProvider, StorageProvider};
use tokio::sync::Mutex;

use crate::config::{NodeConfig, KEY_FILE_NAME, METADATA_FILE_NAME};
use crate::error::NodeError;
use crate::metadata::{Metadata, MetadataStore, SpaceRecord};

/// Signaling and transport a node runs its swarms over
#[async_trait]
pub trait NetworkProvider: Send + Sync {
    /// Bring up the transport for the device holding `device`
    async fn connect(
        &self,
        device: &SecretKey,
    ) -> Result<(Arc<dyn SignalingService>, Arc<dyn Transport>), NetworkError>;
}

#[async_trait]
impl NetworkProvider for MemoryNetwork {
    async fn connect(
        &self,
        device: &SecretKey,
    ) -> Result<(Arc<dyn SignalingService>, Arc<dyn Transport>), NetworkError> {
        Ok((
            Arc::new(self.clone()),
            Arc::new(self.transport(device.public())),
        ))
    }
}

/// One device of (at most) one identity, with the spaces it has joined
///
/// Everything a node does goes through this handle; there is no global
/// state. Cloning is cheap.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    device_key: PublicKey,
    keyring: Keyring,
    feed_store: FeedStore,
    network: Arc<NetworkManager>,
    metadata: MetadataStore,
    state: Mutex<NodeState>,
}

#[derive(Default)]
struct NodeState {
    metadata: Metadata,
    identity: Option<Space>,
    spaces: BTreeMap<PublicKey, Space>,
    closed: bool,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("device_key", &self.inner.device_key)
            .field("data_dir", &self.inner.config.data_dir)
            .finish()
    }
}

impl Node {
    /// Open the node described by `config`
    ///
    /// With a data directory the device key, metadata and feeds are loaded
    /// from it (and created on first use), and every known space is reopened
    /// and replayed. Without one the node lives in memory.
    pub async fn open(
        config: NodeConfig,
        network: &dyn NetworkProvider,
    ) -> Result<Self, NodeError> {
        let (device, provider, metadata): (SecretKey, Arc<dyn StorageProvider>, MetadataStore) =
            match &config.data_dir {
                Some(data_dir) => {
                    tokio::fs::create_dir_all(data_dir).await?;
                    (
                        load_or_create_device(data_dir).await?,
                        Arc::new(FileStorageProvider::new(data_dir)),
                        MetadataStore::new(Some(data_dir.join(METADATA_FILE_NAME))),
                    )
                }
                None => (
                    SecretKey::generate(),
                    Arc::new(MemoryStorageProvider::new()),
                    MetadataStore::new(None),
                ),
            };

        let keyring = Keyring::new();
        let device_key = keyring.insert(device.clone());
        let saved = metadata.load().await?;
        saved.restore_secrets(&keyring)?;

        let (signaling, transport) = network.connect(&device).await?;
        let network = Arc::new(NetworkManager::new(
            signaling,
            transport,
            config.swarm_config(),
        ));

        let node = Self {
            inner: Arc::new(NodeInner {
                config,
                device_key,
                keyring,
                feed_store: FeedStore::new(provider),
                network,
                metadata,
                state: Mutex::new(NodeState {
                    metadata: saved.clone(),
                    ..Default::default()
                }),
            }),
        };

        {
            let mut state = node.inner.state.lock().await;
            if let Some(record) = saved.identity {
                let identity = node.attach(&record, None).await?;
                state.identity = Some(identity);
            }
            for record in &saved.spaces {
                let space = node.attach(record, state.identity.as_ref()).await?;
                state.spaces.insert(record.space_key, space);
            }
        }

        tracing::info!(
            "node {} open with {} spaces",
            device_key.short(),
            saved.spaces.len()
        );
        Ok(node)
    }

    pub fn device_key(&self) -> PublicKey {
        self.inner.device_key
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn network(&self) -> &Arc<NetworkManager> {
        &self.inner.network
    }

    pub fn feed_store(&self) -> &FeedStore {
        &self.inner.feed_store
    }

    pub fn keyring(&self) -> &Keyring {
        &self.inner.keyring
    }

    /// Create a new identity with this device as its first device
    ///
    /// # Errors
    /// * `NodeError::IdentityExists` - the node already has an identity
    pub async fn create_identity(&self) -> Result<Space, NodeError> {
        let mut state = self.lock().await?;
        if let Some(identity) = &state.identity {
            return Err(NodeError::IdentityExists(identity.key()));
        }

        let identity_key = self.inner.keyring.generate();
        let ctx = self.context(identity_key, None);
        let identity = Space::create_identity(&ctx).await?;
        identity
            .wait_for_device_chain(self.inner.config.read_timeout())
            .await?;
        self.join_swarm(&identity).await?;

        state.metadata.identity = Some(record_of(&identity));
        state.identity = Some(identity.clone());
        self.persist(&mut state).await?;
        tracing::info!("created identity {}", identity_key.short());
        Ok(identity)
    }

    /// The identity space, once the node has an identity
    pub async fn identity(&self) -> Option<Space> {
        self.inner.state.lock().await.identity.clone()
    }

    /// Create a data space administered by this node's identity
    pub async fn create_space(&self) -> Result<Space, NodeError> {
        let mut state = self.lock().await?;
        let identity = state.identity.clone().ok_or(NodeError::NoIdentity)?;
        identity
            .wait_for_device_chain(self.inner.config.read_timeout())
            .await?;

        let ctx = self.context(identity.key(), Some(&identity));
        let space = Space::create(&ctx).await?;
        self.join_swarm(&space).await?;

        state.metadata.spaces.push(record_of(&space));
        state.spaces.insert(space.key(), space.clone());
        self.persist(&mut state).await?;
        Ok(space)
    }

    pub async fn space(&self, space_key: &PublicKey) -> Option<Space> {
        self.inner.state.lock().await.spaces.get(space_key).cloned()
    }

    pub async fn spaces(&self) -> Vec<Space> {
        self.inner
            .state
            .lock()
            .await
            .spaces
            .values()
            .cloned()
            .collect()
    }

    /// Invite another identity into `space_key` as a member with `role`
    pub async fn share_space(
        &self,
        space_key: &PublicKey,
        role: SpaceRole,
        auth_method: AuthMethod,
    ) -> Result<InvitationHandle<AdmissionRequest>, NodeError> {
        let space = self
            .space(space_key)
            .await
            .ok_or(NodeError::UnknownSpace(*space_key))?;
        let offer = InvitationOffer {
            kind: InvitationKind::Space,
            space_key: Some(space.key()),
            auth_method,
        };
        Ok(invitation::create_invitation(
            &self.inner.network,
            offer,
            Arc::new(SpaceAdmission { space, role }),
            &self.inner.config.invitation_config(),
        )
        .await?)
    }

    /// Invite another device to act for this node's identity
    pub async fn share_identity(
        &self,
        auth_method: AuthMethod,
    ) -> Result<InvitationHandle<AdmissionRequest>, NodeError> {
        let identity = self.identity().await.ok_or(NodeError::NoIdentity)?;
        let offer = InvitationOffer {
            kind: InvitationKind::Device,
            space_key: Some(identity.key()),
            auth_method,
        };
        Ok(invitation::create_invitation(
            &self.inner.network,
            offer,
            Arc::new(DeviceAdmission { identity }),
            &self.inner.config.invitation_config(),
        )
        .await?)
    }

    /// Start redeeming an encoded invitation
    ///
    /// A space invitation needs an identity on this node; a device
    /// invitation needs a node without one. Call [`PendingJoin::join`] to
    /// wait for the host and open what it admitted this node to.
    pub async fn accept_invitation(
        &self,
        encoded: &str,
        secret: Arc<dyn SecretProvider>,
    ) -> Result<PendingJoin, NodeError> {
        let received = Invitation::decode(encoded)?;
        let kind = received.kind;
        let device_key = self.inner.device_key;

        let feed_key = self.inner.keyring.generate();
        let accepted = async {
            let request = self.admission_request(&received, feed_key).await?;
            let handle = invitation::accept_invitation(
                &self.inner.network,
                received,
                secret,
                request,
                &self.inner.config.invitation_config(),
            )
            .await?;
            Ok::<_, NodeError>(handle)
        }
        .await;
        let handle = match accepted {
            Ok(handle) => handle,
            Err(e) => {
                self.inner.keyring.remove(&feed_key);
                return Err(e);
            }
        };
        tracing::debug!(
            "accepting {:?} invitation as device {}",
            kind,
            device_key.short()
        );
        Ok(PendingJoin {
            node: self.clone(),
            handle,
            kind,
            feed_key,
            joined: false,
        })
    }

    /// What this node asks the host to admit it with
    async fn admission_request(
        &self,
        received: &Invitation,
        feed_key: PublicKey,
    ) -> Result<AdmissionRequest, NodeError> {
        let device_key = self.inner.device_key;
        let request = match received.kind {
            InvitationKind::Space => {
                let space_key = received
                    .space_key
                    .ok_or_else(|| InvitationError::Protocol("missing space key".to_string()))?;
                if self.space(&space_key).await.is_some() {
                    return Err(NodeError::SpaceExists(space_key));
                }
                let identity = self.identity().await.ok_or(NodeError::NoIdentity)?;
                let identity_key = identity.key();
                let chain = if device_key == identity_key {
                    None
                } else {
                    Some(
                        identity
                            .wait_for_device_chain(self.inner.config.read_timeout())
                            .await?,
                    )
                };
                let feed_admission = Credential::issue(
                    &self.inner.keyring,
                    &device_key,
                    identity_key,
                    feed_key,
                    Assertion::AdmittedFeed {
                        space_key,
                        identity_key,
                        device_key,
                    },
                    chain,
                )?;
                AdmissionRequest::Space {
                    identity_key,
                    device_key,
                    feed_admission,
                }
            }
            InvitationKind::Device => {
                if let Some(identity) = self.identity().await {
                    return Err(NodeError::IdentityExists(identity.key()));
                }
                AdmissionRequest::Device {
                    device_key,
                    feed_key,
                }
            }
        };
        Ok(request)
    }

    /// Leave every swarm and close every space
    pub async fn close(&self) -> Result<(), NodeError> {
        let mut state = self.inner.state.lock().await;
        if std::mem::replace(&mut state.closed, true) {
            return Ok(());
        }
        self.inner.network.close().await;
        let spaces: Vec<Space> = state
            .spaces
            .values()
            .cloned()
            .chain(state.identity.clone())
            .collect();
        for space in spaces {
            if let Err(e) = space.close().await {
                tracing::error!("failed to close space {}: {}", space.key().short(), e);
            }
        }
        self.inner.feed_store.close().await?;
        tracing::info!("node {} closed", self.inner.device_key.short());
        Ok(())
    }

    async fn lock(&self) -> Result<tokio::sync::MutexGuard<'_, NodeState>, NodeError> {
        let state = self.inner.state.lock().await;
        if state.closed {
            return Err(NodeError::Closed);
        }
        Ok(state)
    }

    fn context(&self, identity_key: PublicKey, identity: Option<&Space>) -> SpaceContext {
        SpaceContext {
            keyring: self.inner.keyring.clone(),
            feed_store: self.inner.feed_store.clone(),
            identity_key,
            device_key: self.inner.device_key,
            device_chain: identity.map(Space::subscribe_device_chain),
            config: SpaceConfig::default(),
        }
    }

    /// Open a known space and start replicating it
    ///
    /// `identity` is `None` when `record` is the identity space itself.
    async fn attach(&self, record: &SpaceRecord, identity: Option<&Space>) -> Result<Space, NodeError> {
        let identity_key = identity.map_or(record.space_key, Space::key);
        let ctx = self.context(identity_key, identity);
        let space = Space::open(&ctx, record.space_key, record.genesis_feed, record.feed_key).await?;
        self.join_swarm(&space).await?;
        Ok(space)
    }

    async fn join_swarm(&self, space: &Space) -> Result<(), NodeError> {
        let protocol = ReplicationProtocol::new(space.clone(), self.inner.config.replication_config());
        self.inner
            .network
            .join_swarm(space.key(), Arc::new(protocol), None)
            .await?;
        Ok(())
    }

    async fn persist(&self, state: &mut NodeState) -> Result<(), NodeError> {
        state
            .metadata
            .capture_secrets(&self.inner.keyring, &self.inner.device_key);
        self.inner.metadata.save(&state.metadata).await
    }

    async fn finish_join(
        &self,
        kind: InvitationKind,
        response: AdmissionResponse,
        feed_key: PublicKey,
    ) -> Result<Space, NodeError> {
        let mut state = self.lock().await?;
        let record = SpaceRecord {
            space_key: response.space_key,
            genesis_feed: response.genesis_feed,
            feed_key,
        };

        if kind == InvitationKind::Device {
            if let Some(identity) = &state.identity {
                return Err(NodeError::IdentityExists(identity.key()));
            }
            let ctx = self.context(response.identity_key, None);
            let identity =
                Space::open(&ctx, record.space_key, record.genesis_feed, record.feed_key).await?;
            self.join_swarm(&identity).await?;
            state.metadata.identity = Some(record);
            state.identity = Some(identity.clone());
            self.persist(&mut state).await?;
            tracing::info!("joined identity {}", response.identity_key.short());
            return Ok(identity);
        }

        let identity = state.identity.clone().ok_or(NodeError::NoIdentity)?;
        let ctx = self.context(identity.key(), Some(&identity));
        let space = Space::open(&ctx, record.space_key, record.genesis_feed, record.feed_key).await?;
        self.join_swarm(&space).await?;
        state.metadata.spaces.push(record);
        state.spaces.insert(space.key(), space.clone());
        self.persist(&mut state).await?;
        tracing::info!("joined space {}", space.key().short());
        Ok(space)
    }
}

/// An invitation being redeemed by this node
///
/// The feed key reserved for the join is dropped from the keyring unless
/// the join completes.
pub struct PendingJoin {
    node: Node,
    handle: InvitationHandle<AdmissionResponse>,
    kind: InvitationKind,
    feed_key: PublicKey,
    joined: bool,
}

impl std::fmt::Debug for PendingJoin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingJoin")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("feed_key", &self.feed_key)
            .finish()
    }
}

impl PendingJoin {
    /// Progress of the handshake; cancel through it
    pub fn handle(&self) -> &InvitationHandle<AdmissionResponse> {
        &self.handle
    }

    /// Key of the feed this node will write with once admitted
    pub fn feed_key(&self) -> PublicKey {
        self.feed_key
    }

    /// Wait for the host to admit this node, then open the space
    pub async fn join(mut self) -> Result<Space, NodeError> {
        let response = self.handle.wait().await?;
        let space = self
            .node
            .finish_join(self.kind, response, self.feed_key)
            .await?;
        self.joined = true;
        Ok(space)
    }
}

impl Drop for PendingJoin {
    fn drop(&mut self) {
        if !self.joined && self.node.inner.keyring.remove(&self.feed_key).is_some() {
            tracing::debug!("released unused feed key {}", self.feed_key.short());
        }
    }
}

/// Writes a guest's membership into a data space
struct SpaceAdmission {
    space: Space,
    role: SpaceRole,
}

#[async_trait]
impl AdmissionHandler for SpaceAdmission {
    async fn admit(&self, request: AdmissionRequest) -> Result<AdmissionResponse, InvitationError> {
        let AdmissionRequest::Space {
            identity_key,
            device_key,
            feed_admission,
        } = request
        else {
            return Err(InvitationError::Protocol(
                "expected a space admission".to_string(),
            ));
        };
        if !matches!(
            feed_admission.assertion,
            Assertion::AdmittedFeed { device_key: signed, .. } if signed == device_key
        ) {
            return Err(InvitationError::Rejected(format!(
                "feed admission is not for device {}",
                device_key.short()
            )));
        }
        self.space
            .admit_member(identity_key, self.role, Some(feed_admission))
            .await
            .map_err(|e| InvitationError::Rejected(e.to_string()))?;
        Ok(AdmissionResponse {
            space_key: self.space.key(),
            genesis_feed: self.space.genesis_feed(),
            identity_key: self.space.identity_key(),
        })
    }
}

/// Authorizes a guest device for the local identity
struct DeviceAdmission {
    identity: Space,
}

#[async_trait]
impl AdmissionHandler for DeviceAdmission {
    async fn admit(&self, request: AdmissionRequest) -> Result<AdmissionResponse, InvitationError> {
        let AdmissionRequest::Device {
            device_key,
            feed_key,
        } = request
        else {
            return Err(InvitationError::Protocol(
                "expected a device admission".to_string(),
            ));
        };
        self.identity
            .authorize_device(device_key, feed_key)
            .await
            .map_err(|e| InvitationError::Rejected(e.to_string()))?;
        Ok(AdmissionResponse {
            space_key: self.identity.key(),
            genesis_feed: self.identity.genesis_feed(),
            identity_key: self.identity.key(),
        })
    }
}

fn record_of(space: &Space) -> SpaceRecord {
    SpaceRecord {
        space_key: space.key(),
        genesis_feed: space.genesis_feed(),
        feed_key: space.local_feed().key(),
    }
}

/// Read the device key from `key.pem`, generating it on first use
async fn load_or_create_device(data_dir: &Path) -> Result<SecretKey, NodeError> {
    let key_path = data_dir.join(KEY_FILE_NAME);
    match tokio::fs::read_to_string(&key_path).await {
        Ok(pem) => return Ok(SecretKey::from_pem(&pem)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let key = SecretKey::generate();
    tokio::fs::write(&key_path, key.to_pem()).await?;
    tracing::info!("generated device key {}", key.public().short());
    Ok(key)
}
