use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

use super::message::{Mutation, Payload, SpaceMessage};
use super::model::{ObjectModel, Value};
use super::pipeline::Pipeline;
use super::{SpaceError, SpaceEvent};
use crate::credentials::{
    verify_chain, Assertion, Credential, CredentialError, DeviceChainTrigger, Member, SpaceRole,
    StateChange,
};
use crate::crypto::{KeyError, Keyring, PublicKey, Signature};
use crate::feed::Feed;
use crate::feed_store::FeedStore;
use crate::timeframe::Timeframe;

#[derive(Debug, Clone)]
pub struct SpaceConfig {
    /// Buffered events per subscriber before the slowest one lags
    pub event_capacity: usize,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1024,
        }
    }
}

/// Everything a node needs to open or create spaces as one device of one identity
#[derive(Debug, Clone)]
pub struct SpaceContext {
    pub keyring: Keyring,
    pub feed_store: FeedStore,
    pub identity_key: PublicKey,
    pub device_key: PublicKey,
    /// Credential authorizing `device_key` for `identity_key`, published
    /// by the identity space. `None` when opening the identity space itself.
    pub device_chain: Option<watch::Receiver<Option<Credential>>>,
    pub config: SpaceConfig,
}

/// Acknowledges that a write is durable in the local feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReceipt {
    pub feed_key: PublicKey,
    pub seq: u64,
}

type QueryFn = Box<dyn FnOnce(&Pipeline) + Send>;

enum Command {
    Write {
        payload: Payload,
        reply: oneshot::Sender<Result<WriteReceipt, SpaceError>>,
    },
    AddFeed {
        feed_key: PublicKey,
        reply: oneshot::Sender<Result<(), SpaceError>>,
    },
    Query(QueryFn),
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to an open space
///
/// All state lives in a single task that owns the [`Pipeline`]; the handle
/// talks to it over a channel and can be cloned freely.
#[derive(Clone)]
pub struct Space {
    inner: Arc<SpaceInner>,
}

struct SpaceInner {
    space_key: PublicKey,
    genesis_feed: PublicKey,
    identity_key: PublicKey,
    device_key: PublicKey,
    local_feed: Feed,
    keyring: Keyring,
    commands: flume::Sender<Command>,
    events: broadcast::Sender<SpaceEvent>,
    timeframe: watch::Receiver<Timeframe>,
    writable: watch::Receiver<bool>,
    device_chain: watch::Receiver<Option<Credential>>,
    own_chain: watch::Receiver<Option<Credential>>,
    tracked: Arc<RwLock<BTreeMap<PublicKey, Feed>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space")
            .field("space_key", &self.inner.space_key)
            .field("local_feed", &self.inner.local_feed.key())
            .field("timeframe", &*self.inner.timeframe.borrow())
            .finish()
    }
}

impl Space {
    /// Open a space whose genesis lives in `genesis_feed`, writing to `local_feed_key`
    ///
    /// The secret for `local_feed_key` must be in the context's keyring.
    /// Feeds admitted by credentials in the space are opened as they are
    /// discovered.
    pub async fn open(
        ctx: &SpaceContext,
        space_key: PublicKey,
        genesis_feed: PublicKey,
        local_feed_key: PublicKey,
    ) -> Result<Self, SpaceError> {
        let secret = ctx
            .keyring
            .get(&local_feed_key)
            .ok_or(KeyError::MissingSecret(local_feed_key))?;
        let local_feed = ctx
            .feed_store
            .open_read_write_feed(local_feed_key, secret)
            .await?;

        let trigger: DeviceChainTrigger = Arc::new(watch::channel(None).0);
        let own_chain = trigger.subscribe();
        let device_chain = ctx.device_chain.clone().unwrap_or_else(|| own_chain.clone());

        let (events, _) = broadcast::channel(ctx.config.event_capacity);
        let (timeframe_tx, timeframe_rx) = watch::channel(Timeframe::new());
        let (writable_tx, writable_rx) = watch::channel(false);
        let (commands_tx, commands_rx) = flume::unbounded();
        let (wake_tx, wake_rx) = flume::unbounded();
        let tracked = Arc::new(RwLock::new(BTreeMap::new()));

        let mut actor = SpaceActor {
            pipeline: Pipeline::new(space_key).with_local_device(ctx.device_key, trigger),
            feed_store: ctx.feed_store.clone(),
            local_feed: local_feed.clone(),
            tracked: tracked.clone(),
            fetched: HashMap::new(),
            watchers: HashMap::new(),
            wake: wake_tx,
            events: events.clone(),
            timeframe: timeframe_tx,
            writable: writable_tx,
        };
        actor.track(local_feed.clone())?;
        if genesis_feed != local_feed_key {
            let genesis = ctx.feed_store.open_read_only_feed(genesis_feed).await?;
            actor.track(genesis)?;
        }
        let task = tokio::spawn(actor.run(commands_rx, wake_rx));

        tracing::info!(
            "opened space {} (local feed {}, genesis feed {})",
            space_key.short(),
            local_feed_key.short(),
            genesis_feed.short()
        );

        Ok(Self {
            inner: Arc::new(SpaceInner {
                space_key,
                genesis_feed,
                identity_key: ctx.identity_key,
                device_key: ctx.device_key,
                local_feed,
                keyring: ctx.keyring.clone(),
                commands: commands_tx,
                events,
                timeframe: timeframe_rx,
                writable: writable_rx,
                device_chain,
                own_chain,
                tracked,
                task: Mutex::new(Some(task)),
            }),
        })
    }

    /// Create a new data space with the context's identity as its admin
    ///
    /// The space key signs the genesis and the creator's membership, then
    /// its secret is discarded.
    pub async fn create(ctx: &SpaceContext) -> Result<Self, SpaceError> {
        let space_key = ctx.keyring.generate();
        let feed_key = ctx.keyring.generate();

        let genesis = Credential::issue(
            &ctx.keyring,
            &space_key,
            space_key,
            space_key,
            Assertion::SpaceGenesis,
            None,
        );
        let creator = Credential::issue(
            &ctx.keyring,
            &space_key,
            space_key,
            ctx.identity_key,
            Assertion::SpaceMember {
                space_key,
                role: SpaceRole::Admin,
            },
            None,
        );
        ctx.keyring.remove(&space_key);
        let (genesis, creator) = (genesis?, creator?);

        let space = Space::open(ctx, space_key, feed_key, feed_key).await?;
        space.write_credential(genesis).await?;
        space.write_credential(creator).await?;
        let admission = space.issue(
            feed_key,
            Assertion::AdmittedFeed {
                space_key,
                identity_key: ctx.identity_key,
                device_key: ctx.device_key,
            },
        )?;
        space.write_credential(admission).await?;
        Ok(space)
    }

    /// Create the identity space for a new identity whose secret is in the keyring
    ///
    /// Writes the identity genesis, authorizes the local device and admits
    /// the device's feed. Once processed, [`Space::device_chain`] holds the
    /// device authorization used as proof for every other space.
    pub async fn create_identity(ctx: &SpaceContext) -> Result<Self, SpaceError> {
        let identity_key = ctx.identity_key;
        let feed_key = ctx.keyring.generate();

        let space = Space::open(ctx, identity_key, feed_key, feed_key).await?;
        let genesis = Credential::issue(
            &ctx.keyring,
            &identity_key,
            identity_key,
            identity_key,
            Assertion::IdentityGenesis,
            None,
        )?;
        space.write_credential(genesis).await?;
        if ctx.device_key != identity_key {
            let device = Credential::issue(
                &ctx.keyring,
                &identity_key,
                identity_key,
                ctx.device_key,
                Assertion::AuthorizedDevice {
                    identity_key,
                    device_key: ctx.device_key,
                },
                None,
            )?;
            space.write_credential(device).await?;
        }
        let admission = space.issue(
            feed_key,
            Assertion::AdmittedFeed {
                space_key: identity_key,
                identity_key,
                device_key: ctx.device_key,
            },
        )?;
        space.write_credential(admission).await?;
        Ok(space)
    }

    pub fn key(&self) -> PublicKey {
        self.inner.space_key
    }

    pub fn genesis_feed(&self) -> PublicKey {
        self.inner.genesis_feed
    }

    pub fn local_feed(&self) -> &Feed {
        &self.inner.local_feed
    }

    pub fn identity_key(&self) -> PublicKey {
        self.inner.identity_key
    }

    pub fn device_key(&self) -> PublicKey {
        self.inner.device_key
    }

    /// Sign a credential as the local identity, through the local device
    pub fn issue(&self, subject: PublicKey, assertion: Assertion) -> Result<Credential, SpaceError> {
        let (identity, device) = (self.inner.identity_key, self.inner.device_key);
        let chain = if device == identity {
            None
        } else {
            let chain = self.inner.device_chain.borrow().clone();
            Some(chain.ok_or(CredentialError::MissingChain)?)
        };
        Ok(Credential::issue(
            &self.inner.keyring,
            &device,
            identity,
            subject,
            assertion,
            chain,
        )?)
    }

    /// Sign `msg` with the local device key
    pub fn sign_as_device(&self, msg: &[u8]) -> Result<Signature, SpaceError> {
        Ok(self.inner.keyring.sign(&self.inner.device_key, msg)?)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SpaceError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .commands
            .send_async(command(tx))
            .await
            .map_err(|_| SpaceError::Closed)?;
        rx.await.map_err(|_| SpaceError::Closed)
    }

    async fn query<T: Send + 'static>(
        &self,
        f: impl FnOnce(&Pipeline) -> T + Send + 'static,
    ) -> Result<T, SpaceError> {
        self.request(|reply| {
            Command::Query(Box::new(move |pipeline| {
                let _ = reply.send(f(pipeline));
            }))
        })
        .await
    }

    /// Append a mutation to the local feed
    ///
    /// Returns once the block is durable and the pipeline has consumed it.
    ///
    /// # Errors
    /// * `SpaceError::NotWritable` - the local feed is not admitted, or was revoked
    pub async fn write(&self, mutation: Mutation) -> Result<WriteReceipt, SpaceError> {
        self.write_payload(Payload::Mutation(mutation)).await
    }

    /// Append a credential to the local feed
    pub async fn write_credential(&self, credential: Credential) -> Result<WriteReceipt, SpaceError> {
        self.write_payload(Payload::Credential(credential)).await
    }

    async fn write_payload(&self, payload: Payload) -> Result<WriteReceipt, SpaceError> {
        self.request(|reply| Command::Write { payload, reply })
            .await?
    }

    /// Admit `identity_key` as a member and, when given, the feed admission
    /// credential its device signed for this space
    ///
    /// # Errors
    /// * `SpaceError::InvalidAdmission` - the feed admission is not for this space and identity
    pub async fn admit_member(
        &self,
        identity_key: PublicKey,
        role: SpaceRole,
        feed_admission: Option<Credential>,
    ) -> Result<WriteReceipt, SpaceError> {
        if let Some(admission) = &feed_admission {
            match &admission.assertion {
                Assertion::AdmittedFeed {
                    space_key,
                    identity_key: owner,
                    ..
                } if *space_key == self.key() && *owner == identity_key => {}
                _ => {
                    return Err(SpaceError::InvalidAdmission(format!(
                        "{} credential does not admit a feed of {} to this space",
                        admission.kind(),
                        identity_key.short()
                    )))
                }
            }
            verify_chain(admission, &identity_key)?;
        }

        let member = self.issue(
            identity_key,
            Assertion::SpaceMember {
                space_key: self.key(),
                role,
            },
        )?;
        let mut receipt = self.write_credential(member).await?;
        if let Some(admission) = feed_admission {
            receipt = self.write_credential(admission).await?;
        }
        Ok(receipt)
    }

    /// Authorize another device for the local identity and admit its feed
    /// into this identity space
    pub async fn authorize_device(
        &self,
        device_key: PublicKey,
        feed_key: PublicKey,
    ) -> Result<WriteReceipt, SpaceError> {
        let identity_key = self.inner.identity_key;
        let device = self.issue(
            device_key,
            Assertion::AuthorizedDevice {
                identity_key,
                device_key,
            },
        )?;
        self.write_credential(device).await?;
        let admission = self.issue(
            feed_key,
            Assertion::AdmittedFeed {
                space_key: self.key(),
                identity_key,
                device_key,
            },
        )?;
        self.write_credential(admission).await
    }

    pub async fn revoke_member(&self, identity_key: PublicKey) -> Result<WriteReceipt, SpaceError> {
        let credential = self.issue(
            identity_key,
            Assertion::RevokeMember {
                space_key: self.key(),
            },
        )?;
        self.write_credential(credential).await
    }

    pub async fn revoke_feed(&self, feed_key: PublicKey) -> Result<WriteReceipt, SpaceError> {
        let credential = self.issue(
            feed_key,
            Assertion::RevokeFeed {
                space_key: self.key(),
            },
        )?;
        self.write_credential(credential).await
    }

    /// Start consuming another feed
    ///
    /// # Errors
    /// * `SpaceError::AlreadyAdmitted` - the feed is already part of the space
    pub async fn add_feed(&self, feed_key: PublicKey) -> Result<(), SpaceError> {
        self.request(|reply| Command::AddFeed { feed_key, reply })
            .await?
    }

    /// Keys of every feed the space consumes
    pub fn feeds(&self) -> Vec<PublicKey> {
        self.inner.tracked.read().keys().copied().collect()
    }

    pub fn feed(&self, feed_key: &PublicKey) -> Option<Feed> {
        self.inner.tracked.read().get(feed_key).cloned()
    }

    pub fn timeframe(&self) -> Timeframe {
        self.inner.timeframe.borrow().clone()
    }

    pub fn subscribe_timeframe(&self) -> watch::Receiver<Timeframe> {
        self.inner.timeframe.clone()
    }

    /// Wait until every entry of `target` has been processed
    ///
    /// # Errors
    /// * `SpaceError::Timeout` - `target` was not reached within `timeout`
    pub async fn wait_for_timeframe(&self, target: &Timeframe, timeout: Duration) -> Result<(), SpaceError> {
        let mut rx = self.inner.timeframe.clone();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|timeframe| timeframe.satisfies(target))
                .await
                .map(|_| ())
        })
        .await;
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SpaceError::Closed),
            Err(_) => Err(SpaceError::Timeout("timeframe")),
        }
    }

    /// Whether mutations written now would be accepted
    pub fn is_writable(&self) -> bool {
        *self.inner.writable.borrow()
    }

    pub async fn wait_until_writable(&self, timeout: Duration) -> Result<(), SpaceError> {
        let mut rx = self.inner.writable.clone();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|writable| *writable).await.map(|_| ())
        })
        .await;
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SpaceError::Closed),
            Err(_) => Err(SpaceError::Timeout("write access")),
        }
    }

    /// The credential authorizing this device, once this (identity) space
    /// has processed it
    pub fn device_chain(&self) -> Option<Credential> {
        self.inner.own_chain.borrow().clone()
    }

    pub fn subscribe_device_chain(&self) -> watch::Receiver<Option<Credential>> {
        self.inner.own_chain.clone()
    }

    pub async fn wait_for_device_chain(&self, timeout: Duration) -> Result<Credential, SpaceError> {
        let mut rx = self.inner.own_chain.clone();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(Option::is_some).await.map(|chain| chain.clone())
        })
        .await;
        match waited {
            Ok(Ok(Some(chain))) => Ok(chain),
            Ok(Ok(None)) | Ok(Err(_)) => Err(SpaceError::Closed),
            Err(_) => Err(SpaceError::Credential(CredentialError::Timeout)),
        }
    }

    /// Snapshot of the object model
    pub async fn model(&self) -> Result<ObjectModel, SpaceError> {
        self.query(|pipeline| pipeline.model().clone()).await
    }

    /// The root document as JSON
    pub async fn document(&self) -> Result<serde_json::Value, SpaceError> {
        self.query(|pipeline| pipeline.model().document()).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, SpaceError> {
        let key = key.to_string();
        self.query(move |pipeline| pipeline.model().get(&key).cloned())
            .await
    }

    pub async fn members(&self) -> Result<Vec<(PublicKey, Member)>, SpaceError> {
        self.query(|pipeline| {
            pipeline
                .credentials()
                .members()
                .map(|(key, member)| (*key, *member))
                .collect()
        })
        .await
    }

    /// Whether `device` may replicate this space with the local device
    ///
    /// Until the local device sees itself admitted every peer is accepted;
    /// afterwards only devices acting for unrevoked members are.
    pub async fn admits_peer(&self, device: PublicKey) -> Result<bool, SpaceError> {
        let local = self.inner.device_key;
        self.query(move |pipeline| {
            let credentials = pipeline.credentials();
            !credentials.is_device_admitted(&local) || credentials.is_device_admitted(&device)
        })
        .await
    }

    /// Feeds admitted by credentials, including revoked ones
    pub async fn admitted_feeds(&self) -> Result<Vec<PublicKey>, SpaceError> {
        self.query(|pipeline| pipeline.credentials().admitted_feeds())
            .await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SpaceEvent> {
        self.inner.events.subscribe()
    }

    /// Stop processing and flush the local feed
    pub async fn close(&self) -> Result<(), SpaceError> {
        if self.request(|reply| Command::Close { reply }).await.is_err() {
            return Ok(());
        }
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.local_feed.close().await?;
        tracing::debug!("closed space {}", self.inner.space_key.short());
        Ok(())
    }
}

struct SpaceActor {
    pipeline: Pipeline,
    feed_store: FeedStore,
    local_feed: Feed,
    tracked: Arc<RwLock<BTreeMap<PublicKey, Feed>>>,
    /// Next seq to read from each tracked feed
    fetched: HashMap<PublicKey, u64>,
    watchers: HashMap<PublicKey, JoinHandle<()>>,
    wake: flume::Sender<PublicKey>,
    events: broadcast::Sender<SpaceEvent>,
    timeframe: watch::Sender<Timeframe>,
    writable: watch::Sender<bool>,
}

impl SpaceActor {
    async fn run(mut self, commands: flume::Receiver<Command>, wake: flume::Receiver<PublicKey>) {
        loop {
            tokio::select! {
                command = commands.recv_async() => match command {
                    Ok(Command::Close { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        return;
                    }
                    Ok(command) => self.handle(command).await,
                    Err(_) => break,
                },
                Ok(feed_key) = wake.recv_async() => self.pump(feed_key).await,
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        for (_, watcher) in self.watchers.drain() {
            watcher.abort();
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Write { payload, reply } => {
                let result = self.write(payload).await;
                let _ = reply.send(result);
            }
            Command::AddFeed { feed_key, reply } => {
                let result = self.add_feed(feed_key).await;
                let _ = reply.send(result);
            }
            Command::Query(query) => query(&self.pipeline),
            Command::Close { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn write(&mut self, payload: Payload) -> Result<WriteReceipt, SpaceError> {
        let feed_key = self.local_feed.key();
        self.pump(feed_key).await;
        if matches!(payload, Payload::Mutation(_))
            && !self.pipeline.credentials().is_feed_writable(&feed_key)
        {
            return Err(SpaceError::NotWritable);
        }

        let message = SpaceMessage {
            timeframe: self.pipeline.timeframe().clone(),
            payload,
        };
        let seq = self.local_feed.append(message.encode()?).await?;
        self.pump(feed_key).await;
        Ok(WriteReceipt { feed_key, seq })
    }

    async fn add_feed(&mut self, feed_key: PublicKey) -> Result<(), SpaceError> {
        if self.pipeline.has_feed(&feed_key) {
            return Err(SpaceError::AlreadyAdmitted(feed_key));
        }
        let feed = self.feed_store.open_read_only_feed(feed_key).await?;
        self.track(feed)
    }

    fn track(&mut self, feed: Feed) -> Result<(), SpaceError> {
        let feed_key = feed.key();
        self.pipeline.add_feed(feed_key)?;
        self.fetched.insert(feed_key, 0);
        self.watchers
            .insert(feed_key, spawn_watcher(&feed, self.wake.clone()));
        self.tracked.write().insert(feed_key, feed);
        tracing::debug!(
            "space {} now consumes feed {}",
            self.pipeline.space_key().short(),
            feed_key.short()
        );
        Ok(())
    }

    /// Feed every newly stored block of `feed_key` into the pipeline
    async fn pump(&mut self, feed_key: PublicKey) {
        let Some(feed) = self.tracked.read().get(&feed_key).cloned() else {
            return;
        };
        if self.pipeline.is_degraded(&feed_key) {
            return;
        }

        let mut events = Vec::new();
        let start = self.fetched.get(&feed_key).copied().unwrap_or(0);
        for seq in start..feed.length() {
            match feed.block(seq).await {
                Ok(block) => {
                    self.fetched.insert(feed_key, seq + 1);
                    match self.pipeline.ingest(block) {
                        Ok(processed) => events.extend(processed),
                        Err(e) => tracing::warn!("failed to ingest {}:{}: {}", feed_key.short(), seq, e),
                    }
                }
                Err(e) => {
                    tracing::error!(
                        "feed {} unreadable at {}, continuing without it: {}",
                        feed_key.short(),
                        seq,
                        e
                    );
                    self.pipeline.mark_degraded(&feed_key);
                    events.push(SpaceEvent::FeedDegraded {
                        feed_key,
                        reason: e.to_string(),
                    });
                    break;
                }
            }
        }
        self.publish(events).await;
    }

    async fn publish(&mut self, events: Vec<SpaceEvent>) {
        if events.is_empty() {
            return;
        }
        for event in &events {
            if let SpaceEvent::StateChanged(StateChange::FeedAdmitted { feed_key, .. }) = event {
                if self.pipeline.has_feed(feed_key) {
                    continue;
                }
                let opened = match self.feed_store.open_read_only_feed(*feed_key).await {
                    Ok(feed) => self.track(feed),
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = opened {
                    tracing::warn!("failed to open admitted feed {}: {}", feed_key.short(), e);
                }
            }
        }

        self.timeframe
            .send_replace(self.pipeline.timeframe().clone());
        let writable = self
            .pipeline
            .credentials()
            .is_feed_writable(&self.local_feed.key());
        self.writable.send_if_modified(|current| {
            let changed = *current != writable;
            *current = writable;
            changed
        });
        for event in events {
            let _ = self.events.send(event);
        }
    }
}

/// Wake the actor whenever `feed` grows
fn spawn_watcher(feed: &Feed, wake: flume::Sender<PublicKey>) -> JoinHandle<()> {
    let feed_key = feed.key();
    let mut length = feed.subscribe();
    tokio::spawn(async move {
        if wake.send(feed_key).is_err() {
            return;
        }
        while length.changed().await.is_ok() {
            if wake.send(feed_key).is_err() {
                break;
            }
        }
    })
}
