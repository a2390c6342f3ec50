use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connection::{ConnectionInfo, ConnectionState};
use super::port::Port;
use super::topology::Topology;
use super::{Incoming, NetworkError, SignalEvent, SignalingService, Transport};
use crate::crypto::PublicKey;

/// Tuning for swarm membership and reconnects
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub topology: Topology,
    pub reconnect_min_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            topology: Topology::Mesh,
            reconnect_min_delay: Duration::from_millis(50),
            reconnect_max_delay: Duration::from_secs(16),
        }
    }
}

impl SwarmConfig {
    fn backoff(&self) -> backon::ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.reconnect_min_delay)
            .with_max_delay(self.reconnect_max_delay)
            .with_jitter()
            .without_max_times()
            .build()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwarmState {
    /// Registering with signaling for the first time
    Joining,
    Joined,
    /// Signaling is unreachable; existing connections stay up and the
    /// swarm keeps trying to re-join
    Degraded,
    Left,
}

/// One connection handed to a [`SwarmProtocol`]
#[derive(Debug, Clone)]
pub struct PeerSession {
    pub topic: PublicKey,
    pub local: PublicKey,
    pub remote: PublicKey,
    /// Whether this side dialed
    pub is_initiator: bool,
    pub port: Arc<dyn Port>,
}

/// What runs over each connection of a swarm
#[async_trait]
pub trait SwarmProtocol: Send + Sync + 'static {
    /// Drive `session` until the port closes or the protocol is done
    async fn run(&self, session: PeerSession) -> Result<(), NetworkError>;
}

type Connections = Arc<ConnectionTable>;

/// Connection info per remote; every change is published on a watch channel
struct ConnectionTable {
    entries: RwLock<HashMap<PublicKey, ConnectionInfo>>,
    changed: watch::Sender<()>,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            changed: watch::Sender::new(()),
        }
    }
}

impl ConnectionTable {
    fn get(&self, remote: &PublicKey) -> Option<ConnectionInfo> {
        self.entries.read().get(remote).cloned()
    }

    fn all(&self) -> Vec<ConnectionInfo> {
        self.entries.read().values().cloned().collect()
    }

    fn insert(&self, info: ConnectionInfo) {
        self.entries.write().insert(info.remote, info);
        self.changed.send_replace(());
    }

    /// Apply `f` to the entry for `remote`, if there is one
    fn update(&self, remote: &PublicKey, f: impl FnOnce(&mut ConnectionInfo)) {
        if let Some(info) = self.entries.write().get_mut(remote) {
            f(info);
        }
        self.changed.send_replace(());
    }

    fn update_all(&self, f: impl Fn(&mut ConnectionInfo)) {
        self.entries.write().values_mut().for_each(f);
        self.changed.send_replace(());
    }

    fn subscribe(&self) -> watch::Receiver<()> {
        self.changed.subscribe()
    }
}

/// Handle to a joined topic
#[derive(Clone)]
pub struct Swarm {
    inner: Arc<SwarmInner>,
}

struct SwarmInner {
    topic: PublicKey,
    state: watch::Receiver<SwarmState>,
    connections: Connections,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("topic", &self.inner.topic)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl Swarm {
    pub fn topic(&self) -> PublicKey {
        self.inner.topic
    }

    pub fn state(&self) -> SwarmState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SwarmState> {
        self.inner.state.clone()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut connections = self.inner.connections.all();
        connections.sort_by_key(|info| info.remote);
        connections
    }

    pub fn connection(&self, remote: &PublicKey) -> Option<ConnectionInfo> {
        self.inner.connections.get(remote)
    }

    /// Wait until a connection to `remote` is up
    pub async fn wait_connected(
        &self,
        remote: &PublicKey,
        timeout: Duration,
    ) -> Result<(), NetworkError> {
        let mut changed = self.inner.connections.subscribe();
        let wait = async {
            loop {
                let connected = self
                    .connection(remote)
                    .is_some_and(|info| info.state == ConnectionState::Connected);
                if connected {
                    return Ok::<(), NetworkError>(());
                }
                changed.changed().await.map_err(|_| NetworkError::Closed)?;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| NetworkError::Timeout("connection"))?
    }

    async fn stop(&self) {
        self.inner.cancel.cancel();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

struct SwarmActor {
    topic: PublicKey,
    local: PublicKey,
    config: SwarmConfig,
    signaling: Arc<dyn SignalingService>,
    transport: Arc<dyn Transport>,
    protocol: Arc<dyn SwarmProtocol>,
    state: watch::Sender<SwarmState>,
    connections: Connections,
    cancel: CancellationToken,
    peers: HashMap<PublicKey, PeerTask>,
}

struct PeerTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SwarmActor {
    async fn run(mut self, incoming: flume::Receiver<Incoming>) {
        let mut backoff = self.config.backoff();
        let mut signals: Option<flume::Receiver<SignalEvent>> = None;
        let mut rejoin_at = Some(tokio::time::Instant::now());
        let cancel = self.cancel.clone();

        loop {
            let signal_rx = signals.clone();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(rejoin_at.unwrap_or_else(tokio::time::Instant::now)), if rejoin_at.is_some() => {
                    match self.signaling.join(self.topic, self.local).await {
                        Ok(rx) => {
                            tracing::info!("joined swarm {}", self.topic.short());
                            signals = Some(rx);
                            rejoin_at = None;
                            backoff = self.config.backoff();
                            self.state.send_replace(SwarmState::Joined);
                        }
                        Err(e) => {
                            let delay = backoff.next().unwrap_or(self.config.reconnect_max_delay);
                            tracing::warn!(
                                "swarm {} degraded, retrying signaling in {:?}: {}",
                                self.topic.short(),
                                delay,
                                e
                            );
                            rejoin_at = Some(tokio::time::Instant::now() + delay);
                            self.state.send_replace(SwarmState::Degraded);
                        }
                    }
                }
                event = recv_signal(signal_rx.as_ref()), if signal_rx.is_some() => {
                    match event {
                        Ok(SignalEvent::PeerJoined(remote)) => self.on_peer_joined(remote),
                        Ok(SignalEvent::PeerLeft(remote)) => self.on_peer_left(remote),
                        Err(_) => {
                            tracing::warn!("lost signaling for swarm {}", self.topic.short());
                            signals = None;
                            rejoin_at = Some(tokio::time::Instant::now());
                            self.state.send_replace(SwarmState::Degraded);
                        }
                    }
                }
                accepted = incoming.recv_async() => match accepted {
                    Ok(incoming) => self.on_incoming(incoming),
                    Err(_) => break,
                },
            }
        }
        self.shutdown().await;
    }

    fn on_peer_joined(&mut self, remote: PublicKey) {
        if !self.config.topology.should_connect(&self.local, &remote)
            || !Topology::is_initiator(&self.local, &remote)
        {
            return;
        }
        if self
            .peers
            .get(&remote)
            .is_some_and(|peer| !peer.task.is_finished())
        {
            return;
        }
        tracing::debug!("dialing {} in swarm {}", remote.short(), self.topic.short());
        self.connections.insert(ConnectionInfo::new(remote, true));
        let cancel = self.cancel.child_token();
        let task = tokio::spawn(dial(self.session_context(remote), cancel.clone()));
        if let Some(old) = self.peers.insert(remote, PeerTask { cancel, task }) {
            old.cancel.cancel();
        }
    }

    fn on_peer_left(&mut self, remote: PublicKey) {
        // keep dialing peers we are connected to; a departure only stops
        // the reconnect loop
        let connected = self
            .connections
            .get(&remote)
            .is_some_and(|info| info.state == ConnectionState::Connected);
        if connected {
            return;
        }
        if let Some(peer) = self.peers.remove(&remote) {
            peer.cancel.cancel();
            self.connections
                .update(&remote, |info| info.transition(ConnectionState::Disconnected));
        }
    }

    fn on_incoming(&mut self, incoming: Incoming) {
        let remote = incoming.remote;
        if !self.config.topology.should_connect(&self.local, &remote) {
            tracing::debug!("refusing {} outside the swarm topology", remote.short());
            incoming.port.close();
            return;
        }
        let mut info = ConnectionInfo::new(remote, false);
        info.transition(ConnectionState::Connected);
        self.connections.insert(info);

        let cancel = self.cancel.child_token();
        let ctx = self.session_context(remote);
        let session_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            run_session(&ctx, incoming.port, false, &session_cancel).await;
            let state = if session_cancel.is_cancelled() {
                ConnectionState::Closed
            } else {
                ConnectionState::Disconnected
            };
            ctx.update(|info| {
                if !info.is_initiator {
                    info.transition(state);
                }
            });
        });
        // a reconnecting initiator replaces its previous connection
        if let Some(old) = self.peers.insert(remote, PeerTask { cancel, task }) {
            old.cancel.cancel();
        }
    }

    fn session_context(&self, remote: PublicKey) -> SessionContext {
        SessionContext {
            topic: self.topic,
            local: self.local,
            remote,
            config: self.config.clone(),
            transport: self.transport.clone(),
            protocol: self.protocol.clone(),
            connections: self.connections.clone(),
        }
    }

    async fn shutdown(&mut self) {
        for (_, peer) in self.peers.drain() {
            peer.cancel.cancel();
            let _ = peer.task.await;
        }
        self.connections
            .update_all(|info| info.transition(ConnectionState::Closed));
        if let Err(e) = self.signaling.leave(self.topic, self.local).await {
            tracing::debug!("failed to leave signaling for {}: {}", self.topic.short(), e);
        }
        self.transport.unlisten(self.topic).await;
        self.state.send_replace(SwarmState::Left);
        tracing::info!("left swarm {}", self.topic.short());
    }
}

async fn recv_signal(rx: Option<&flume::Receiver<SignalEvent>>) -> Result<SignalEvent, flume::RecvError> {
    match rx {
        Some(rx) => rx.recv_async().await,
        None => std::future::pending().await,
    }
}

struct SessionContext {
    topic: PublicKey,
    local: PublicKey,
    remote: PublicKey,
    config: SwarmConfig,
    transport: Arc<dyn Transport>,
    protocol: Arc<dyn SwarmProtocol>,
    connections: Connections,
}

impl SessionContext {
    fn update(&self, f: impl FnOnce(&mut ConnectionInfo)) {
        self.connections.update(&self.remote, f);
    }
}

/// Run the protocol over `port` until it finishes, the port closes or the
/// session is cancelled
async fn run_session(ctx: &SessionContext, port: Arc<dyn Port>, is_initiator: bool, cancel: &CancellationToken) {
    let session = PeerSession {
        topic: ctx.topic,
        local: ctx.local,
        remote: ctx.remote,
        is_initiator,
        port: port.clone(),
    };
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = port.closed() => {}
        result = ctx.protocol.run(session) => {
            if let Err(e) = result {
                tracing::warn!(
                    "session with {} in swarm {} failed: {}",
                    ctx.remote.short(),
                    ctx.topic.short(),
                    e
                );
            }
        }
    }
    port.close();
}

/// Keep a connection to `ctx.remote` up, redialing with backoff
async fn dial(ctx: SessionContext, cancel: CancellationToken) {
    let mut backoff = ctx.config.backoff();
    loop {
        match ctx.transport.connect(ctx.remote, ctx.topic).await {
            Ok(port) => {
                backoff = ctx.config.backoff();
                ctx.update(|info| {
                    info.attempts = 0;
                    info.transition(ConnectionState::Connected);
                });
                run_session(&ctx, port, true, &cancel).await;
                if cancel.is_cancelled() {
                    break;
                }
                tracing::debug!("connection to {} dropped", ctx.remote.short());
            }
            Err(e) => {
                tracing::debug!("dial {} failed: {}", ctx.remote.short(), e);
                ctx.update(|info| info.attempts += 1);
            }
        }

        let delay = backoff.next().unwrap_or(ctx.config.reconnect_max_delay);
        ctx.update(|info| {
            info.transition(ConnectionState::Reconnecting);
            info.reconnect_in = Some(delay);
        });
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    ctx.update(|info| info.transition(ConnectionState::Closed));
}

/// Owns every swarm a node has joined
///
/// One manager per node; swarms are keyed by topic.
pub struct NetworkManager {
    local: PublicKey,
    signaling: Arc<dyn SignalingService>,
    transport: Arc<dyn Transport>,
    config: SwarmConfig,
    swarms: tokio::sync::Mutex<HashMap<PublicKey, Swarm>>,
}

impl std::fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager")
            .field("local", &self.local)
            .field("transport", &self.transport)
            .finish()
    }
}

impl NetworkManager {
    pub fn new(
        signaling: Arc<dyn SignalingService>,
        transport: Arc<dyn Transport>,
        config: SwarmConfig,
    ) -> Self {
        Self {
            local: transport.local_key(),
            signaling,
            transport,
            config,
            swarms: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn local_key(&self) -> PublicKey {
        self.local
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Join `topic` and run `protocol` over every connection
    ///
    /// Returns as soon as the swarm is listening. Signaling failures do not
    /// fail the join; the swarm reports [`SwarmState::Degraded`] and retries.
    ///
    /// # Errors
    /// * `NetworkError::AlreadyJoined` - this node is already in the swarm
    pub async fn join_swarm(
        &self,
        topic: PublicKey,
        protocol: Arc<dyn SwarmProtocol>,
        topology: Option<Topology>,
    ) -> Result<Swarm, NetworkError> {
        let mut swarms = self.swarms.lock().await;
        if swarms.contains_key(&topic) {
            return Err(NetworkError::AlreadyJoined(topic));
        }

        let incoming = self.transport.listen(topic).await?;
        let mut config = self.config.clone();
        if let Some(topology) = topology {
            config.topology = topology;
        }
        let (state_tx, state_rx) = watch::channel(SwarmState::Joining);
        let connections: Connections = Arc::default();
        let cancel = CancellationToken::new();
        let actor = SwarmActor {
            topic,
            local: self.local,
            config,
            signaling: self.signaling.clone(),
            transport: self.transport.clone(),
            protocol,
            state: state_tx,
            connections: connections.clone(),
            cancel: cancel.clone(),
            peers: HashMap::new(),
        };
        let task = tokio::spawn(actor.run(incoming));

        let swarm = Swarm {
            inner: Arc::new(SwarmInner {
                topic,
                state: state_rx,
                connections,
                cancel,
                task: Mutex::new(Some(task)),
            }),
        };
        swarms.insert(topic, swarm.clone());
        Ok(swarm)
    }

    /// Leave `topic`, closing its connections. Leaving an unknown topic is a no-op.
    pub async fn leave_swarm(&self, topic: &PublicKey) {
        let swarm = self.swarms.lock().await.remove(topic);
        if let Some(swarm) = swarm {
            swarm.stop().await;
        }
    }

    pub async fn swarm(&self, topic: &PublicKey) -> Option<Swarm> {
        self.swarms.lock().await.get(topic).cloned()
    }

    pub async fn topics(&self) -> Vec<PublicKey> {
        self.swarms.lock().await.keys().copied().collect()
    }

    /// Leave every swarm
    pub async fn close(&self) {
        let swarms: Vec<Swarm> = self.swarms.lock().await.drain().map(|(_, swarm)| swarm).collect();
        for swarm in swarms {
            swarm.stop().await;
        }
    }
}
