//! Discovery orchestrator: startup, bootstrap, the discovery and persistence
//! loops, and the discovered-nodes stream.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use super::config::DiscoveryConfig;
use super::error::{DiscoveryError, DiscoveryResult};
use super::events::{event_buffer, EventReceiver, ThrottleFlag};
use super::identity::{NodeId, NodeIdentity};
use super::lifecycle::{NodeLifecycleManager, NodeLifecycleState};
use super::locator::NodesLocator;
use super::manager::{DiscoveryManager, NodeEvent, NodeEventHandler, SubscriptionId};
use super::node::Node;
use super::node_table::{NodeTable, DEFAULT_STALE_AFTER};
use super::schedule::DiscoverySchedule;
use super::storage::{NetworkNode, NetworkStorage};
use super::time::get_current_time_in_seconds;
use super::transport::{MessageSender, UdpChannel};
use super::url::TosNodeUrl;

/// Result of one bootstrap attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// This many bootnodes bonded.
    BootnodeReached(usize),
    /// Nothing to bootstrap from. Not fatal: the node waits to be found.
    NoBootnodesConfigured,
    /// No bootnode answered, but a persisted peer did.
    PersistedConnectivity,
    /// Neither a bootnode nor a persisted peer answered.
    NoReachableNode,
}

impl BootstrapOutcome {
    /// Whether startup may proceed to the discovery loops.
    pub fn is_success(&self) -> bool {
        !matches!(self, BootstrapOutcome::NoReachableNode)
    }

    /// Whether any peer was actually reached.
    pub fn reached_any(&self) -> bool {
        matches!(
            self,
            BootstrapOutcome::BootnodeReached(_) | BootstrapOutcome::PersistedConnectivity
        )
    }
}

/// Unsubscribes its observer when dropped.
struct SubscriptionGuard {
    manager: Arc<DiscoveryManager>,
    id: SubscriptionId,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.manager.unsubscribe(self.id);
    }
}

struct DiscoveryStream {
    receiver: EventReceiver,
    delivered: HashSet<NodeId>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    _subscription: SubscriptionGuard,
}

pub struct DiscoveryApp {
    config: DiscoveryConfig,
    storage: Arc<dyn NetworkStorage>,
    node_table: Arc<NodeTable>,
    schedule: DiscoverySchedule,
    throttle: ThrottleFlag,
    identity: OnceLock<Arc<NodeIdentity>>,
    manager: OnceLock<Arc<DiscoveryManager>>,
    bootnodes: OnceLock<Vec<Node>>,
    channel: OnceLock<Arc<UdpChannel>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

/// Identity from the configured private key, or a fresh one.
pub fn load_identity(config: &DiscoveryConfig) -> DiscoveryResult<NodeIdentity> {
    match &config.private_key {
        Some(key) => NodeIdentity::from_secret_hex(key),
        None => Ok(NodeIdentity::generate()),
    }
}

impl DiscoveryApp {
    pub fn new(config: DiscoveryConfig, storage: Arc<dyn NetworkStorage>) -> DiscoveryResult<Arc<Self>> {
        config.validate()?;

        let node_table = Arc::new(NodeTable::new(
            config.bucket_count,
            config.bucket_size,
            DEFAULT_STALE_AFTER,
        ));
        let schedule = DiscoverySchedule::new(
            config.bucket_size,
            config.discovery_interval(),
            config.min_discovery_spacing(),
        );

        Ok(Arc::new(Self {
            config,
            storage,
            node_table,
            schedule,
            throttle: ThrottleFlag::new(),
            identity: OnceLock::new(),
            manager: OnceLock::new(),
            bootnodes: OnceLock::new(),
            channel: OnceLock::new(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Fix the local identity. Errors here are fatal for the subsystem.
    pub fn initialize(&self, identity: NodeIdentity) -> DiscoveryResult<()> {
        let local_id = *identity.node_id();
        self.node_table.initialize(local_id)?;
        let manager = DiscoveryManager::new(Arc::clone(&self.node_table), self.config.pong_timeout())?;

        let mut bootnodes = Vec::new();
        for url in &self.config.bootstrap_nodes {
            match TosNodeUrl::parse(url) {
                Ok(url) if url.node_id == local_id => {
                    if log::log_enabled!(log::Level::Warn) {
                        warn!("Skipping bootnode {}: it is this node", url);
                    }
                }
                Ok(url) => bootnodes.push(url.into_node()),
                Err(e) => {
                    if log::log_enabled!(log::Level::Warn) {
                        warn!("Skipping bootnode '{}': {}", url, e);
                    }
                }
            }
        }

        let already = || DiscoveryError::InvalidState("already initialized".to_string());
        self.manager.set(manager).map_err(|_| already())?;
        self.bootnodes.set(bootnodes).map_err(|_| already())?;
        self.identity
            .set(Arc::new(identity))
            .map_err(|_| already())?;

        if log::log_enabled!(log::Level::Info) {
            info!("Discovery initialized as {}", local_id);
        }
        Ok(())
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn node_table(&self) -> &Arc<NodeTable> {
        &self.node_table
    }

    pub fn throttle(&self) -> &ThrottleFlag {
        &self.throttle
    }

    pub fn local_id(&self) -> DiscoveryResult<&NodeId> {
        self.node_table.local_id()
    }

    pub fn manager(&self) -> DiscoveryResult<&Arc<DiscoveryManager>> {
        self.manager.get().ok_or(DiscoveryError::TableNotInitialized)
    }

    /// Our tosnode:// address once the UDP channel is bound.
    pub fn node_url(&self) -> Option<TosNodeUrl> {
        let channel = self.channel.get()?;
        let address = channel.local_addr().ok()?;
        Some(TosNodeUrl::new(*channel.identity().node_id(), address))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.channel.get()?.local_addr().ok()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    /// Bind the UDP channel and start discovering.
    pub async fn start(self: &Arc<Self>) -> DiscoveryResult<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(DiscoveryError::InvalidState("already started".to_string()));
        }
        let identity = self
            .identity
            .get()
            .cloned()
            .ok_or(DiscoveryError::TableNotInitialized)?;
        let channel = UdpChannel::bind(&self.config, identity).await?;
        self.channel
            .set(Arc::clone(&channel))
            .map_err(|_| DiscoveryError::InvalidState("already started".to_string()))?;

        let manager = Arc::clone(self.manager()?);
        let receive = tokio::spawn(Arc::clone(&channel).run(Arc::clone(&manager), self.cancel.child_token()));
        self.tasks.lock().await.push(receive);

        self.start_with_sender(channel).await
    }

    /// Start discovering over an already running transport.
    pub async fn start_with_sender(self: &Arc<Self>, sender: Arc<dyn MessageSender>) -> DiscoveryResult<()> {
        let manager = Arc::clone(self.manager()?);
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DiscoveryError::InvalidState("already started".to_string()));
        }
        manager.set_msg_sender(sender)?;

        // Bootstrap runs apart from the receive loop, which must keep
        // delivering the pongs it waits for
        let app = Arc::clone(self);
        let main = tokio::spawn(async move {
            if !app.bootstrap().await {
                return;
            }
            tokio::join!(app.discovery_loop(), app.persistence_loop());
        });
        self.tasks.lock().await.push(main);

        if log::log_enabled!(log::Level::Info) {
            info!("Discovery started");
        }
        Ok(())
    }

    /// Stop every loop and flush reputations. Safe to call more than once.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if log::log_enabled!(log::Level::Error) {
                    error!("Discovery task failed while stopping: {}", e);
                }
            }
        }

        if let Some(manager) = self.manager.get() {
            if self.started.load(Ordering::SeqCst) {
                if let Err(e) = self.persist_reputations().await {
                    if log::log_enabled!(log::Level::Error) {
                        error!("Cannot persist reputations on stop: {}", e);
                    }
                }
            }
            manager.clear_subscriptions();
        }

        if log::log_enabled!(log::Level::Info) {
            info!("Discovery stopped");
        }
    }

    /// Seed a peer by hand and start bonding with it. Returns `false` for
    /// ourselves and for invalid nodes.
    pub async fn add_node_to_discovery(&self, node: &Node) -> DiscoveryResult<bool> {
        let lifecycle = match self.manager()?.get_node_lifecycle_manager(node, None) {
            Some(lifecycle) => lifecycle,
            None => return Ok(false),
        };
        Self::ping(&lifecycle).await?;
        Ok(true)
    }

    async fn ping(lifecycle: &Arc<NodeLifecycleManager>) -> DiscoveryResult<()> {
        if lifecycle.state() == NodeLifecycleState::Unreachable {
            lifecycle.reset_unreachable_status().await?;
            Ok(())
        } else {
            lifecycle.send_ping().await
        }
    }

    /// The local network went away: every active peer becomes unreachable.
    /// Returns how many peers were affected.
    pub async fn on_network_lost(&self) -> DiscoveryResult<usize> {
        let lost = self.manager()?.lost_connectivity().await;
        if log::log_enabled!(log::Level::Warn) {
            warn!("Network lost, {} active peers marked unreachable", lost);
        }
        Ok(lost)
    }

    /// The local network is back: bond again with every unreachable peer.
    pub async fn on_network_restored(&self) -> DiscoveryResult<usize> {
        let reset = self.manager()?.reset_unreachable().await;
        if log::log_enabled!(log::Level::Info) {
            info!("Network restored, bonding again with {} peers", reset);
        }
        Ok(reset)
    }

    pub fn subscribe(&self, handler: NodeEventHandler) -> DiscoveryResult<SubscriptionId> {
        Ok(self.manager()?.subscribe(handler))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> DiscoveryResult<bool> {
        Ok(self.manager()?.unsubscribe(id))
    }

    /// Every node that becomes active from now on, each at most once.
    ///
    /// The stream ends when `cancel` fires or the app stops. A consumer that
    /// falls behind loses the newest nodes and throttles lookups until it
    /// catches up.
    pub fn discover_nodes(&self, cancel: CancellationToken) -> DiscoveryResult<BoxStream<'static, Node>> {
        let manager = Arc::clone(self.manager()?);
        let (sender, receiver) = event_buffer(self.config.event_buffer_size, self.throttle.clone());

        let id = manager.subscribe(Arc::new(move |event: &NodeEvent| {
            if let NodeEvent::Added(node) = event {
                sender.try_push(node.clone());
            }
        }));

        let state = DiscoveryStream {
            receiver,
            delivered: HashSet::new(),
            cancel,
            shutdown: self.cancel.clone(),
            _subscription: SubscriptionGuard { manager, id },
        };

        Ok(stream::unfold(state, |mut state| async move {
            loop {
                let node = tokio::select! {
                    _ = state.cancel.cancelled() => break,
                    _ = state.shutdown.cancelled() => break,
                    node = state.receiver.pop() => node?,
                };
                if state.delivered.insert(*node.id()) {
                    return Some((node, state));
                }
            }
            if log::log_enabled!(log::Level::Debug) {
                debug!(
                    "Discovered-nodes stream closed with {} nodes undelivered",
                    state.receiver.len()
                );
            }
            None
        })
        .boxed())
    }

    /// One bootstrap attempt: register persisted peers, ping them and the
    /// bootnodes, and wait up to one pong timeout for any of them to bond.
    pub async fn initialize_bootnodes(&self) -> DiscoveryResult<BootstrapOutcome> {
        let manager = self.manager()?;

        let mut persisted = Vec::new();
        match self.storage.get_persisted_nodes().await {
            Ok(nodes) => {
                for record in nodes {
                    match manager.get_node_lifecycle_manager(&record.to_node(), Some(record.reputation)) {
                        Some(lifecycle) => persisted.push(lifecycle),
                        None => {
                            if log::log_enabled!(log::Level::Debug) {
                                debug!("Skipping persisted peer {}", record.to_node());
                            }
                        }
                    }
                }
            }
            Err(e) => {
                if log::log_enabled!(log::Level::Warn) {
                    warn!("Cannot load persisted peers: {}", e);
                }
            }
        }

        let bootnodes: Vec<Arc<NodeLifecycleManager>> = self
            .bootnodes
            .get()
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|node| manager.get_node_lifecycle_manager(node, None))
                    .collect()
            })
            .unwrap_or_default();

        for lifecycle in bootnodes.iter().chain(persisted.iter()) {
            if lifecycle.state() == NodeLifecycleState::Active {
                continue;
            }
            if let Err(e) = Self::ping(lifecycle).await {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Bootstrap ping to {} failed: {}", lifecycle.node(), e);
                }
            }
        }

        let is_active = |m: &Arc<NodeLifecycleManager>| m.state() == NodeLifecycleState::Active;
        let pong_timeout = self.config.pong_timeout();
        let step = (pong_timeout / 100).max(Duration::from_millis(1));
        let deadline = Instant::now() + pong_timeout;
        while !bootnodes.iter().any(is_active) && !persisted.iter().any(is_active) {
            if Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(step) => {}
            }
        }

        let reached = bootnodes.iter().filter(|m| is_active(*m)).count();
        let outcome = if reached > 0 {
            BootstrapOutcome::BootnodeReached(reached)
        } else if persisted.iter().any(is_active) {
            BootstrapOutcome::PersistedConnectivity
        } else if bootnodes.is_empty() {
            BootstrapOutcome::NoBootnodesConfigured
        } else {
            BootstrapOutcome::NoReachableNode
        };
        Ok(outcome)
    }

    /// Retry bootstrap until it succeeds. Returns `false` when cancelled.
    async fn bootstrap(&self) -> bool {
        loop {
            match self.initialize_bootnodes().await {
                Ok(outcome) if outcome.is_success() => {
                    if log::log_enabled!(log::Level::Info) {
                        info!("Bootstrap finished: {:?}", outcome);
                    }
                    return true;
                }
                Ok(outcome) => {
                    if log::log_enabled!(log::Level::Warn) {
                        warn!(
                            "Bootstrap failed ({:?}), retrying in {:?}",
                            outcome,
                            self.config.bootstrap_retry()
                        );
                    }
                }
                Err(e) => {
                    if log::log_enabled!(log::Level::Warn) {
                        warn!("Bootstrap error: {}", e);
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = sleep(self.config.bootstrap_retry()) => {}
            }
        }
    }

    async fn discovery_loop(&self) {
        let manager = match self.manager() {
            Ok(manager) => Arc::clone(manager),
            Err(_) => return,
        };
        let locator = NodesLocator::new(
            Arc::clone(&manager),
            self.throttle.clone(),
            self.config.lookup_rounds,
            self.config.lookup_timeout(),
        );

        let mut scheduled = Instant::now();
        while !self.cancel.is_cancelled() {
            let self_lookup = locator.locate_nodes(None, &self.cancel).await;
            let random_lookup = locator
                .locate_nodes(Some(NodeId::random()), &self.cancel)
                .await;
            let pinged = manager
                .ping_stale_active(self.config.discovery_interval())
                .await;

            let bonded = self.node_table.bonded_count().await;
            if log::log_enabled!(log::Level::Debug) {
                debug!(
                    "Discovery tick: self {:?}, random {:?}, {} liveness pings, {} bonded",
                    self_lookup, random_lookup, pinged, bonded
                );
            }

            let interval = self.schedule.interval_for(bonded);
            scheduled = self.schedule.next_tick(scheduled, Instant::now(), interval);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep_until(scheduled) => {}
            }
        }
    }

    async fn persistence_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.persistence_interval());
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.persist_reputations().await {
                        if log::log_enabled!(log::Level::Warn) {
                            warn!("Cannot persist reputations: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Stage the current reputation of every contacted peer and commit if
    /// anything changed. Returns whether a commit happened.
    pub async fn persist_reputations(&self) -> DiscoveryResult<bool> {
        let manager = self.manager()?;
        let now = get_current_time_in_seconds();

        let records: Vec<NetworkNode> = manager
            .get_node_lifecycle_managers_by(|m| {
                m.state() != NodeLifecycleState::Unreached || m.reputation() != 0
            })
            .iter()
            .map(|m| NetworkNode::from_node(m.node(), m.new_persisted_reputation(now)))
            .collect();

        self.storage.update_nodes(records).await?;
        if !self.storage.any_pending_change().await {
            return Ok(false);
        }

        self.storage.commit().await?;
        self.storage.start_batch().await?;
        if log::log_enabled!(log::Level::Debug) {
            debug!("Committed peer reputations");
        }
        Ok(true)
    }
}
