//! Per-peer lifecycle: bonding state machine and reputation.
//!
//! ```text
//!  Unreached --ping--> Bonding --pong--> Active
//!                         |                 |
//!                      timeout     liveness failures / lost connectivity
//!                         v                 v
//!                      Unreachable <--------+
//!                         |  ^
//!          reset / inbound|  |
//!                         v  |
//!                       Bonding
//!
//!  Active | Unreachable --bucket eviction--> Replaced (terminal)
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, trace, warn};
use metrics::counter;
use tokio::sync::{oneshot, watch, Mutex};

use super::error::{DiscoveryError, DiscoveryResult};
use super::identity::NodeId;
use super::manager::{DiscoveryManager, NodeEvent};
use super::messages::{Message, MAX_NEIGHBORS};
use super::node::Node;
use super::node_table::AddResult;
use super::time::{get_current_time_in_seconds, TimestampSeconds};

/// Consecutive failed liveness pings before an active node is unreachable.
pub const MAX_FAILED_LIVENESS_CHECKS: u32 = 3;

/// Reputation bounds.
pub const MAX_REPUTATION: i64 = 1_000;
pub const MIN_REPUTATION: i64 = -1_000;

/// Reputation gained per successful exchange.
pub const REPUTATION_SUCCESS_REWARD: i64 = 1;

/// Reputation lost per failed exchange.
pub const REPUTATION_FAILURE_PENALTY: i64 = 3;

/// Idle time over which positive reputation loses half its value.
pub const REPUTATION_DECAY_WINDOW: u64 = 24 * 60 * 60;

/// A failure this recent costs an extra penalty at commit time.
pub const RECENT_FAILURE_WINDOW: u64 = 60 * 60;
pub const RECENT_FAILURE_PENALTY: i64 = 10;

/// How long a PING we answered lets its sender query us, even before we have
/// bonded with it ourselves.
pub const BOND_EXPIRATION: u64 = 24 * 60 * 60;

/// State of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeLifecycleState {
    /// Known but never contacted.
    Unreached,
    /// PING sent, waiting for PONG.
    Bonding,
    /// Bonded, in the node table.
    Active,
    /// Bond failed or liveness lost.
    Unreachable,
    /// Displaced from its bucket by a fresher node.
    Replaced,
}

/// Protocol events driving the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    PingSent,
    PongReceived,
    BondFailed,
    LivenessFailed,
    ConnectivityLost,
    InboundMessage,
    Reset,
    Replaced,
}

impl NodeLifecycleState {
    /// Next state for `event`, `None` when the event does not move the
    /// state machine from here.
    pub fn next(self, event: LifecycleEvent) -> Option<NodeLifecycleState> {
        use LifecycleEvent as E;
        use NodeLifecycleState as S;

        match (self, event) {
            (S::Unreached, E::PingSent) => Some(S::Bonding),
            (S::Bonding, E::PongReceived) => Some(S::Active),
            (S::Bonding, E::BondFailed) => Some(S::Unreachable),
            (S::Active, E::LivenessFailed) | (S::Active, E::ConnectivityLost) => {
                Some(S::Unreachable)
            }
            (S::Unreachable, E::Reset) | (S::Unreachable, E::InboundMessage) => Some(S::Bonding),
            (S::Active, E::Replaced) | (S::Unreachable, E::Replaced) => Some(S::Replaced),
            _ => None,
        }
    }
}

/// Reputation written at commit time.
///
/// Positive standing decays linearly with idle time, losing at most half of
/// its value over `REPUTATION_DECAY_WINDOW`; negative standing never decays.
/// A failure within `RECENT_FAILURE_WINDOW` costs `RECENT_FAILURE_PENALTY`
/// on top, so a recent failure outweighs old successes without wiping a
/// long record.
pub fn compute_persisted_reputation(
    current: i64,
    last_activity: TimestampSeconds,
    last_failure: Option<TimestampSeconds>,
    now: TimestampSeconds,
) -> i64 {
    let idle = now.saturating_sub(last_activity).min(REPUTATION_DECAY_WINDOW) as i64;
    let mut value = if current > 0 {
        current - current.saturating_mul(idle) / (2 * REPUTATION_DECAY_WINDOW as i64)
    } else {
        current
    };

    if let Some(failure) = last_failure {
        if now.saturating_sub(failure) < RECENT_FAILURE_WINDOW {
            value = value.saturating_sub(RECENT_FAILURE_PENALTY);
        }
    }

    value.clamp(MIN_REPUTATION, MAX_REPUTATION)
}

/// Owns the state machine and reputation of one peer.
///
/// State transitions go through a `watch` channel, which serializes them and
/// lets callers await a state without polling.
pub struct NodeLifecycleManager {
    node: Node,
    manager: Weak<DiscoveryManager>,
    state: watch::Sender<NodeLifecycleState>,
    reputation: AtomicI64,
    last_activity: AtomicU64,
    // 0 = never failed
    last_failure: AtomicU64,
    failed_liveness_checks: AtomicU32,
    // 0 = never answered a PING from this peer
    last_ping_answered: AtomicU64,
    // Set once another manager took over this peer
    retired: AtomicBool,
    // Token of the PING awaiting its PONG
    pending_ping: Mutex<Option<u64>>,
    // Outstanding FINDNODE, resolved by the next NEIGHBORS
    pending_find_node: Mutex<Option<oneshot::Sender<Vec<Node>>>>,
    pong_timeout: Duration,
}

impl NodeLifecycleManager {
    pub(crate) fn new(
        node: Node,
        manager: Weak<DiscoveryManager>,
        persisted_reputation: i64,
        pong_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(NodeLifecycleState::Unreached);
        Self {
            node,
            manager,
            state,
            reputation: AtomicI64::new(
                persisted_reputation.clamp(MIN_REPUTATION, MAX_REPUTATION),
            ),
            last_activity: AtomicU64::new(get_current_time_in_seconds()),
            last_failure: AtomicU64::new(0),
            failed_liveness_checks: AtomicU32::new(0),
            last_ping_answered: AtomicU64::new(0),
            retired: AtomicBool::new(false),
            pending_ping: Mutex::new(None),
            pending_find_node: Mutex::new(None),
            pong_timeout,
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn node_id(&self) -> &NodeId {
        self.node.id()
    }

    pub fn state(&self) -> NodeLifecycleState {
        *self.state.borrow()
    }

    pub fn reputation(&self) -> i64 {
        self.reputation.load(Ordering::SeqCst)
    }

    pub fn last_activity(&self) -> TimestampSeconds {
        self.last_activity.load(Ordering::SeqCst)
    }

    pub fn new_persisted_reputation(&self, now: TimestampSeconds) -> i64 {
        let last_failure = match self.last_failure.load(Ordering::SeqCst) {
            0 => None,
            failure => Some(failure),
        };
        compute_persisted_reputation(self.reputation(), self.last_activity(), last_failure, now)
    }

    /// Wait up to `timeout` for a state matching `predicate` and return the
    /// state the node is in afterwards.
    pub async fn wait_for_state<F>(&self, mut predicate: F, timeout: Duration) -> NodeLifecycleState
    where
        F: FnMut(&NodeLifecycleState) -> bool,
    {
        let mut receiver = self.state.subscribe();
        let wait = async {
            loop {
                let reached = predicate(&*receiver.borrow_and_update());
                if reached || receiver.changed().await.is_err() {
                    break;
                }
            }
        };
        let _ = tokio::time::timeout(timeout, wait).await;
        self.state()
    }

    /// Wait for a pending bond to settle either way.
    pub async fn wait_while_bonding(&self, timeout: Duration) -> NodeLifecycleState {
        self.wait_for_state(|state| *state != NodeLifecycleState::Bonding, timeout)
            .await
    }

    fn touch(&self) {
        self.last_activity
            .store(get_current_time_in_seconds(), Ordering::SeqCst);
    }

    fn record_success(&self) {
        self.touch();
        let _ = self
            .reputation
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |value| {
                Some(
                    value
                        .saturating_add(REPUTATION_SUCCESS_REWARD)
                        .min(MAX_REPUTATION),
                )
            });
    }

    fn record_failure(&self) {
        self.last_failure
            .store(get_current_time_in_seconds(), Ordering::SeqCst);
        let _ = self
            .reputation
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |value| {
                Some(
                    value
                        .saturating_sub(REPUTATION_FAILURE_PENALTY)
                        .max(MIN_REPUTATION),
                )
            });
    }

    /// Apply an event to the state machine, returning the transition taken.
    fn transition(&self, event: LifecycleEvent) -> Option<(NodeLifecycleState, NodeLifecycleState)> {
        let mut change = None;
        self.state.send_if_modified(|state| match state.next(event) {
            Some(next) => {
                change = Some((*state, next));
                *state = next;
                true
            }
            None => false,
        });

        if let Some((from, to)) = change {
            if log::log_enabled!(log::Level::Debug) {
                debug!("{} {:?} -> {:?} ({:?})", self.node, from, to, event);
            }
        }
        change
    }

    /// Transition and run the side effects on the node table and observers.
    async fn apply(&self, event: LifecycleEvent) -> bool {
        if self.is_retired() {
            return false;
        }
        let (from, to) = match self.transition(event) {
            Some(change) => change,
            None => return false,
        };

        let manager = match self.manager.upgrade() {
            Some(manager) => manager,
            None => return true,
        };

        match to {
            NodeLifecycleState::Active => {
                match manager.node_table().add_or_refresh(&self.node).await {
                    Ok(AddResult::Replaced(evicted)) => manager.on_node_evicted(&evicted),
                    Ok(AddResult::Rejected) => {
                        if log::log_enabled!(log::Level::Debug) {
                            debug!("Bucket full, {} stays out of the node table", self.node);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if log::log_enabled!(log::Level::Warn) {
                            warn!("Cannot add {} to the node table: {}", self.node, e);
                        }
                    }
                }
                if from != NodeLifecycleState::Active {
                    counter!("discovery_nodes_discovered").increment(1);
                    manager.notify(NodeEvent::Added(self.node.clone()));
                }
            }
            NodeLifecycleState::Unreachable => {
                manager.node_table().mark_unreachable(self.node.id()).await;
            }
            _ => {}
        }
        true
    }

    /// Send a PING: starts bonding from `Unreached`, re-pings while
    /// `Bonding`, checks liveness while `Active`.
    ///
    /// Unreachable nodes are only pinged again after a reset or an inbound
    /// message, and replaced managers never.
    pub async fn send_ping(self: &Arc<Self>) -> DiscoveryResult<()> {
        match self.state() {
            NodeLifecycleState::Unreached => {
                self.apply(LifecycleEvent::PingSent).await;
            }
            NodeLifecycleState::Bonding | NodeLifecycleState::Active => {}
            NodeLifecycleState::Unreachable | NodeLifecycleState::Replaced => return Ok(()),
        }

        let manager = self.manager.upgrade().ok_or(DiscoveryError::MsgSenderNotSet)?;
        let token: u64 = rand::random();
        *self.pending_ping.lock().await = Some(token);

        if let Err(e) = manager.send_message(&self.node, Message::ping(token)).await {
            // A ping that cannot leave the host is a failed exchange
            self.on_pong_timeout(token).await;
            return Err(e);
        }

        let this = Arc::clone(self);
        let timeout = self.pong_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.on_pong_timeout(token).await;
        });
        Ok(())
    }

    async fn on_pong_timeout(&self, token: u64) {
        {
            let mut pending = self.pending_ping.lock().await;
            if *pending != Some(token) {
                // Answered or superseded by a newer ping
                return;
            }
            *pending = None;
        }

        match self.state() {
            NodeLifecycleState::Bonding => {
                self.record_failure();
                self.apply(LifecycleEvent::BondFailed).await;
            }
            NodeLifecycleState::Active => {
                self.record_failure();
                self.count_liveness_failure().await;
            }
            _ => {}
        }
    }

    /// An active peer only becomes unreachable after repeated failures.
    async fn count_liveness_failure(&self) {
        let failures = self
            .failed_liveness_checks
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1);
        if failures >= MAX_FAILED_LIVENESS_CHECKS {
            self.apply(LifecycleEvent::LivenessFailed).await;
        }
    }

    /// Inbound PING: answer it and bond back if we are not bonded yet.
    pub async fn process_ping(self: &Arc<Self>, token: u64) -> DiscoveryResult<()> {
        self.touch();
        let manager = self.manager.upgrade().ok_or(DiscoveryError::MsgSenderNotSet)?;
        manager
            .send_message(&self.node, Message::pong(token))
            .await?;
        self.last_ping_answered
            .store(get_current_time_in_seconds(), Ordering::SeqCst);
        self.bond_on_inbound().await
    }

    async fn bond_on_inbound(self: &Arc<Self>) -> DiscoveryResult<()> {
        match self.state() {
            NodeLifecycleState::Unreached => self.send_ping().await,
            NodeLifecycleState::Unreachable => {
                if self.apply(LifecycleEvent::InboundMessage).await {
                    self.failed_liveness_checks.store(0, Ordering::SeqCst);
                    self.send_ping().await
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Inbound PONG; only the answer to our outstanding PING counts.
    pub async fn process_pong(&self, ping_token: u64) -> bool {
        {
            let mut pending = self.pending_ping.lock().await;
            if *pending != Some(ping_token) {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Ignoring unsolicited PONG from {}", self.node);
                }
                counter!("discovery_packets_rejected").increment(1);
                return false;
            }
            *pending = None;
        }

        self.record_success();
        self.failed_liveness_checks.store(0, Ordering::SeqCst);

        match self.state() {
            NodeLifecycleState::Bonding => {
                self.apply(LifecycleEvent::PongReceived).await;
            }
            NodeLifecycleState::Active => {
                if let Some(manager) = self.manager.upgrade() {
                    if let Ok(AddResult::Replaced(evicted)) =
                        manager.node_table().add_or_refresh(&self.node).await
                    {
                        manager.on_node_evicted(&evicted);
                    }
                }
            }
            _ => {}
        }
        true
    }

    /// Inbound FINDNODE. A NEIGHBORS reply is much larger than the request,
    /// so only peers we bonded with, or whose PING we answered, get one.
    /// Other senders are pinged instead.
    pub async fn process_find_node(self: &Arc<Self>, target: NodeId) -> DiscoveryResult<()> {
        if self.state() != NodeLifecycleState::Active && !self.answered_ping_recently() {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Ignoring FINDNODE from unbonded {}", self.node);
            }
            return self.bond_on_inbound().await;
        }

        self.touch();
        let manager = self.manager.upgrade().ok_or(DiscoveryError::MsgSenderNotSet)?;
        let nodes: Vec<Node> = manager
            .node_table()
            .find_closest(&target, MAX_NEIGHBORS + 1)
            .await
            .into_iter()
            .filter(|n| n != &self.node)
            .collect();

        if log::log_enabled!(log::Level::Trace) {
            trace!("Answering FINDNODE from {} with {} nodes", self.node, nodes.len());
        }
        manager
            .send_message(&self.node, Message::neighbors(nodes))
            .await
    }

    fn answered_ping_recently(&self) -> bool {
        match self.last_ping_answered.load(Ordering::SeqCst) {
            0 => false,
            answered => get_current_time_in_seconds().saturating_sub(answered) < BOND_EXPIRATION,
        }
    }

    /// Inbound NEIGHBORS; only accepted as the answer to our FINDNODE.
    pub async fn process_neighbors(&self, nodes: Vec<Node>) -> bool {
        let sender = self.pending_find_node.lock().await.take();
        match sender {
            Some(sender) => {
                self.record_success();
                self.failed_liveness_checks.store(0, Ordering::SeqCst);
                // The requester may have given up already
                let _ = sender.send(nodes);
                true
            }
            None => {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Ignoring unsolicited NEIGHBORS from {}", self.node);
                }
                counter!("discovery_packets_rejected").increment(1);
                false
            }
        }
    }

    /// Ask this peer for nodes close to `target`. The receiver resolves with
    /// the NEIGHBORS reply.
    pub async fn send_find_node(
        &self,
        target: NodeId,
    ) -> DiscoveryResult<oneshot::Receiver<Vec<Node>>> {
        let manager = self.manager.upgrade().ok_or(DiscoveryError::MsgSenderNotSet)?;
        let (sender, receiver) = oneshot::channel();
        *self.pending_find_node.lock().await = Some(sender);

        manager
            .send_message(&self.node, Message::find_node(target))
            .await?;
        Ok(receiver)
    }

    /// A request to this peer got no answer. Counts as a failed liveness
    /// check for an active peer.
    pub async fn on_request_timeout(&self) {
        self.pending_find_node.lock().await.take();
        self.record_failure();
        match self.state() {
            NodeLifecycleState::Bonding => {
                self.apply(LifecycleEvent::BondFailed).await;
            }
            NodeLifecycleState::Active => self.count_liveness_failure().await,
            _ => {}
        }
    }

    /// The local network went away: an active peer can no longer be trusted
    /// to be reachable.
    pub async fn lost_connectivity(&self) -> bool {
        self.apply(LifecycleEvent::ConnectivityLost).await
    }

    /// Give an unreachable peer another chance, typically after the local
    /// network came back.
    pub async fn reset_unreachable_status(self: &Arc<Self>) -> DiscoveryResult<bool> {
        if !self.apply(LifecycleEvent::Reset).await {
            return Ok(false);
        }
        self.failed_liveness_checks.store(0, Ordering::SeqCst);
        self.send_ping().await?;
        Ok(true)
    }

    /// Another manager took over this peer, after it showed up on a new
    /// endpoint. A retired manager no longer changes state or touches the
    /// node table.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Terminal: this node lost its bucket slot.
    pub(crate) fn mark_replaced(&self) -> bool {
        if self.is_retired() {
            return false;
        }
        if self.transition(LifecycleEvent::Replaced).is_none() {
            return false;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.notify(NodeEvent::Removed(self.node.clone()));
        }
        true
    }
}
