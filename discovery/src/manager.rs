//! Registry of lifecycle managers and dispatch of inbound messages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, warn};

use super::error::{DiscoveryError, DiscoveryResult};
use super::identity::NodeId;
use super::lifecycle::{NodeLifecycleManager, NodeLifecycleState};
use super::messages::Message;
use super::node::Node;
use super::node_table::NodeTable;
use super::time::get_current_time_in_seconds;
use super::transport::MessageSender;

/// Change in the set of bonded peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// The node became `Active`.
    Added(Node),
    /// The node was displaced from the node table.
    Removed(Node),
}

impl NodeEvent {
    pub fn node(&self) -> &Node {
        match self {
            NodeEvent::Added(node) | NodeEvent::Removed(node) => node,
        }
    }
}

pub type SubscriptionId = u64;

/// Observer callback. Runs on the task that caused the event and must not
/// block.
pub type NodeEventHandler = Arc<dyn Fn(&NodeEvent) + Send + Sync>;

/// Owns one lifecycle manager per known peer and fans node events out to
/// observers.
pub struct DiscoveryManager {
    local_id: NodeId,
    node_table: Arc<NodeTable>,
    pong_timeout: Duration,
    managers: DashMap<NodeId, Arc<NodeLifecycleManager>>,
    msg_sender: OnceLock<Arc<dyn MessageSender>>,
    observers: DashMap<SubscriptionId, NodeEventHandler>,
    next_subscription: AtomicU64,
    self_ref: Weak<DiscoveryManager>,
}

impl DiscoveryManager {
    /// The node table must be initialized: its local id is the identity we
    /// refuse to create a manager for.
    pub fn new(node_table: Arc<NodeTable>, pong_timeout: Duration) -> DiscoveryResult<Arc<Self>> {
        let local_id = *node_table.local_id()?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            local_id,
            node_table,
            pong_timeout,
            managers: DashMap::new(),
            msg_sender: OnceLock::new(),
            observers: DashMap::new(),
            next_subscription: AtomicU64::new(0),
            self_ref: self_ref.clone(),
        }))
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn node_table(&self) -> &Arc<NodeTable> {
        &self.node_table
    }

    pub fn pong_timeout(&self) -> Duration {
        self.pong_timeout
    }

    pub fn set_msg_sender(&self, sender: Arc<dyn MessageSender>) -> DiscoveryResult<()> {
        self.msg_sender
            .set(sender)
            .map_err(|_| DiscoveryError::MsgSenderAlreadySet)
    }

    pub(crate) async fn send_message(&self, to: &Node, message: Message) -> DiscoveryResult<()> {
        let sender = self
            .msg_sender
            .get()
            .ok_or(DiscoveryError::MsgSenderNotSet)?;
        sender.send(to, message).await
    }

    /// Get or create the manager of `node`.
    ///
    /// Returns `None` for ourselves and for nodes without a usable endpoint.
    /// `persisted_reputation` only seeds a newly created manager.
    pub fn get_node_lifecycle_manager(
        &self,
        node: &Node,
        persisted_reputation: Option<i64>,
    ) -> Option<Arc<NodeLifecycleManager>> {
        if node.id() == &self.local_id {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Refusing to manage our own node {}", node);
            }
            return None;
        }
        if !node.is_valid() {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Refusing to manage invalid node {}", node);
            }
            return None;
        }

        let reputation = persisted_reputation.unwrap_or(0);
        match self.managers.entry(*node.id()) {
            Entry::Occupied(mut entry) => {
                if entry.get().state() != NodeLifecycleState::Replaced {
                    return Some(Arc::clone(entry.get()));
                }
                let manager = self.create_manager(node, reputation);
                entry.insert(Arc::clone(&manager));
                Some(manager)
            }
            Entry::Vacant(entry) => {
                let manager = self.create_manager(node, reputation);
                entry.insert(Arc::clone(&manager));
                Some(manager)
            }
        }
    }

    fn create_manager(&self, node: &Node, reputation: i64) -> Arc<NodeLifecycleManager> {
        Arc::new(NodeLifecycleManager::new(
            node.clone(),
            self.self_ref.clone(),
            reputation,
            self.pong_timeout,
        ))
    }

    pub fn get_node_lifecycle_managers(&self) -> Vec<Arc<NodeLifecycleManager>> {
        self.managers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn get_node_lifecycle_managers_by<F>(&self, predicate: F) -> Vec<Arc<NodeLifecycleManager>>
    where
        F: Fn(&NodeLifecycleManager) -> bool,
    {
        self.managers
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Dispatch an authenticated message to the manager of its sender.
    pub async fn on_incoming_message(&self, from: &Node, message: Message) -> DiscoveryResult<()> {
        let mut manager = self
            .get_node_lifecycle_manager(from, None)
            .ok_or(DiscoveryError::SelfOperation)?;
        if manager.node().address() != from.address() {
            manager = self.replace_endpoint(&manager, from);
        }

        match message {
            Message::Ping(ping) => manager.process_ping(ping.token).await,
            Message::Pong(pong) => {
                manager.process_pong(pong.ping_token).await;
                Ok(())
            }
            Message::FindNode(find_node) => manager.process_find_node(find_node.target).await,
            Message::Neighbors(neighbors) => {
                manager.process_neighbors(neighbors.nodes).await;
                Ok(())
            }
        }
    }

    /// The peer now sends from another endpoint. A fresh manager for the new
    /// `Node` takes over with the same reputation and bonds again; the old one
    /// is retired.
    fn replace_endpoint(
        &self,
        current: &Arc<NodeLifecycleManager>,
        node: &Node,
    ) -> Arc<NodeLifecycleManager> {
        match self.managers.entry(*node.id()) {
            Entry::Occupied(mut entry) => {
                if !Arc::ptr_eq(entry.get(), current) {
                    // Someone else already moved it
                    return Arc::clone(entry.get());
                }
                let manager = self.create_manager(node, current.reputation());
                entry.insert(Arc::clone(&manager));
                current.retire();
                if log::log_enabled!(log::Level::Debug) {
                    debug!("{} moved from {}", node, current.node().address());
                }
                manager
            }
            Entry::Vacant(entry) => {
                let manager = self.create_manager(node, current.reputation());
                entry.insert(Arc::clone(&manager));
                manager
            }
        }
    }

    /// A node lost its bucket slot to a fresher one.
    pub(crate) fn on_node_evicted(&self, node: &Node) {
        let manager = self
            .managers
            .get(node.id())
            .map(|entry| Arc::clone(entry.value()));
        if let Some(manager) = manager {
            manager.mark_replaced();
        }
    }

    pub fn subscribe(&self, handler: NodeEventHandler) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.observers.insert(id, handler);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.remove(&id).is_some()
    }

    pub fn clear_subscriptions(&self) {
        self.observers.clear();
    }

    pub(crate) fn notify(&self, event: NodeEvent) {
        // Snapshot first so a handler may (un)subscribe without deadlocking
        let handlers: Vec<NodeEventHandler> = self
            .observers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for handler in handlers {
            handler(&event);
        }
    }

    /// Ping active peers that have been silent for `idle`, returning how many
    /// were pinged.
    pub async fn ping_stale_active(&self, idle: Duration) -> usize {
        let cutoff = get_current_time_in_seconds().saturating_sub(idle.as_secs());
        let stale = self.get_node_lifecycle_managers_by(|m| {
            m.state() == NodeLifecycleState::Active && m.last_activity() <= cutoff
        });

        let mut pinged = 0;
        for manager in stale {
            match manager.send_ping().await {
                Ok(()) => pinged += 1,
                Err(e) => {
                    if log::log_enabled!(log::Level::Debug) {
                        debug!("Liveness ping to {} failed: {}", manager.node(), e);
                    }
                }
            }
        }
        pinged
    }

    /// Give every unreachable peer another chance.
    pub async fn reset_unreachable(&self) -> usize {
        let unreachable = self
            .get_node_lifecycle_managers_by(|m| m.state() == NodeLifecycleState::Unreachable);

        let mut reset = 0;
        for manager in unreachable {
            match manager.reset_unreachable_status().await {
                Ok(true) => reset += 1,
                Ok(false) => {}
                Err(e) => {
                    if log::log_enabled!(log::Level::Warn) {
                        warn!("Cannot reset {}: {}", manager.node(), e);
                    }
                }
            }
        }
        reset
    }

    /// The local network went away: every active peer becomes unreachable.
    pub async fn lost_connectivity(&self) -> usize {
        let active =
            self.get_node_lifecycle_managers_by(|m| m.state() == NodeLifecycleState::Active);
        let mut lost = 0;
        for manager in active {
            if manager.lost_connectivity().await {
                lost += 1;
            }
        }
        lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::MAX_FAILED_LIVENESS_CHECKS;
    use crate::node_table::{NodeTable, DEFAULT_STALE_AFTER};
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(Node, Message)>>,
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn send(&self, to: &Node, message: Message) -> DiscoveryResult<()> {
            self.sent.lock().unwrap().push((to.clone(), message));
            Ok(())
        }
    }

    impl RecordingSender {
        fn last_ping_token(&self, to: &NodeId) -> Option<u64> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find_map(|(node, message)| match message {
                    Message::Ping(ping) if node.id() == to => Some(ping.token),
                    _ => None,
                })
        }

        fn count(&self, to: &NodeId, kind: &str) -> usize {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(node, message)| node.id() == to && message.kind() == kind)
                .count()
        }

        /// Endpoint the last message of `kind` was sent to.
        fn last_address(&self, kind: &str) -> Option<SocketAddr> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(_, message)| message.kind() == kind)
                .map(|(node, _)| node.address())
        }
    }

    async fn setup(pong_timeout: Duration) -> (Arc<DiscoveryManager>, Arc<RecordingSender>) {
        let table = Arc::new(NodeTable::new(256, 16, DEFAULT_STALE_AFTER));
        table.initialize(NodeId::new([0u8; 32])).unwrap();
        let manager = DiscoveryManager::new(table, pong_timeout).unwrap();
        let sender = Arc::new(RecordingSender::default());
        manager.set_msg_sender(sender.clone()).unwrap();
        (manager, sender)
    }

    fn peer(last: u8) -> Node {
        let mut bytes = [0u8; 32];
        bytes[0] = 0x80;
        bytes[31] = last;
        Node::new(
            NodeId::new(bytes),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)),
            2126,
        )
    }

    async fn bond(manager: &Arc<DiscoveryManager>, sender: &RecordingSender, node: &Node) {
        let lifecycle = manager.get_node_lifecycle_manager(node, None).unwrap();
        lifecycle.send_ping().await.unwrap();
        let token = sender.last_ping_token(node.id()).unwrap();
        manager
            .on_incoming_message(node, Message::pong(token))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let (manager, _) = setup(Duration::from_secs(5)).await;
        let node = peer(1);

        let first = manager.get_node_lifecycle_manager(&node, Some(50)).unwrap();
        let second = manager.get_node_lifecycle_manager(&node, Some(-50)).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.reputation(), 50);
        assert_eq!(manager.get_node_lifecycle_managers().len(), 1);
    }

    #[tokio::test]
    async fn test_self_and_invalid_nodes_have_no_manager() {
        let (manager, _) = setup(Duration::from_secs(5)).await;
        let local = Node::new(
            *manager.local_id(),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            2126,
        );
        let invalid = Node::new(NodeId::random(), IpAddr::V4(Ipv4Addr::LOCALHOST), 0);

        assert!(manager.get_node_lifecycle_manager(&local, None).is_none());
        assert!(manager.get_node_lifecycle_manager(&invalid, None).is_none());
        assert!(matches!(
            manager.on_incoming_message(&local, Message::ping(1)).await,
            Err(DiscoveryError::SelfOperation)
        ));
    }

    #[tokio::test]
    async fn test_msg_sender_can_only_be_set_once() {
        let (manager, _) = setup(Duration::from_secs(5)).await;
        assert!(matches!(
            manager.set_msg_sender(Arc::new(RecordingSender::default())),
            Err(DiscoveryError::MsgSenderAlreadySet)
        ));
    }

    #[tokio::test]
    async fn test_bonding_adds_to_table_and_notifies_once() {
        let (manager, sender) = setup(Duration::from_secs(5)).await;
        let added = Arc::new(AtomicU64::new(0));
        let counter = added.clone();
        manager.subscribe(Arc::new(move |event: &NodeEvent| {
            if matches!(event, NodeEvent::Added(_)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let node = peer(1);
        bond(&manager, &sender, &node).await;
        let lifecycle = manager.get_node_lifecycle_manager(&node, None).unwrap();
        assert_eq!(lifecycle.state(), NodeLifecycleState::Active);
        assert!(manager.node_table().contains(node.id()).await);
        assert_eq!(lifecycle.reputation(), 1);

        // A liveness round trip keeps it active without a second event
        lifecycle.send_ping().await.unwrap();
        let token = sender.last_ping_token(node.id()).unwrap();
        assert!(lifecycle.process_pong(token).await);
        assert_eq!(added.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsolicited_pong_is_ignored() {
        let (manager, _) = setup(Duration::from_secs(5)).await;
        let node = peer(2);

        manager
            .on_incoming_message(&node, Message::pong(99))
            .await
            .unwrap();
        let lifecycle = manager.get_node_lifecycle_manager(&node, None).unwrap();
        assert_eq!(lifecycle.state(), NodeLifecycleState::Unreached);
        assert_eq!(lifecycle.reputation(), 0);
    }

    #[tokio::test]
    async fn test_inbound_ping_is_answered_and_bonds_back() {
        let (manager, sender) = setup(Duration::from_secs(5)).await;
        let node = peer(3);

        manager
            .on_incoming_message(&node, Message::ping(7))
            .await
            .unwrap();

        assert_eq!(sender.count(node.id(), "PONG"), 1);
        assert_eq!(sender.count(node.id(), "PING"), 1);
        let lifecycle = manager.get_node_lifecycle_manager(&node, None).unwrap();
        assert_eq!(lifecycle.state(), NodeLifecycleState::Bonding);
    }

    #[tokio::test]
    async fn test_find_node_answered_only_when_bonded() {
        let (manager, sender) = setup(Duration::from_secs(5)).await;
        let node = peer(4);

        manager
            .on_incoming_message(&node, Message::find_node(NodeId::random()))
            .await
            .unwrap();
        assert_eq!(sender.count(node.id(), "NEIGHBORS"), 0);
        assert_eq!(sender.count(node.id(), "PING"), 1);

        let token = sender.last_ping_token(node.id()).unwrap();
        manager
            .on_incoming_message(&node, Message::pong(token))
            .await
            .unwrap();
        manager
            .on_incoming_message(&node, Message::find_node(NodeId::random()))
            .await
            .unwrap();
        assert_eq!(sender.count(node.id(), "NEIGHBORS"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bond_timeout_marks_unreachable() {
        let (manager, _) = setup(Duration::from_millis(100)).await;
        let node = peer(5);
        let lifecycle = manager.get_node_lifecycle_manager(&node, None).unwrap();

        lifecycle.send_ping().await.unwrap();
        assert_eq!(lifecycle.state(), NodeLifecycleState::Bonding);

        let state = lifecycle
            .wait_while_bonding(Duration::from_secs(1))
            .await;
        assert_eq!(state, NodeLifecycleState::Unreachable);
        assert!(lifecycle.reputation() < 0);

        // Unreachable nodes are not pinged until reset
        lifecycle.send_ping().await.unwrap();
        assert_eq!(lifecycle.state(), NodeLifecycleState::Unreachable);
        assert_eq!(manager.reset_unreachable().await, 1);
        assert_eq!(lifecycle.state(), NodeLifecycleState::Bonding);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_liveness_failures_mark_unreachable() {
        let (manager, sender) = setup(Duration::from_millis(100)).await;
        let node = peer(6);
        bond(&manager, &sender, &node).await;
        let lifecycle = manager.get_node_lifecycle_manager(&node, None).unwrap();

        for _ in 0..2 {
            lifecycle.send_ping().await.unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
            assert_eq!(lifecycle.state(), NodeLifecycleState::Active);
        }
        lifecycle.send_ping().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(lifecycle.state(), NodeLifecycleState::Unreachable);
        assert!(!manager.node_table().get(node.id()).await.unwrap().bonded);
    }

    #[tokio::test]
    async fn test_replaced_manager_is_superseded() {
        let (manager, sender) = setup(Duration::from_secs(5)).await;
        let removed = Arc::new(AtomicU64::new(0));
        let counter = removed.clone();
        manager.subscribe(Arc::new(move |event: &NodeEvent| {
            if matches!(event, NodeEvent::Removed(_)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let node = peer(7);
        bond(&manager, &sender, &node).await;
        let old = manager.get_node_lifecycle_manager(&node, None).unwrap();

        manager.on_node_evicted(&node);
        assert_eq!(old.state(), NodeLifecycleState::Replaced);
        assert_eq!(removed.load(Ordering::SeqCst), 1);

        let fresh = manager.get_node_lifecycle_manager(&node, None).unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(fresh.state(), NodeLifecycleState::Unreached);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_clear() {
        let (manager, sender) = setup(Duration::from_secs(5)).await;
        let calls = Arc::new(AtomicU64::new(0));

        let counter = calls.clone();
        let id = manager.subscribe(Arc::new(move |_: &NodeEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(manager.unsubscribe(id));
        assert!(!manager.unsubscribe(id));

        let counter = calls.clone();
        manager.subscribe(Arc::new(move |_: &NodeEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        manager.clear_subscriptions();

        bond(&manager, &sender, &peer(8)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_find_node_answered_after_answering_ping() {
        let (manager, sender) = setup(Duration::from_secs(5)).await;
        let node = peer(9);

        // The sender considers us bonded once we answered its PING
        manager
            .on_incoming_message(&node, Message::ping(11))
            .await
            .unwrap();
        manager
            .on_incoming_message(&node, Message::find_node(NodeId::random()))
            .await
            .unwrap();

        assert_eq!(sender.count(node.id(), "NEIGHBORS"), 1);
        let lifecycle = manager.get_node_lifecycle_manager(&node, None).unwrap();
        assert_eq!(lifecycle.state(), NodeLifecycleState::Bonding);
    }

    #[tokio::test]
    async fn test_request_timeouts_count_toward_liveness() {
        let (manager, sender) = setup(Duration::from_secs(5)).await;
        let node = peer(10);
        bond(&manager, &sender, &node).await;
        let lifecycle = manager.get_node_lifecycle_manager(&node, None).unwrap();

        for _ in 1..MAX_FAILED_LIVENESS_CHECKS {
            lifecycle.on_request_timeout().await;
            assert_eq!(lifecycle.state(), NodeLifecycleState::Active);
        }
        assert!(manager.node_table().get(node.id()).await.unwrap().bonded);

        // A reply in between starts the count over
        let receiver = lifecycle.send_find_node(NodeId::random()).await.unwrap();
        assert!(lifecycle.process_neighbors(Vec::new()).await);
        assert!(receiver.await.unwrap().is_empty());
        lifecycle.on_request_timeout().await;
        assert_eq!(lifecycle.state(), NodeLifecycleState::Active);

        for _ in 1..MAX_FAILED_LIVENESS_CHECKS {
            lifecycle.on_request_timeout().await;
        }
        assert_eq!(lifecycle.state(), NodeLifecycleState::Unreachable);
    }

    #[tokio::test]
    async fn test_new_endpoint_takes_over_the_peer() {
        let (manager, sender) = setup(Duration::from_secs(5)).await;
        let node = peer(12);
        bond(&manager, &sender, &node).await;
        let old = manager.get_node_lifecycle_manager(&node, None).unwrap();

        let moved_address = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1)), 3000);
        let moved = Node::from_address(*node.id(), moved_address);
        manager
            .on_incoming_message(&moved, Message::ping(21))
            .await
            .unwrap();

        // Replies and the new bond go to the new endpoint
        assert_eq!(sender.last_address("PONG"), Some(moved_address));
        assert_eq!(sender.last_address("PING"), Some(moved_address));
        let current = manager.get_node_lifecycle_manager(&moved, None).unwrap();
        assert!(!Arc::ptr_eq(&old, &current));
        assert!(old.is_retired());
        assert_eq!(current.node().address(), moved_address);
        assert_eq!(current.reputation(), old.reputation());

        let token = sender.last_ping_token(node.id()).unwrap();
        manager
            .on_incoming_message(&moved, Message::pong(token))
            .await
            .unwrap();
        assert_eq!(current.state(), NodeLifecycleState::Active);
        let entry = manager.node_table().get(node.id()).await.unwrap();
        assert_eq!(entry.node.address(), moved_address);
        assert_eq!(manager.get_node_lifecycle_managers().len(), 1);
    }
}
