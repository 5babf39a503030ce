#![allow(dead_code)]

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use tos_discovery::messages::{open, seal};
use tos_discovery::time::get_current_time_in_seconds;
use tos_discovery::{
    DiscoveryApp, DiscoveryConfig, DiscoveryManager, DiscoveryResult, Message, MemoryNetworkStorage,
    MessageSender, Node, NodeIdentity, TosNodeUrl,
};

/// In-process datagram network keyed by socket address. Datagrams to an
/// unregistered address are lost.
#[derive(Default)]
pub struct LoopbackNetwork {
    peers: DashMap<SocketAddr, Weak<DiscoveryManager>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, address: SocketAddr, manager: &Arc<DiscoveryManager>) {
        self.peers.insert(address, Arc::downgrade(manager));
    }

    pub fn unregister(&self, address: &SocketAddr) {
        self.peers.remove(address);
    }
}

pub struct LoopbackSender {
    network: Arc<LoopbackNetwork>,
    identity: NodeIdentity,
    address: SocketAddr,
}

#[async_trait]
impl MessageSender for LoopbackSender {
    async fn send(&self, to: &Node, message: Message) -> DiscoveryResult<()> {
        let data = seal(&self.identity, &message)?;
        let manager = match self
            .network
            .peers
            .get(&to.address())
            .and_then(|peer| peer.upgrade())
        {
            Some(manager) => manager,
            None => return Ok(()),
        };

        let from = self.address;
        tokio::spawn(async move {
            if let Ok((sender_id, message)) = open(&data, get_current_time_in_seconds()) {
                let _ = manager
                    .on_incoming_message(&Node::from_address(sender_id, from), message)
                    .await;
            }
        });
        Ok(())
    }
}

pub fn address(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Short timeouts so bootstrap and lookups settle quickly.
pub fn test_config(bootnodes: Vec<String>) -> DiscoveryConfig {
    DiscoveryConfig {
        bootstrap_nodes: bootnodes,
        pong_timeout_ms: 200,
        lookup_timeout_ms: 300,
        persistence_interval_ms: 50,
        bootstrap_retry_secs: 1,
        ..Default::default()
    }
}

/// URL of a node nobody listens for.
pub fn unreachable_url(port: u16) -> String {
    TosNodeUrl::new(*NodeIdentity::generate().node_id(), address(port)).to_string()
}

pub struct TestNode {
    pub app: Arc<DiscoveryApp>,
    pub storage: Arc<MemoryNetworkStorage>,
    pub sender: Arc<LoopbackSender>,
    pub node: Node,
}

impl TestNode {
    pub fn new(network: &Arc<LoopbackNetwork>, port: u16, config: DiscoveryConfig) -> Self {
        Self::with_storage(network, port, config, MemoryNetworkStorage::new(), rand::random())
    }

    pub fn with_secret(
        network: &Arc<LoopbackNetwork>,
        port: u16,
        config: DiscoveryConfig,
        secret: [u8; 32],
    ) -> Self {
        Self::with_storage(network, port, config, MemoryNetworkStorage::new(), secret)
    }

    /// Initialized and reachable on the network, but not started.
    pub fn with_storage(
        network: &Arc<LoopbackNetwork>,
        port: u16,
        config: DiscoveryConfig,
        storage: MemoryNetworkStorage,
        secret: [u8; 32],
    ) -> Self {
        let storage = Arc::new(storage);
        let app = DiscoveryApp::new(config, storage.clone()).unwrap();
        app.initialize(NodeIdentity::from_secret_bytes(&secret)).unwrap();

        let address = address(port);
        network.register(address, app.manager().unwrap());

        let identity = NodeIdentity::from_secret_bytes(&secret);
        let node = Node::from_address(*identity.node_id(), address);
        let sender = Arc::new(LoopbackSender {
            network: Arc::clone(network),
            identity,
            address,
        });

        Self {
            app,
            storage,
            sender,
            node,
        }
    }

    pub async fn start(&self) {
        self.app.start_with_sender(self.sender.clone()).await.unwrap();
    }

    /// Attach the sender without starting the loops.
    pub fn connect(&self) {
        self.app
            .manager()
            .unwrap()
            .set_msg_sender(self.sender.clone())
            .unwrap();
    }

    pub fn url(&self) -> String {
        TosNodeUrl::from_node(&self.node).to_string()
    }

    pub async fn bonded_count(&self) -> usize {
        self.app.node_table().bonded_count().await
    }
}

pub fn url_for_secret(secret: &[u8; 32], port: u16) -> String {
    let identity = NodeIdentity::from_secret_bytes(secret);
    TosNodeUrl::new(*identity.node_id(), address(port)).to_string()
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
