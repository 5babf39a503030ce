use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use metrics::counter;
use rocksdb::{ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options, WriteBatch};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::spawn_blocking;

use super::error::{DiscoveryError, DiscoveryResult};
use super::identity::NodeId;
use super::node::Node;

// Type alias for thread-safe RocksDB
type DB = DBWithThreadMode<MultiThreaded>;

const NODES_CF: &str = "discovery_nodes";

/// Persisted peer record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkNode {
    pub id: NodeId,
    pub host: IpAddr,
    pub port: u16,
    pub reputation: i64,
}

impl NetworkNode {
    pub fn from_node(node: &Node, reputation: i64) -> Self {
        Self {
            id: *node.id(),
            host: node.host(),
            port: node.port(),
            reputation,
        }
    }

    pub fn to_node(&self) -> Node {
        Node::new(self.id, self.host, self.port)
    }
}

/// Persistence of peers and their reputation.
///
/// Writes are staged by `update_nodes` and only reach the backend on
/// `commit`. Staging a record identical to the last committed one is a
/// no-op, so `any_pending_change` tells whether a commit is worth doing.
#[async_trait]
pub trait NetworkStorage: Send + Sync {
    /// Load every persisted peer. Records that cannot be decoded are skipped.
    async fn get_persisted_nodes(&self) -> DiscoveryResult<Vec<NetworkNode>>;

    async fn update_nodes(&self, nodes: Vec<NetworkNode>) -> DiscoveryResult<()>;

    async fn any_pending_change(&self) -> bool;

    async fn commit(&self) -> DiscoveryResult<()>;

    /// Open a fresh staging batch.
    async fn start_batch(&self) -> DiscoveryResult<()>;
}

// Tracks what differs from the last committed snapshot
#[derive(Default)]
struct ChangeTracker {
    committed: HashMap<NodeId, NetworkNode>,
    pending: HashMap<NodeId, NetworkNode>,
}

impl ChangeTracker {
    fn load(&mut self, nodes: &[NetworkNode]) {
        for node in nodes {
            self.committed.insert(node.id, node.clone());
        }
    }

    fn stage(&mut self, nodes: Vec<NetworkNode>) {
        for node in nodes {
            if self.committed.get(&node.id) == Some(&node) {
                // Back to the committed value
                self.pending.remove(&node.id);
            } else {
                self.pending.insert(node.id, node);
            }
        }
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn mark_committed(&mut self) {
        self.committed.extend(self.pending.drain());
    }
}

/// RocksDB backed peer storage.
pub struct RocksNetworkStorage {
    db: Arc<DB>,
    tracker: Mutex<ChangeTracker>,
}

impl RocksNetworkStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> DiscoveryResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        // The peer set is small
        opts.set_write_buffer_size(64 * 1024);
        opts.set_max_write_buffer_number(2);

        let cf_descriptor = ColumnFamilyDescriptor::new(NODES_CF, Options::default());
        let db = DB::open_cf_descriptors(&opts, path.as_ref(), vec![cf_descriptor])?;

        if log::log_enabled!(log::Level::Info) {
            info!("Opened peer database at {}", path.as_ref().display());
        }

        Ok(Self {
            db: Arc::new(db),
            tracker: Mutex::new(ChangeTracker::default()),
        })
    }

    fn missing_cf() -> DiscoveryError {
        DiscoveryError::InvalidState(format!("missing column family {}", NODES_CF))
    }

    async fn flush(&self) -> DiscoveryResult<()> {
        let db = Arc::clone(&self.db);
        spawn_blocking(move || db.flush())
            .await
            .map_err(|e| DiscoveryError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        Ok(())
    }
}

#[async_trait]
impl NetworkStorage for RocksNetworkStorage {
    async fn get_persisted_nodes(&self) -> DiscoveryResult<Vec<NetworkNode>> {
        let nodes = {
            let cf = self.db.cf_handle(NODES_CF).ok_or_else(Self::missing_cf)?;
            let mut nodes = Vec::new();
            for item in self.db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
                let (key, value) = item?;
                match bincode::deserialize::<NetworkNode>(&value) {
                    Ok(node) if node.id.as_bytes()[..] == key[..] => nodes.push(node),
                    Ok(_) => {
                        if log::log_enabled!(log::Level::Warn) {
                            warn!("Skipping persisted peer {} stored under a foreign key", hex::encode(&key));
                        }
                    }
                    Err(e) => {
                        if log::log_enabled!(log::Level::Warn) {
                            warn!("Skipping malformed persisted peer {}: {}", hex::encode(&key), e);
                        }
                    }
                }
            }
            nodes
        };

        self.tracker.lock().await.load(&nodes);
        Ok(nodes)
    }

    async fn update_nodes(&self, nodes: Vec<NetworkNode>) -> DiscoveryResult<()> {
        self.tracker.lock().await.stage(nodes);
        Ok(())
    }

    async fn any_pending_change(&self) -> bool {
        self.tracker.lock().await.has_pending()
    }

    async fn commit(&self) -> DiscoveryResult<()> {
        {
            let mut tracker = self.tracker.lock().await;
            if !tracker.has_pending() {
                return Ok(());
            }

            let cf = self.db.cf_handle(NODES_CF).ok_or_else(Self::missing_cf)?;
            let mut batch = WriteBatch::default();
            for node in tracker.pending.values() {
                batch.put_cf(&cf, node.id.as_bytes(), bincode::serialize(node)?);
            }
            self.db.write(batch)?;
            tracker.mark_committed();
        }

        self.flush().await?;
        counter!("discovery_persistence_commits").increment(1);
        Ok(())
    }

    async fn start_batch(&self) -> DiscoveryResult<()> {
        self.tracker.lock().await.pending.clear();
        Ok(())
    }
}

/// Peer storage that lives as long as the process.
#[derive(Default)]
pub struct MemoryNetworkStorage {
    nodes: Mutex<HashMap<NodeId, NetworkNode>>,
    tracker: Mutex<ChangeTracker>,
    commits: AtomicUsize,
}

impl MemoryNetworkStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate, as if the nodes had been committed by an earlier run.
    pub fn with_nodes(nodes: Vec<NetworkNode>) -> Self {
        Self {
            nodes: Mutex::new(nodes.into_iter().map(|n| (n.id, n)).collect()),
            ..Default::default()
        }
    }

    /// Commits that actually wrote something.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub async fn get(&self, id: &NodeId) -> Option<NetworkNode> {
        self.nodes.lock().await.get(id).cloned()
    }
}

#[async_trait]
impl NetworkStorage for MemoryNetworkStorage {
    async fn get_persisted_nodes(&self) -> DiscoveryResult<Vec<NetworkNode>> {
        let nodes: Vec<NetworkNode> = self.nodes.lock().await.values().cloned().collect();
        self.tracker.lock().await.load(&nodes);
        Ok(nodes)
    }

    async fn update_nodes(&self, nodes: Vec<NetworkNode>) -> DiscoveryResult<()> {
        self.tracker.lock().await.stage(nodes);
        Ok(())
    }

    async fn any_pending_change(&self) -> bool {
        self.tracker.lock().await.has_pending()
    }

    async fn commit(&self) -> DiscoveryResult<()> {
        let mut tracker = self.tracker.lock().await;
        if !tracker.has_pending() {
            return Ok(());
        }

        let mut nodes = self.nodes.lock().await;
        for node in tracker.pending.values() {
            nodes.insert(node.id, node.clone());
        }
        tracker.mark_committed();

        self.commits.fetch_add(1, Ordering::SeqCst);
        counter!("discovery_persistence_commits").increment(1);
        Ok(())
    }

    async fn start_batch(&self) -> DiscoveryResult<()> {
        self.tracker.lock().await.pending.clear();
        Ok(())
    }
}
