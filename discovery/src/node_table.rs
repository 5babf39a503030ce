//! Kademlia-style node table.
//!
//! The node table organizes bonded nodes into buckets based on their XOR
//! distance from the local node's ID. Each bucket holds at most
//! `bucket_size` entries in LRU order (most recently seen at the back).

use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use super::error::{DiscoveryError, DiscoveryResult};
use super::identity::{common_prefix_bits, compare_distance, NodeId};
use super::node::Node;

/// Alpha parameter for parallel lookups.
pub const ALPHA: usize = 3;

/// How long an entry may go unseen before it can be evicted in favour of a
/// fresher node.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30 * 60);

/// Entry in a bucket.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub node: Node,
    /// When this entry was last seen.
    pub last_seen: Instant,
    /// Cleared when the node is marked unreachable.
    pub bonded: bool,
}

impl NodeEntry {
    fn new(node: Node, now: Instant) -> Self {
        Self {
            node,
            last_seen: now,
            bonded: true,
        }
    }
}

/// Result of adding a node to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddResult {
    /// Node was inserted in a bucket with free space.
    Inserted,
    /// Node was already present and moved to the most-recently-seen slot.
    Refreshed,
    /// Node was inserted by evicting the contained stale node.
    Replaced(Node),
    /// Bucket is full of fresh entries.
    Rejected,
    /// Cannot add the local node.
    SelfNode,
}

impl AddResult {
    /// Whether the node now sits in its bucket.
    pub fn had_capacity(&self) -> bool {
        matches!(
            self,
            AddResult::Inserted | AddResult::Refreshed | AddResult::Replaced(_)
        )
    }
}

#[derive(Debug)]
struct Bucket {
    nodes: VecDeque<NodeEntry>,
    capacity: usize,
}

impl Bucket {
    fn new(capacity: usize) -> Self {
        Self {
            nodes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn find_index(&self, node_id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|e| e.node.id() == node_id)
    }

    fn bonded_count(&self) -> usize {
        self.nodes.iter().filter(|e| e.bonded).count()
    }

    fn add_or_refresh(&mut self, node: Node, now: Instant, stale_after: Duration) -> AddResult {
        if let Some(index) = self.find_index(node.id()) {
            if let Some(mut existing) = self.nodes.remove(index) {
                // Endpoint may have changed
                existing.node = node;
                existing.last_seen = now;
                existing.bonded = true;
                self.nodes.push_back(existing);
            }
            return AddResult::Refreshed;
        }

        if self.nodes.len() < self.capacity {
            self.nodes.push_back(NodeEntry::new(node, now));
            return AddResult::Inserted;
        }

        // Demoted entries go first, then the least recently seen one if stale
        let victim = self.nodes.iter().position(|e| !e.bonded).or_else(|| {
            self.nodes
                .front()
                .filter(|oldest| now.saturating_duration_since(oldest.last_seen) >= stale_after)
                .map(|_| 0)
        });

        match victim.and_then(|index| self.nodes.remove(index)) {
            Some(evicted) => {
                self.nodes.push_back(NodeEntry::new(node, now));
                AddResult::Replaced(evicted.node)
            }
            None => AddResult::Rejected,
        }
    }

    fn mark_unreachable(&mut self, node_id: &NodeId) -> bool {
        match self.find_index(node_id).and_then(|i| self.nodes.get_mut(i)) {
            Some(entry) => {
                entry.bonded = false;
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, node_id: &NodeId) -> Option<NodeEntry> {
        self.find_index(node_id).and_then(|i| self.nodes.remove(i))
    }
}

/// Distance-bucketed registry of bonded nodes.
///
/// Created once with its sizing, then bound to the local identity with
/// [`NodeTable::initialize`]. Each bucket has its own lock so lookups read
/// concurrently while insertions and evictions are serialized per bucket.
pub struct NodeTable {
    local_id: OnceLock<NodeId>,
    buckets: Vec<RwLock<Bucket>>,
    bucket_size: usize,
    stale_after: Duration,
}

impl NodeTable {
    pub fn new(bucket_count: usize, bucket_size: usize, stale_after: Duration) -> Self {
        let buckets = (0..bucket_count.max(1))
            .map(|_| RwLock::new(Bucket::new(bucket_size)))
            .collect();

        Self {
            local_id: OnceLock::new(),
            buckets,
            bucket_size,
            stale_after,
        }
    }

    /// Fix the identity used for distance computation.
    pub fn initialize(&self, local_id: NodeId) -> DiscoveryResult<()> {
        self.local_id
            .set(local_id)
            .map_err(|_| DiscoveryError::TableAlreadyInitialized)
    }

    pub fn local_id(&self) -> DiscoveryResult<&NodeId> {
        self.local_id.get().ok_or(DiscoveryError::TableNotInitialized)
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket of a node: position of the highest differing bit, with every
    /// distance closer than the table resolves folded into bucket 0.
    fn bucket_index(&self, node_id: &NodeId) -> Option<usize> {
        let local_id = self.local_id.get()?;
        let last = self.buckets.len() - 1;
        common_prefix_bits(local_id, node_id).map(|bits| last - bits.min(last))
    }

    /// Insert a bonded node or move it to the most-recently-seen position.
    pub async fn add_or_refresh(&self, node: &Node) -> DiscoveryResult<AddResult> {
        self.add_or_refresh_at(node, Instant::now()).await
    }

    pub async fn add_or_refresh_at(&self, node: &Node, now: Instant) -> DiscoveryResult<AddResult> {
        if self.local_id()? == node.id() {
            return Ok(AddResult::SelfNode);
        }
        let index = match self.bucket_index(node.id()) {
            Some(index) => index,
            None => return Ok(AddResult::SelfNode),
        };

        let mut bucket = self.buckets[index].write().await;
        Ok(bucket.add_or_refresh(node.clone(), now, self.stale_after))
    }

    /// Demote a node: it stays in its bucket but is no longer returned by
    /// lookups and is the first eviction candidate.
    pub async fn mark_unreachable(&self, node_id: &NodeId) -> bool {
        match self.bucket_index(node_id) {
            Some(index) => self.buckets[index].write().await.mark_unreachable(node_id),
            None => false,
        }
    }

    /// Remove a node from the table.
    pub async fn evict(&self, node_id: &NodeId) -> Option<NodeEntry> {
        match self.bucket_index(node_id) {
            Some(index) => self.buckets[index].write().await.remove(node_id),
            None => None,
        }
    }

    pub async fn get(&self, node_id: &NodeId) -> Option<NodeEntry> {
        let index = self.bucket_index(node_id)?;
        let bucket = self.buckets[index].read().await;
        bucket.find_index(node_id).and_then(|i| bucket.nodes.get(i).cloned())
    }

    pub async fn contains(&self, node_id: &NodeId) -> bool {
        self.get(node_id).await.is_some()
    }

    /// Up to `count` bonded nodes ordered by ascending distance to `target`,
    /// ties broken by most recently seen first.
    pub async fn find_closest(&self, target: &NodeId, count: usize) -> Vec<Node> {
        let mut candidates = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.read().await;
            candidates.extend(
                bucket
                    .nodes
                    .iter()
                    .filter(|e| e.bonded)
                    .map(|e| (e.node.clone(), e.last_seen)),
            );
        }

        candidates.sort_by(|(a, a_seen), (b, b_seen)| {
            compare_distance(target, a.id(), b.id()).then_with(|| b_seen.cmp(a_seen))
        });
        candidates.truncate(count);
        candidates.into_iter().map(|(node, _)| node).collect()
    }

    /// Total bonded nodes across all buckets.
    pub async fn bonded_count(&self) -> usize {
        let mut count: usize = 0;
        for bucket in &self.buckets {
            count = count.saturating_add(bucket.read().await.bonded_count());
        }
        count
    }

    /// Bonded entry count of every bucket, indexed by bucket.
    pub async fn bucket_bonded_counts(&self) -> Vec<usize> {
        let mut counts = Vec::with_capacity(self.buckets.len());
        for bucket in &self.buckets {
            counts.push(bucket.read().await.bonded_count());
        }
        counts
    }

    /// Number of entries, bonded or not.
    pub async fn len(&self) -> usize {
        let mut count: usize = 0;
        for bucket in &self.buckets {
            count = count.saturating_add(bucket.read().await.nodes.len());
        }
        count
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn node(id: NodeId) -> Node {
        Node::new(id, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 2126)
    }

    fn random_node() -> Node {
        node(NodeId::random())
    }

    /// Node in the farthest bucket of an all-zero local ID.
    fn far_node(tag: u8) -> Node {
        let mut bytes = [0u8; 32];
        bytes[0] = 0x80;
        bytes[31] = tag;
        node(NodeId::new(bytes))
    }

    fn table(bucket_count: usize, bucket_size: usize, stale_after: Duration) -> NodeTable {
        let table = NodeTable::new(bucket_count, bucket_size, stale_after);
        table.initialize(NodeId::new([0u8; 32])).unwrap();
        table
    }

    #[tokio::test]
    async fn test_initialize_twice_fails() {
        let table = NodeTable::new(256, 16, DEFAULT_STALE_AFTER);
        assert!(matches!(
            table.add_or_refresh(&random_node()).await,
            Err(DiscoveryError::TableNotInitialized)
        ));

        table.initialize(NodeId::random()).unwrap();
        assert!(matches!(
            table.initialize(NodeId::random()),
            Err(DiscoveryError::TableAlreadyInitialized)
        ));
    }

    #[tokio::test]
    async fn test_add_self_is_refused() {
        let table = table(256, 16, DEFAULT_STALE_AFTER);
        let result = table.add_or_refresh(&node(NodeId::new([0u8; 32]))).await.unwrap();
        assert_eq!(result, AddResult::SelfNode);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_refresh_moves_to_back() {
        let table = table(256, 16, DEFAULT_STALE_AFTER);
        let first = far_node(1);
        let second = far_node(2);

        assert_eq!(table.add_or_refresh(&first).await.unwrap(), AddResult::Inserted);
        assert_eq!(table.add_or_refresh(&second).await.unwrap(), AddResult::Inserted);
        assert_eq!(table.add_or_refresh(&first).await.unwrap(), AddResult::Refreshed);

        let bucket = table.buckets[255].read().await;
        assert_eq!(bucket.nodes.back().map(|e| e.node.clone()), Some(first));
        assert_eq!(table.len().await, 2);
    }

    #[tokio::test]
    async fn test_full_bucket_rejects_fresh_entries() {
        let table = table(256, 2, DEFAULT_STALE_AFTER);
        table.add_or_refresh(&far_node(1)).await.unwrap();
        table.add_or_refresh(&far_node(2)).await.unwrap();

        let result = table.add_or_refresh(&far_node(3)).await.unwrap();
        assert_eq!(result, AddResult::Rejected);
        assert!(!result.had_capacity());
        assert_eq!(table.len().await, 2);
    }

    #[tokio::test]
    async fn test_full_bucket_evicts_stale_oldest() {
        let table = table(256, 2, Duration::from_secs(60));
        let start = Instant::now();
        table.add_or_refresh_at(&far_node(1), start).await.unwrap();
        table.add_or_refresh_at(&far_node(2), start + Duration::from_secs(50)).await.unwrap();

        let later = start + Duration::from_secs(61);
        let result = table.add_or_refresh_at(&far_node(3), later).await.unwrap();
        assert_eq!(result, AddResult::Replaced(far_node(1)));
        assert!(!table.contains(far_node(1).id()).await);
        assert!(table.contains(far_node(3).id()).await);
    }

    #[tokio::test]
    async fn test_demoted_entry_is_evicted_first() {
        let table = table(256, 2, DEFAULT_STALE_AFTER);
        table.add_or_refresh(&far_node(1)).await.unwrap();
        table.add_or_refresh(&far_node(2)).await.unwrap();
        assert!(table.mark_unreachable(far_node(2).id()).await);
        assert_eq!(table.bonded_count().await, 1);

        let result = table.add_or_refresh(&far_node(3)).await.unwrap();
        assert_eq!(result, AddResult::Replaced(far_node(2)));
        assert_eq!(table.bonded_count().await, 2);
    }

    #[tokio::test]
    async fn test_find_closest_skips_demoted_and_evicted() {
        let table = table(256, 16, DEFAULT_STALE_AFTER);
        let nodes: Vec<Node> = (1..=5).map(far_node).collect();
        for n in &nodes {
            table.add_or_refresh(n).await.unwrap();
        }
        table.mark_unreachable(nodes[0].id()).await;
        assert!(table.evict(nodes[1].id()).await.is_some());

        let closest = table.find_closest(nodes[4].id(), 16).await;
        assert_eq!(closest.len(), 3);
        assert_eq!(closest[0], nodes[4]);
        assert!(!closest.contains(&nodes[0]));
        assert!(!closest.contains(&nodes[1]));
    }

    #[tokio::test]
    async fn test_300_nodes_in_8_buckets() {
        let table = NodeTable::new(8, 16, DEFAULT_STALE_AFTER);
        table.initialize(NodeId::random()).unwrap();

        for _ in 0..300 {
            table.add_or_refresh(&random_node()).await.unwrap();
        }

        let counts = table.bucket_bonded_counts().await;
        assert_eq!(counts.len(), 8);
        assert!(counts.iter().all(|count| *count <= 16));
        assert!(counts.iter().any(|count| *count == 16));
    }

    proptest! {
        #[test]
        fn prop_find_closest_sorted_and_bounded(
            ids in proptest::collection::vec(any::<[u8; 32]>(), 0..64),
            target in any::<[u8; 32]>(),
            count in 0usize..40,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let table = NodeTable::new(256, 4, DEFAULT_STALE_AFTER);
                table.initialize(NodeId::new([0x55; 32])).unwrap();
                for id in &ids {
                    table.add_or_refresh(&node(NodeId::new(*id))).await.unwrap();
                }

                let target = NodeId::new(target);
                let closest = table.find_closest(&target, count).await;
                prop_assert!(closest.len() <= count);
                prop_assert!(closest.len() <= table.bonded_count().await);
                for pair in closest.windows(2) {
                    prop_assert_ne!(
                        compare_distance(&target, pair[0].id(), pair[1].id()),
                        std::cmp::Ordering::Greater
                    );
                }
                Ok(())
            })?;
        }
    }
}
