//! Iterative Kademlia lookup.
//!
//! Each round queries up to `ALPHA` of the closest unqueried candidates in
//! parallel and folds the returned nodes into the best-`k` candidate set.
//!
//! A round that brings nothing closer does not end the lookup on its own.
//! The lookup keeps querying until every one of the `k` closest candidates
//! has been asked, so a round of slow or empty replies cannot leave close
//! nodes unvisited. It also ends at the round limit, on cancellation, or
//! while the consumer asks for throttling.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, trace};
use metrics::counter;
use tokio_util::sync::CancellationToken;

use super::events::ThrottleFlag;
use super::identity::{compare_distance, NodeId};
use super::lifecycle::NodeLifecycleState;
use super::manager::DiscoveryManager;
use super::node::Node;
use super::node_table::ALPHA;

/// Summary of a lookup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupOutcome {
    /// Rounds actually issued.
    pub rounds: usize,
    /// Candidates sent a FINDNODE (or a bond attempt).
    pub queried: usize,
    /// Nodes learned that were not candidates before.
    pub discovered: usize,
}

pub struct NodesLocator {
    manager: Arc<DiscoveryManager>,
    throttle: ThrottleFlag,
    max_rounds: usize,
    lookup_timeout: Duration,
}

impl NodesLocator {
    pub fn new(
        manager: Arc<DiscoveryManager>,
        throttle: ThrottleFlag,
        max_rounds: usize,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            manager,
            throttle,
            max_rounds,
            lookup_timeout,
        }
    }

    /// Set while the discovered-nodes consumer is behind.
    pub fn should_throttle(&self) -> bool {
        self.throttle.is_raised()
    }

    /// Look up nodes close to `target`, or to ourselves when `None`.
    pub async fn locate_nodes(
        &self,
        target: Option<NodeId>,
        cancel: &CancellationToken,
    ) -> LookupOutcome {
        let local_id = *self.manager.local_id();
        let target = target.unwrap_or(local_id);
        let k = self.manager.node_table().bucket_size();

        counter!("discovery_lookups").increment(1);

        let mut candidates = self.manager.node_table().find_closest(&target, k).await;
        let mut seen: HashSet<NodeId> = candidates.iter().map(|n| *n.id()).collect();
        seen.insert(local_id);
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut outcome = LookupOutcome::default();

        while outcome.rounds < self.max_rounds {
            if cancel.is_cancelled() {
                break;
            }
            if self.should_throttle() {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Lookup for {} throttled after {} rounds", target, outcome.rounds);
                }
                break;
            }

            let batch: Vec<Node> = candidates
                .iter()
                .filter(|n| !queried.contains(n.id()))
                .take(ALPHA)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }

            outcome.rounds += 1;
            outcome.queried += batch.len();
            queried.extend(batch.iter().map(|n| *n.id()));

            let replies = join_all(batch.iter().map(|node| self.query(node, target, cancel))).await;

            for (node, reply) in batch.iter().zip(replies) {
                let nodes = match reply {
                    Some(nodes) => nodes,
                    None => {
                        candidates.retain(|c| c != node);
                        continue;
                    }
                };

                for learned in nodes {
                    if !seen.insert(*learned.id()) {
                        continue;
                    }
                    // Registers the node so it can be bonded later
                    if self
                        .manager
                        .get_node_lifecycle_manager(&learned, None)
                        .is_none()
                    {
                        continue;
                    }
                    outcome.discovered += 1;
                    candidates.push(learned);
                }
            }

            // Best k of everything known so far
            candidates.sort_by(|a, b| compare_distance(&target, a.id(), b.id()));
            candidates.truncate(k);
        }

        if log::log_enabled!(log::Level::Debug) {
            debug!("Lookup for {} finished: {:?}", target, outcome);
        }
        outcome
    }

    /// One exchange with a candidate, bonding first if needed. `None` means
    /// no usable reply.
    async fn query(
        &self,
        node: &Node,
        target: NodeId,
        cancel: &CancellationToken,
    ) -> Option<Vec<Node>> {
        let lifecycle = self.manager.get_node_lifecycle_manager(node, None)?;

        match lifecycle.state() {
            NodeLifecycleState::Active => {}
            NodeLifecycleState::Unreached | NodeLifecycleState::Bonding => {
                if lifecycle.state() == NodeLifecycleState::Unreached {
                    if let Err(e) = lifecycle.send_ping().await {
                        if log::log_enabled!(log::Level::Debug) {
                            debug!("Cannot bond with {}: {}", node, e);
                        }
                        return None;
                    }
                }

                // Wait one pong timeout plus slack for the timer to fire
                let bond_timeout = self.manager.pong_timeout() + Duration::from_millis(100);
                let state = tokio::select! {
                    _ = cancel.cancelled() => return None,
                    state = lifecycle.wait_while_bonding(bond_timeout) => state,
                };
                if state != NodeLifecycleState::Active {
                    return None;
                }
            }
            NodeLifecycleState::Unreachable | NodeLifecycleState::Replaced => return None,
        }

        let receiver = match lifecycle.send_find_node(target).await {
            Ok(receiver) => receiver,
            Err(e) => {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("FINDNODE to {} failed: {}", node, e);
                }
                lifecycle.on_request_timeout().await;
                return None;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => None,
            reply = tokio::time::timeout(self.lookup_timeout, receiver) => match reply {
                Ok(Ok(nodes)) => {
                    if log::log_enabled!(log::Level::Trace) {
                        trace!("{} returned {} nodes", node, nodes.len());
                    }
                    Some(nodes)
                }
                // Superseded by a concurrent lookup to the same peer
                Ok(Err(_)) => None,
                Err(_) => {
                    if log::log_enabled!(log::Level::Debug) {
                        debug!("No NEIGHBORS from {} in time", node);
                    }
                    lifecycle.on_request_timeout().await;
                    None
                }
            }
        }
    }
}
