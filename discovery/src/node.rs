//! Peer identity as seen by the discovery subsystem.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use super::identity::NodeId;

/// A discovery peer: its ID and the endpoint it is reachable on.
///
/// Nodes are immutable. When a peer shows up on a new endpoint a new `Node`
/// is constructed. Two nodes are equal when their IDs are equal.
#[derive(Clone, Serialize, Deserialize)]
pub struct Node {
    id: NodeId,
    host: IpAddr,
    port: u16,
}

impl Node {
    pub fn new(id: NodeId, host: IpAddr, port: u16) -> Self {
        Self { id, host, port }
    }

    pub fn from_address(id: NodeId, address: SocketAddr) -> Self {
        Self::new(id, address.ip(), address.port())
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// A node we can actually send datagrams to.
    pub fn is_valid(&self) -> bool {
        self.port != 0 && !self.host.is_unspecified() && !self.host.is_multicast()
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("address", &self.address())
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address())
    }
}
