//! tosnode:// addresses used to configure bootnodes.
//!
//! Format: `tosnode://<node_id_hex>@<ip>:<port>`

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use super::error::{DiscoveryError, DiscoveryResult};
use super::identity::{NodeId, NODE_ID_SIZE};
use super::node::Node;

/// URL scheme for TOS discovery nodes.
pub const TOSNODE_URL_SCHEME: &str = "tosnode://";

/// Parsed tosnode:// URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TosNodeUrl {
    pub node_id: NodeId,
    pub address: SocketAddr,
}

impl TosNodeUrl {
    pub fn new(node_id: NodeId, address: SocketAddr) -> Self {
        Self { node_id, address }
    }

    pub fn from_node(node: &Node) -> Self {
        Self::new(*node.id(), node.address())
    }

    /// Parse a tosnode:// URL string.
    pub fn parse(s: &str) -> DiscoveryResult<Self> {
        let rest = s.trim().strip_prefix(TOSNODE_URL_SCHEME).ok_or_else(|| {
            DiscoveryError::InvalidUrl(format!(
                "URL must start with '{}', got: {}",
                TOSNODE_URL_SCHEME, s
            ))
        })?;

        let (node_id_hex, address_str) = rest.split_once('@').ok_or_else(|| {
            DiscoveryError::InvalidUrl(format!(
                "URL must contain '@' between node_id and address: {}",
                s
            ))
        })?;

        if node_id_hex.len() != NODE_ID_SIZE * 2 {
            return Err(DiscoveryError::InvalidUrl(format!(
                "Node ID must be {} hex characters, got {}",
                NODE_ID_SIZE * 2,
                node_id_hex.len()
            )));
        }
        let node_id = NodeId::from_hex(node_id_hex)
            .map_err(|e| DiscoveryError::InvalidUrl(format!("Invalid node ID: {}", e)))?;

        let address: SocketAddr = address_str.parse().map_err(|e| {
            DiscoveryError::InvalidUrl(format!("Invalid socket address '{}': {}", address_str, e))
        })?;

        Ok(Self { node_id, address })
    }

    pub fn into_node(self) -> Node {
        Node::from_address(self.node_id, self.address)
    }
}

impl fmt::Display for TosNodeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}@{}", TOSNODE_URL_SCHEME, self.node_id, self.address)
    }
}

impl FromStr for TosNodeUrl {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn sample_node_id() -> NodeId {
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(37);
        }
        NodeId::new(bytes)
    }

    #[test]
    fn test_parse_ipv4_and_ipv6() {
        let node_id = sample_node_id();

        let v4: TosNodeUrl = format!("tosnode://{}@192.168.1.1:2126", node_id)
            .parse()
            .unwrap();
        assert_eq!(v4.node_id, node_id);
        assert_eq!(
            v4.address,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)), 2126)
        );

        let v6 = TosNodeUrl::parse(&format!("tosnode://{}@[::1]:2126", node_id)).unwrap();
        assert_eq!(v6.address, SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 2126));
    }

    #[test]
    fn test_parse_errors() {
        let node_id = sample_node_id();
        let cases = [
            format!("{}@127.0.0.1:2126", node_id),
            format!("tosnode://{}127.0.0.1:2126", node_id),
            "tosnode://1a2b3c@127.0.0.1:2126".to_string(),
            format!("tosnode://{}@127.0.0.1:2126", "g".repeat(64)),
            format!("tosnode://{}@not-an-address", node_id),
        ];
        for case in cases {
            assert!(
                matches!(TosNodeUrl::parse(&case), Err(DiscoveryError::InvalidUrl(_))),
                "{} should be rejected",
                case
            );
        }
    }

    #[test]
    fn test_display_round_trip_through_node() {
        let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 2126);
        let url = TosNodeUrl::new(sample_node_id(), address);

        let node = url.clone().into_node();
        assert_eq!(node.address(), address);
        assert_eq!(TosNodeUrl::parse(&url.to_string()).unwrap(), url);
        assert_eq!(TosNodeUrl::from_node(&node), url);
    }
}
