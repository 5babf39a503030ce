//! UDP peer discovery for TOS nodes.
//!
//! Finds peers with a Kademlia-style iterative lookup, qualifies them with a
//! ping/pong bond before trusting them, and keeps their reputation across
//! restarts.
//!
//! ## Components
//!
//! - **Node table**: distance buckets of bonded peers
//! - **Lifecycle managers**: one state machine per peer
//!   (`Unreached -> Bonding -> Active`, `Unreachable`, `Replaced`)
//! - **Discovery manager**: owns the lifecycle managers, dispatches inbound
//!   messages and raises node added/removed events
//! - **Nodes locator**: the iterative lookup
//! - **Network storage**: persisted peers and reputation
//! - **Discovery app**: bootstrap, discovery and persistence loops, and the
//!   discovered-nodes stream
//!
//! ## Message Types
//!
//! | Type | Description |
//! |------|-------------|
//! | PING | Liveness check, starts bonding |
//! | PONG | Response to PING, echoes its token |
//! | FINDNODE | Request nodes close to a target ID |
//! | NEIGHBORS | Response with up to 16 nodes |
//!
//! ## Node URL Format
//!
//! ```text
//! tosnode://<node_id_hex>@<ip>:<port>
//! ```
//!
//! ## Constants
//!
//! - Default discovery port: 2126
//! - K-bucket size: 16 nodes
//! - Alpha (parallel lookups): 3
//! - Max packet size: 1280 bytes
//! - Message expiration: 20 seconds

pub mod app;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod lifecycle;
pub mod locator;
pub mod manager;
pub mod messages;
pub mod node;
pub mod node_table;
pub mod schedule;
pub mod storage;
pub mod time;
pub mod transport;
pub mod url;

pub use app::{load_identity, BootstrapOutcome, DiscoveryApp};
pub use config::DiscoveryConfig;
pub use error::{DiscoveryError, DiscoveryResult};
pub use identity::{NodeId, NodeIdentity};
pub use lifecycle::{NodeLifecycleManager, NodeLifecycleState};
pub use locator::{LookupOutcome, NodesLocator};
pub use manager::{DiscoveryManager, NodeEvent, NodeEventHandler, SubscriptionId};
pub use messages::Message;
pub use node::Node;
pub use node_table::{AddResult, NodeTable};
pub use storage::{MemoryNetworkStorage, NetworkNode, NetworkStorage, RocksNetworkStorage};
pub use transport::{MessageSender, UdpChannel};
pub use url::TosNodeUrl;
