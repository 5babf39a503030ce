//! Protocol messages and the signed datagram format.
//!
//! Message types:
//! - PING: Liveness check, starts bonding
//! - PONG: Response to PING, echoes the ping token
//! - FINDNODE: Request nodes close to a target ID
//! - NEIGHBORS: Response with node list
//!
//! Datagram layout: `public_key (32) | signature (64) | payload`, the
//! signature covering the bincode encoded payload. The sender's node ID is
//! derived from the public key, so every datagram authenticates its origin.

use ed25519_dalek::{Signature, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use serde::{Deserialize, Serialize};

use super::error::{DiscoveryError, DiscoveryResult};
use super::identity::{NodeId, NodeIdentity};
use super::node::Node;
use super::time::{get_current_time_in_seconds, TimestampSeconds};

/// Maximum packet size in bytes.
pub const MAX_PACKET_SIZE: usize = 1280;

/// Size of the authentication header preceding the payload.
pub const HEADER_SIZE: usize = PUBLIC_KEY_LENGTH + SIGNATURE_LENGTH;

/// Expiration window in seconds for message validity.
pub const EXPIRATION_WINDOW: u64 = 20;

/// Maximum acceptable clock drift in seconds (2x expiration window).
pub const MAX_CLOCK_DRIFT: u64 = EXPIRATION_WINDOW * 2;

/// Maximum number of neighbors in a NEIGHBORS response.
pub const MAX_NEIGHBORS: usize = 16;

/// PING message for liveness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Random token echoed by the PONG.
    pub token: u64,
    pub expiration: TimestampSeconds,
}

/// PONG message as response to PING.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub ping_token: u64,
    pub expiration: TimestampSeconds,
}

/// FINDNODE request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNode {
    pub target: NodeId,
    pub expiration: TimestampSeconds,
}

/// NEIGHBORS response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbors {
    pub nodes: Vec<Node>,
    pub expiration: TimestampSeconds,
}

/// Discovery protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Ping(Ping),
    Pong(Pong),
    FindNode(FindNode),
    Neighbors(Neighbors),
}

fn next_expiration() -> TimestampSeconds {
    get_current_time_in_seconds().saturating_add(EXPIRATION_WINDOW)
}

impl Message {
    pub fn ping(token: u64) -> Self {
        Message::Ping(Ping {
            token,
            expiration: next_expiration(),
        })
    }

    pub fn pong(ping_token: u64) -> Self {
        Message::Pong(Pong {
            ping_token,
            expiration: next_expiration(),
        })
    }

    pub fn find_node(target: NodeId) -> Self {
        Message::FindNode(FindNode {
            target,
            expiration: next_expiration(),
        })
    }

    pub fn neighbors(mut nodes: Vec<Node>) -> Self {
        nodes.truncate(MAX_NEIGHBORS);
        Message::Neighbors(Neighbors {
            nodes,
            expiration: next_expiration(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ping(_) => "PING",
            Message::Pong(_) => "PONG",
            Message::FindNode(_) => "FINDNODE",
            Message::Neighbors(_) => "NEIGHBORS",
        }
    }

    pub fn expiration(&self) -> TimestampSeconds {
        match self {
            Message::Ping(m) => m.expiration,
            Message::Pong(m) => m.expiration,
            Message::FindNode(m) => m.expiration,
            Message::Neighbors(m) => m.expiration,
        }
    }

    /// Not expired and not too far in the future, which would allow
    /// long-lived replays.
    pub fn is_expiration_valid(&self, now: TimestampSeconds) -> bool {
        let expiration = self.expiration();
        expiration > now && expiration <= now.saturating_add(MAX_CLOCK_DRIFT)
    }
}

/// Encode and sign a message.
pub fn seal(identity: &NodeIdentity, message: &Message) -> DiscoveryResult<Vec<u8>> {
    let payload = bincode::serialize(message)?;
    let signature = identity.sign(&payload);

    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len());
    data.extend_from_slice(identity.public_key().as_bytes());
    data.extend_from_slice(&signature.to_bytes());
    data.extend_from_slice(&payload);

    if data.len() > MAX_PACKET_SIZE {
        return Err(DiscoveryError::PacketTooLarge(data.len(), MAX_PACKET_SIZE));
    }
    Ok(data)
}

/// Authenticate and decode a datagram, returning the sender's node ID.
///
/// Expiration is checked too: a stale message is rejected before it reaches
/// any lifecycle manager.
pub fn open(data: &[u8], now: TimestampSeconds) -> DiscoveryResult<(NodeId, Message)> {
    if data.len() > MAX_PACKET_SIZE {
        return Err(DiscoveryError::PacketTooLarge(data.len(), MAX_PACKET_SIZE));
    }
    if data.len() <= HEADER_SIZE {
        return Err(DiscoveryError::InvalidPacketSize(HEADER_SIZE + 1, data.len()));
    }

    let (key_bytes, rest) = data.split_at(PUBLIC_KEY_LENGTH);
    let (signature_bytes, payload) = rest.split_at(SIGNATURE_LENGTH);

    let key_bytes: [u8; PUBLIC_KEY_LENGTH] = key_bytes
        .try_into()
        .map_err(|_| DiscoveryError::InvalidSignature)?;
    let signature_bytes: [u8; SIGNATURE_LENGTH] = signature_bytes
        .try_into()
        .map_err(|_| DiscoveryError::InvalidSignature)?;

    let public_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| DiscoveryError::InvalidSignature)?;
    let signature = Signature::from_bytes(&signature_bytes);
    public_key
        .verify_strict(payload, &signature)
        .map_err(|_| DiscoveryError::InvalidSignature)?;

    let message: Message = bincode::deserialize(payload)?;
    if !message.is_expiration_valid(now) {
        return Err(DiscoveryError::MessageExpired(message.expiration(), now));
    }

    Ok((NodeId::from_public_key(&public_key), message))
}
