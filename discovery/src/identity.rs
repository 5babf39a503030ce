//! Node identity for the discovery protocol.
//!
//! Each node in the discovery network has a unique identity consisting of:
//! - An Ed25519 key pair for signing/verifying datagrams
//! - A node ID derived from the public key (SHA3-256 hash)

use std::cmp::Ordering;
use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use super::error::{DiscoveryError, DiscoveryResult};

/// Size of a node ID in bytes.
pub const NODE_ID_SIZE: usize = 32;

/// Node ID is a 32-byte hash of the node's public key.
///
/// The node ID is used for:
/// - Kademlia distance calculations in the node table
/// - Identifying nodes in FINDNODE requests
/// - Keying persisted peer records
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    pub const fn new(bytes: [u8; NODE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Random ID, used as a lookup target.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Derive the node ID of a public key.
    pub fn from_public_key(public_key: &VerifyingKey) -> Self {
        let digest = Sha3_256::digest(public_key.as_bytes());
        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; NODE_ID_SIZE] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn from_hex(value: &str) -> DiscoveryResult<Self> {
        let bytes = hex::decode(value)
            .map_err(|e| DiscoveryError::InvalidIdentity(format!("invalid hex: {}", e)))?;
        Self::from_slice(&bytes).ok_or_else(|| {
            DiscoveryError::InvalidIdentity(format!(
                "node ID must be {} bytes, got {}",
                NODE_ID_SIZE,
                bytes.len()
            ))
        })
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable
        write!(f, "NodeId({}..)", hex::encode(&self.0[..8]))
    }
}

/// Node identity containing the key pair and derived node ID.
pub struct NodeIdentity {
    /// Ed25519 key pair for signing messages.
    signing_key: SigningKey,
    /// Node ID (SHA3-256 hash of the public key).
    node_id: NodeId,
}

impl NodeIdentity {
    /// Generate a new random node identity.
    pub fn generate() -> Self {
        let secret: [u8; 32] = rand::random();
        Self::from_secret_bytes(&secret)
    }

    /// Create a node identity from raw secret key bytes (32 bytes).
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        let node_id = NodeId::from_public_key(&signing_key.verifying_key());
        Self {
            signing_key,
            node_id,
        }
    }

    /// Create a node identity from a hex encoded secret key.
    pub fn from_secret_hex(value: &str) -> DiscoveryResult<Self> {
        let bytes = hex::decode(value.trim())
            .map_err(|e| DiscoveryError::InvalidIdentity(format!("invalid hex: {}", e)))?;
        let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            DiscoveryError::InvalidIdentity(format!(
                "private key must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        if bytes == [0u8; 32] {
            return Err(DiscoveryError::InvalidIdentity(
                "private key must not be zero".to_string(),
            ));
        }
        Ok(Self::from_secret_bytes(&bytes))
    }

    /// Get the node ID.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Get the public key.
    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Hex encoded secret key, so a generated identity can be reused.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Sign a message with this identity's private key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Verify a signature against this identity's public key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key
            .verifying_key()
            .verify_strict(message, signature)
            .is_ok()
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .field("public_key", &hex::encode(self.public_key().as_bytes()))
            .finish()
    }
}

/// Calculate the XOR distance between two node IDs.
pub fn xor_distance(a: &NodeId, b: &NodeId) -> [u8; NODE_ID_SIZE] {
    let mut result = [0u8; NODE_ID_SIZE];
    for (i, byte) in result.iter_mut().enumerate() {
        *byte = a.0[i] ^ b.0[i];
    }
    result
}

/// Number of leading zero bits of the XOR distance.
///
/// Returns `None` if the IDs are identical.
pub fn common_prefix_bits(a: &NodeId, b: &NodeId) -> Option<usize> {
    let distance = xor_distance(a, b);
    distance
        .iter()
        .position(|byte| *byte != 0)
        .map(|i| i * 8 + distance[i].leading_zeros() as usize)
}

/// Calculate the log2 distance between two node IDs.
///
/// This returns the index of the most significant bit that differs between
/// the two IDs (0 = only the last bit differs, 255 = the first bit differs).
///
/// Returns `None` if the IDs are identical.
pub fn log2_distance(a: &NodeId, b: &NodeId) -> Option<u8> {
    common_prefix_bits(a, b).map(|bits| 255u8.saturating_sub(bits as u8))
}

/// Compare two XOR distances.
///
/// Returns `Ordering::Less` if `a` is closer to `target` than `b`.
pub fn compare_distance(target: &NodeId, a: &NodeId, b: &NodeId) -> Ordering {
    // Big-endian byte arrays compare like the integers they encode
    xor_distance(target, a).cmp(&xor_distance(target, b))
}
