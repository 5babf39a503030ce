//! Configuration for the discovery subsystem.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{DiscoveryError, DiscoveryResult};

/// Default discovery port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 2126;

/// Default number of nodes per bucket (Kademlia k parameter).
pub const DEFAULT_BUCKET_SIZE: usize = 16;

/// Default number of distance buckets (one per bit of the node ID).
pub const DEFAULT_BUCKET_COUNT: usize = 256;

const fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

const fn default_bucket_size() -> usize {
    DEFAULT_BUCKET_SIZE
}

const fn default_bucket_count() -> usize {
    DEFAULT_BUCKET_COUNT
}

const fn default_pong_timeout_ms() -> u64 {
    5_000
}

const fn default_discovery_interval_ms() -> u64 {
    30_000
}

const fn default_min_discovery_spacing_ms() -> u64 {
    50
}

const fn default_persistence_interval_ms() -> u64 {
    5_000
}

const fn default_bootstrap_retry_secs() -> u64 {
    10
}

const fn default_lookup_rounds() -> usize {
    8
}

const fn default_lookup_timeout_ms() -> u64 {
    2_000
}

const fn default_event_buffer_size() -> usize {
    64
}

/// Configuration for the discovery subsystem.
#[derive(Debug, Clone, clap::Args, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// UDP port for discovery protocol.
    #[clap(name = "discovery-port", long, default_value_t = default_discovery_port())]
    #[serde(default = "default_discovery_port")]
    pub port: u16,

    /// Bind address for discovery UDP socket.
    ///
    /// If not specified, binds to 0.0.0.0 on the discovery port.
    #[clap(name = "discovery-bind-address", long)]
    #[serde(default)]
    pub bind_address: Option<String>,

    /// Private key for node identity (hex format, 32 bytes).
    ///
    /// If not provided, a new key will be generated on startup.
    #[clap(name = "discovery-private-key", long, env = "DISCOVERY_PRIVATE_KEY")]
    #[serde(default)]
    pub private_key: Option<String>,

    /// Bootstrap nodes to bond with on startup.
    ///
    /// Format: tosnode://<node_id_hex>@<ip>:<port>
    #[clap(name = "discovery-bootstrap", long)]
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,

    /// Kademlia bucket size (k parameter).
    #[clap(name = "discovery-bucket-size", long, default_value_t = default_bucket_size())]
    #[serde(default = "default_bucket_size")]
    pub bucket_size: usize,

    /// Number of distance buckets in the node table.
    #[clap(name = "discovery-bucket-count", long, default_value_t = default_bucket_count())]
    #[serde(default = "default_bucket_count")]
    pub bucket_count: usize,

    /// How long to wait for a PONG before a bond attempt fails (ms).
    #[clap(name = "discovery-pong-timeout", long, default_value_t = default_pong_timeout_ms())]
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,

    /// Steady-state interval between discovery rounds once the table is
    /// well populated (ms).
    #[clap(name = "discovery-interval", long, default_value_t = default_discovery_interval_ms())]
    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,

    /// Minimum spacing between the end of a discovery round and the start of
    /// the next one (ms).
    #[clap(name = "discovery-min-spacing", long, default_value_t = default_min_discovery_spacing_ms())]
    #[serde(default = "default_min_discovery_spacing_ms")]
    pub min_discovery_spacing_ms: u64,

    /// Interval between peer reputation commits (ms).
    #[clap(name = "discovery-persistence-interval", long, default_value_t = default_persistence_interval_ms())]
    #[serde(default = "default_persistence_interval_ms")]
    pub persistence_interval_ms: u64,

    /// Backoff before retrying a failed bootstrap (seconds).
    #[clap(name = "discovery-bootstrap-retry", long, default_value_t = default_bootstrap_retry_secs())]
    #[serde(default = "default_bootstrap_retry_secs")]
    pub bootstrap_retry_secs: u64,

    /// Maximum rounds of a single node lookup.
    #[clap(name = "discovery-lookup-rounds", long, default_value_t = default_lookup_rounds())]
    #[serde(default = "default_lookup_rounds")]
    pub lookup_rounds: usize,

    /// How long a lookup waits for a NEIGHBORS reply (ms).
    #[clap(name = "discovery-lookup-timeout", long, default_value_t = default_lookup_timeout_ms())]
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,

    /// Capacity of each discovered-nodes event stream.
    #[clap(name = "discovery-event-buffer", long, default_value_t = default_event_buffer_size())]
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    /// Directory of the persisted peer database.
    ///
    /// If not specified, peers are only kept in memory.
    #[clap(name = "discovery-data-dir", long)]
    #[serde(default)]
    pub data_dir: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            bind_address: None,
            private_key: None,
            bootstrap_nodes: Vec::new(),
            bucket_size: DEFAULT_BUCKET_SIZE,
            bucket_count: DEFAULT_BUCKET_COUNT,
            pong_timeout_ms: default_pong_timeout_ms(),
            discovery_interval_ms: default_discovery_interval_ms(),
            min_discovery_spacing_ms: default_min_discovery_spacing_ms(),
            persistence_interval_ms: default_persistence_interval_ms(),
            bootstrap_retry_secs: default_bootstrap_retry_secs(),
            lookup_rounds: default_lookup_rounds(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
            event_buffer_size: default_event_buffer_size(),
            data_dir: None,
        }
    }
}

impl DiscoveryConfig {
    /// Get the bind address for the UDP socket.
    pub fn get_bind_address(&self) -> String {
        self.bind_address
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", self.port))
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn min_discovery_spacing(&self) -> Duration {
        Duration::from_millis(self.min_discovery_spacing_ms)
    }

    pub fn persistence_interval(&self) -> Duration {
        Duration::from_millis(self.persistence_interval_ms)
    }

    pub fn bootstrap_retry(&self) -> Duration {
        Duration::from_secs(self.bootstrap_retry_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    /// Reject values the subsystem cannot run with.
    pub fn validate(&self) -> DiscoveryResult<()> {
        if self.bucket_size == 0 {
            return Err(DiscoveryError::ConfigError(
                "bucket size must be greater than zero".to_string(),
            ));
        }
        if self.bucket_count == 0 || self.bucket_count > DEFAULT_BUCKET_COUNT {
            return Err(DiscoveryError::ConfigError(format!(
                "bucket count must be between 1 and {}",
                DEFAULT_BUCKET_COUNT
            )));
        }
        if self.pong_timeout_ms == 0 || self.persistence_interval_ms == 0 {
            return Err(DiscoveryError::ConfigError(
                "timeouts and intervals must be greater than zero".to_string(),
            ));
        }
        if self.event_buffer_size == 0 {
            return Err(DiscoveryError::ConfigError(
                "event buffer size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
