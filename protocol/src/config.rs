//! # Protocol Configuration & Constants
//!
//! Every magic number in the triad matrix lives here. If you're hardcoding a
//! constant somewhere else, move it here first.
//!
//! The consensus constants (neighbor weights, validator bonuses) are part of
//! the scoring function's observable behavior. Changing them changes which
//! triads validate, so nodes running different values will disagree.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Matrix Defaults
// ---------------------------------------------------------------------------

/// Default cube edge length. Positions are sampled from `[0, 3)` per axis.
pub const DEFAULT_DIMENSIONS: u32 = 3;

/// Default maximum Euclidean distance at which two triads are "connected".
pub const DEFAULT_COMPLEXITY: u32 = 4;

/// Default score a triad needs to become validated.
pub const DEFAULT_CONSENSUS_THRESHOLD: f64 = 0.67;

// ---------------------------------------------------------------------------
// Consensus Weights
// ---------------------------------------------------------------------------

/// Weight applied to a connection whose neighbor is still pending.
pub const UNVALIDATED_NEIGHBOR_WEIGHT: f64 = 0.5;

/// Bonus added when the validating address is a registered validator.
pub const REGISTERED_VALIDATOR_BONUS: f64 = 0.1;

/// Bonus added when the validating address is not registered.
pub const UNREGISTERED_VALIDATOR_BONUS: f64 = 0.05;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Literal tag every wallet address starts with.
pub const ADDRESS_PREFIX: &str = "TRD";

/// Total address length in characters, prefix included.
pub const ADDRESS_LENGTH: usize = 35;

/// Hex length of an exported secp256k1 private key.
pub const PRIVATE_KEY_HEX_LENGTH: usize = 64;

/// Triad ids are 128 random bits.
pub const TRIAD_ID_BYTES: usize = 16;

// ---------------------------------------------------------------------------
// Storage Keys
// ---------------------------------------------------------------------------

/// Name of the sled tree holding the matrix namespace.
pub const MATRIX_TREE: &str = "matrix";

/// Key prefix for triad records. Iterating this prefix yields only triads.
pub const TRIAD_KEY_PREFIX: &str = "triad:";

/// Key holding matrix parameters and the validator set.
pub const METADATA_KEY: &str = "matrix:state_metadata";

// ---------------------------------------------------------------------------
// Network Parameters
// ---------------------------------------------------------------------------

/// Default P2P listening port.
pub const DEFAULT_P2P_PORT: u16 = 6001;

/// Default logical network. Peers on other networks are refused at handshake.
pub const DEFAULT_NETWORK_ID: &str = "triad-devnet";

/// Maximum number of connected peers.
pub const MAX_PEERS: usize = 50;

/// Outbound connection attempts are abandoned after this long.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the node checks whether it should announce itself.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);

/// Hop budget stamped on locally originated `NEW_TRIAD` messages.
pub const GOSSIP_TTL: u8 = 8;

/// Triad ids remembered for flood deduplication. When exceeded, the oldest
/// quarter is forgotten.
pub const SEEN_CACHE_SIZE: usize = 100_000;

/// Capacity of the store's event broadcast channel. Slow subscribers that
/// fall further behind than this observe a lag and skip ahead. The gossip
/// runtime uses a lossless listener instead.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Configuration Structs
// ---------------------------------------------------------------------------

/// Parameters of the matrix space. Persisted with the store metadata.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixConfig {
    /// Cube edge length.
    pub dimensions: u32,
    /// Maximum neighbor distance considered connected.
    pub complexity: u32,
    /// Score at or above which a triad validates.
    pub consensus_threshold: f64,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_DIMENSIONS,
            complexity: DEFAULT_COMPLEXITY,
            consensus_threshold: DEFAULT_CONSENSUS_THRESHOLD,
        }
    }
}

impl MatrixConfig {
    /// Checks parameter ranges. Returns a description of the first violation.
    pub fn validate(&self) -> Result<(), String> {
        if self.dimensions == 0 {
            return Err("dimensions must be at least 1".to_string());
        }
        if self.complexity == 0 {
            return Err("complexity must be positive".to_string());
        }
        if !(self.consensus_threshold > 0.0 && self.consensus_threshold <= 1.0) {
            return Err(format!(
                "consensus threshold {} is outside (0, 1]",
                self.consensus_threshold
            ));
        }
        Ok(())
    }
}

/// Runtime settings for a gossip node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Identifier advertised in handshakes.
    pub node_id: String,
    /// Logical network; must match the remote's for a handshake to succeed.
    pub network_id: String,
    /// Socket address to listen on. Port 0 picks a free port.
    pub listen_addr: std::net::SocketAddr,
    /// Address other nodes should dial to reach us, if known.
    pub advertised_address: Option<String>,
    /// Peer capacity, inbound and outbound combined.
    pub max_peers: usize,
    /// Bound on outbound connection establishment.
    pub handshake_timeout: Duration,
    /// Discovery timer period.
    pub discovery_interval: Duration,
    /// Hop budget for locally originated `NEW_TRIAD` messages.
    pub gossip_ttl: u8,
    /// Capacity of the flood deduplication cache.
    pub seen_cache_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            network_id: DEFAULT_NETWORK_ID.to_string(),
            listen_addr: std::net::SocketAddr::from(([0, 0, 0, 0], DEFAULT_P2P_PORT)),
            advertised_address: None,
            max_peers: MAX_PEERS,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            discovery_interval: DISCOVERY_INTERVAL,
            gossip_ttl: GOSSIP_TTL,
            seen_cache_size: SEEN_CACHE_SIZE,
        }
    }
}
