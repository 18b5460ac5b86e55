//! # CLI Interface
//!
//! Defines the command-line argument structure for `triad-node` using
//! `clap` derive. Every option can also be set through a `TRIAD_*`
//! environment variable.

use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::logging::LogFormat;
use triad_protocol::config::{
    DEFAULT_COMPLEXITY, DEFAULT_CONSENSUS_THRESHOLD, DEFAULT_DIMENSIONS, DEFAULT_NETWORK_ID,
    DEFAULT_P2P_PORT, MAX_PEERS,
};

/// Triad matrix node.
///
/// Stores triads, scores them by spatial consensus, and replicates them to
/// peers over WebSocket gossip.
#[derive(Parser, Debug)]
#[command(
    name = "triad-node",
    about = "Triad matrix node",
    version,
    propagate_version = true
)]
pub struct TriadNodeCli {
    /// Log filter used when `RUST_LOG` is not set.
    #[arg(
        long,
        global = true,
        env = "TRIAD_LOG",
        default_value = "triad_node=info,triad_protocol=info"
    )]
    pub log_level: String,

    /// Log output format.
    #[arg(
        long,
        global = true,
        env = "TRIAD_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Pretty
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Create the data directory and a wallet key file.
    Init(InitArgs),
    /// Ask a running node for its matrix state.
    Status(StatusArgs),
    /// Print a fresh key pair and its address.
    Keygen,
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Directory holding the matrix database and `wallet.key`.
    ///
    /// Created on first run if it does not exist.
    #[arg(long, short = 'd', env = "TRIAD_DATA_DIR", default_value = ".triad")]
    pub data_dir: PathBuf,

    /// Interface to listen on for peer connections.
    #[arg(long, env = "TRIAD_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port for peer connections.
    #[arg(long, short = 'p', env = "TRIAD_P2P_PORT", default_value_t = DEFAULT_P2P_PORT)]
    pub p2p_port: u16,

    /// Address other nodes should dial to reach this one (`host:port`).
    #[arg(long, env = "TRIAD_ADVERTISE")]
    pub advertise: Option<String>,

    /// Bootstrap peers, comma separated (`host:port` or `ws://host:port`).
    #[arg(long, env = "TRIAD_PEERS", value_delimiter = ',')]
    pub peers: Vec<String>,

    /// Logical network. Peers on a different network are refused.
    #[arg(long, env = "TRIAD_NETWORK_ID", default_value = DEFAULT_NETWORK_ID)]
    pub network_id: String,

    /// Node id sent in handshakes. A random one is used when omitted.
    #[arg(long, env = "TRIAD_NODE_ID")]
    pub node_id: Option<String>,

    #[arg(long, env = "TRIAD_MAX_PEERS", default_value_t = MAX_PEERS)]
    pub max_peers: usize,

    /// Matrix edge length. Ignored once the database has been initialized.
    #[arg(long, env = "TRIAD_DIMENSIONS", default_value_t = DEFAULT_DIMENSIONS)]
    pub dimensions: u32,

    /// Maximum neighbor distance. Ignored once the database has been initialized.
    #[arg(long, env = "TRIAD_COMPLEXITY", default_value_t = DEFAULT_COMPLEXITY)]
    pub complexity: u32,

    /// Validation threshold. Ignored once the database has been initialized.
    #[arg(long, env = "TRIAD_CONSENSUS_THRESHOLD", default_value_t = DEFAULT_CONSENSUS_THRESHOLD)]
    pub consensus_threshold: f64,

    /// Hex-encoded secp256k1 private key. Overrides `wallet.key`.
    ///
    /// Prefer the key file; command lines end up in shell history.
    #[arg(long, env = "TRIAD_PRIVATE_KEY", hide_env_values = true)]
    pub private_key: Option<String>,
}

/// Arguments for the `init` subcommand.
#[derive(Args, Debug)]
pub struct InitArgs {
    #[arg(long, short = 'd', env = "TRIAD_DATA_DIR", default_value = ".triad")]
    pub data_dir: PathBuf,

    /// Replace an existing `wallet.key`.
    #[arg(long)]
    pub force: bool,
}

/// Arguments for the `status` subcommand.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Peer address of the running node.
    #[arg(long, short = 'a', default_value = "ws://127.0.0.1:6001")]
    pub address: String,

    #[arg(long, env = "TRIAD_NETWORK_ID", default_value = DEFAULT_NETWORK_ID)]
    pub network_id: String,

    /// Seconds to wait for the answer.
    #[arg(long, default_value_t = 5)]
    pub timeout: u64,

    /// Print the full snapshot as JSON instead of a summary.
    #[arg(long)]
    pub json: bool,
}
