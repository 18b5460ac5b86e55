// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Triad Node
//!
//! Entry point for the `triad-node` binary. Parses CLI arguments, initializes
//! logging, opens the matrix store, and runs the gossip node until a shutdown
//! signal arrives.
//!
//! The binary supports five subcommands:
//!
//! - `run`     start the node
//! - `init`    create the data directory and a wallet key
//! - `status`  query a running node over the peer protocol
//! - `keygen`  print a fresh key pair
//! - `version` print build version information

mod cli;
mod keyfile;
mod logging;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;

use triad_protocol::config::{MatrixConfig, NodeConfig, DEFAULT_NETWORK_ID};
use triad_protocol::identity::Wallet;
use triad_protocol::matrix::{MatrixEvent, TriadStore};
use triad_protocol::network::{self, GossipNode};
use triad_protocol::storage::MatrixDB;

use cli::{Commands, TriadNodeCli};
use keyfile::KeySource;

/// Subdirectory of the data directory holding the sled database.
const DB_DIR: &str = "matrix";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = TriadNodeCli::parse();
    logging::init_logging(&cli.log_level, cli.log_format)?;

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Status(args) => query_status(args).await,
        Commands::Keygen => keygen(),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the store and the gossip node, then waits for a shutdown signal.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    tracing::info!(
        data_dir = %args.data_dir.display(),
        p2p_port = args.p2p_port,
        network_id = %args.network_id,
        "starting triad-node"
    );

    std::fs::create_dir_all(&args.data_dir).with_context(|| {
        format!(
            "failed to create data directory: {}",
            args.data_dir.display()
        )
    })?;

    // --- Wallet ---
    let (wallet, source) = keyfile::load_or_create(&args.data_dir, args.private_key.as_deref())?;
    let address = wallet
        .address()
        .context("wallet has no key loaded")?
        .to_string();
    match source {
        KeySource::Generated => tracing::warn!(
            address = %address,
            path = %keyfile::wallet_path(&args.data_dir).display(),
            "no wallet found, generated a new one"
        ),
        _ => tracing::info!(address = %address, source = ?source, "wallet loaded"),
    }

    // --- Matrix store ---
    let db_path = args.data_dir.join(DB_DIR);
    let db = MatrixDB::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    let matrix_config = MatrixConfig {
        dimensions: args.dimensions,
        complexity: args.complexity,
        consensus_threshold: args.consensus_threshold,
    };
    let store = Arc::new(TriadStore::new(db, matrix_config).context("invalid matrix parameters")?);

    let mut events = store.subscribe();
    store
        .start()
        .await
        .context("store initialization task failed")?;
    wait_for_initialization(&mut events).await?;

    if store.add_validator(&address)? {
        tracing::info!(address = %address, "registered wallet as validator");
    }

    // --- Gossip node ---
    let node_config = NodeConfig {
        node_id: args
            .node_id
            .unwrap_or_else(|| NodeConfig::default().node_id),
        network_id: args.network_id,
        listen_addr: SocketAddr::new(args.host, args.p2p_port),
        advertised_address: args.advertise,
        max_peers: args.max_peers,
        ..NodeConfig::default()
    };
    let node = GossipNode::start(node_config, Arc::clone(&store))
        .await
        .context("failed to start gossip node")?;

    for peer in &args.peers {
        tracing::info!(peer = %peer, "dialing bootstrap peer");
        node.connect(peer).await?;
    }

    let event_log = tokio::spawn(log_events(store.subscribe()));

    shutdown_signal().await;
    tracing::info!("shutdown signal received");

    event_log.abort();
    if let Err(e) = node.shutdown().await {
        tracing::error!(error = %e, "shutdown did not complete cleanly");
    }
    tracing::info!("triad-node stopped");
    Ok(())
}

/// Waits for the store to report the outcome of its load.
async fn wait_for_initialization(events: &mut broadcast::Receiver<MatrixEvent>) -> Result<()> {
    loop {
        match events.recv().await {
            Ok(MatrixEvent::Initialized) => return Ok(()),
            Ok(MatrixEvent::Error(message)) => bail!("matrix store failed to load: {message}"),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => {
                bail!("matrix store closed before initializing")
            }
        }
    }
}

async fn log_events(mut events: broadcast::Receiver<MatrixEvent>) {
    loop {
        match events.recv().await {
            Ok(MatrixEvent::TriadCreated(t)) | Ok(MatrixEvent::TriadImported(t)) => {
                tracing::debug!(triad_id = %t.id, validator = %t.validator, "triad stored");
            }
            Ok(MatrixEvent::TriadValidated(t)) | Ok(MatrixEvent::ValidationImported(t)) => {
                tracing::debug!(
                    triad_id = %t.id,
                    validated = t.validated,
                    consensus = t.consensus,
                    "triad validation updated"
                );
            }
            Ok(event) => tracing::debug!(kind = event.kind(), "store event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Creates the data directory and writes a new wallet key.
fn init_node(args: cli::InitArgs) -> Result<()> {
    let data_dir = &args.data_dir;
    tracing::info!(data_dir = %data_dir.display(), "initializing node");

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let key_path = keyfile::wallet_path(data_dir);
    let wallet = keyfile::create_wallet(&key_path, args.force)?;
    let address = wallet.address().context("wallet has no key loaded")?;
    let public_key = wallet.public_key().context("wallet has no key loaded")?;

    tracing::info!(address = %address, key_path = %key_path.display(), "wallet generated");

    println!("Node initialized successfully.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Wallet key     : {}", key_path.display());
    println!("  Address        : {address}");
    println!("  Public key     : {public_key}");

    Ok(())
}

/// Queries a running node and prints its matrix state.
async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let snapshot = network::query_status(
        &args.address,
        &args.network_id,
        Duration::from_secs(args.timeout),
    )
    .await
    .with_context(|| format!("status query to {} failed", args.address))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let validated = snapshot.triads.iter().filter(|t| t.validated).count();
    println!("Matrix at {}", args.address);
    println!(
        "  Dimensions  : {0}x{0}x{0}, complexity {1}",
        snapshot.dimensions, snapshot.complexity
    );
    println!("  Threshold   : {}", snapshot.consensus_threshold);
    println!(
        "  Triads      : {} ({validated} validated)",
        snapshot.triads_count
    );
    println!("  Validators  : {}", snapshot.validators.len());
    println!("  Initialized : {}", snapshot.is_initialized);
    Ok(())
}

/// Prints a fresh key pair as JSON. Nothing is written to disk.
fn keygen() -> Result<()> {
    let pair = Wallet::new().generate_key_pair();
    println!("{}", serde_json::to_string_pretty(&pair)?);
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("triad-node {}", env!("CARGO_PKG_VERSION"));
    println!("network    {DEFAULT_NETWORK_ID} (default)");
    println!("rustc      {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. If a handler cannot be
/// installed, that signal is simply never observed.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
