// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Triad Protocol: Core Library
//!
//! A replicated store of signed data records ("triads") placed at integer
//! coordinates in a cube. A triad becomes validated when its neighborhood
//! in the cube scores high enough; nodes flood new triads and validation
//! results to each other over WebSocket.
//!
//! ## Architecture
//!
//! - **config**: protocol constants, `MatrixConfig`, `NodeConfig`.
//! - **crypto**: hash helpers (SHA-256, RIPEMD-160, HASH160).
//! - **identity**: secp256k1 wallet, address derivation, signatures.
//! - **storage**: `MatrixDB`, the sled-backed durable layer.
//! - **matrix**: triad model, consensus scoring, `TriadStore`, events.
//! - **network**: wire messages, gossip engine, socket runtime, status client.
//!
//! ## Quick look
//!
//! ```no_run
//! use std::sync::Arc;
//! use triad_protocol::config::{MatrixConfig, NodeConfig};
//! use triad_protocol::matrix::TriadStore;
//! use triad_protocol::network::GossipNode;
//! use triad_protocol::storage::MatrixDB;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(TriadStore::new(MatrixDB::open("./data")?, MatrixConfig::default())?);
//! store.initialize()?;
//!
//! let node = GossipNode::start(NodeConfig::default(), Arc::clone(&store)).await?;
//! node.connect("ws://10.0.0.2:6001").await?;
//!
//! store.create_triad(serde_json::json!({"hello": "matrix"}), "TRD...")?;
//! node.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod identity;
pub mod matrix;
pub mod network;
pub mod storage;
