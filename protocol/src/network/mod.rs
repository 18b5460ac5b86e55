//! # Network Module
//!
//! Peer-to-peer replication of the triad matrix over WebSocket.
//!
//! ```text
//! message.rs  Wire messages and their JSON codec
//! peer.rs     Peer table owned by the gossip engine
//! gossip.rs   Protocol engine: frames and events in, actions out (no I/O)
//! node.rs     Socket runtime: listener, dials, per-peer tasks, NodeHandle
//! client.rs   One-shot status query
//! ```
//!
//! Trust is open: any node that presents the same network id is accepted.

pub mod client;
pub mod gossip;
pub mod message;
pub mod node;
pub mod peer;

pub use client::query_status;
pub use gossip::{normalize_address, GossipAction, GossipProtocol};
pub use message::{
    Discovery, ErrorPayload, Handshake, Message, NewTriad, PeerList, ProtocolError, ValidateTriad,
};
pub use node::{GossipNode, NodeError, NodeHandle, NodeResult};
pub use peer::{Direction, Peer, PeerId, PeerTable};
