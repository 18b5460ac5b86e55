//! Peer bookkeeping for the gossip engine.
//!
//! The table is owned by a single [`GossipProtocol`](super::GossipProtocol)
//! and never shared. Addresses stored here are always in normalized
//! `ws://host:port` form.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::matrix::now_millis;

/// Locally assigned connection id. Never reused within a process.
pub type PeerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A connected peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub id: PeerId,
    pub direction: Direction,
    /// Dialable address: the one we dialed, or the one the peer advertised.
    pub address: Option<String>,
    /// Socket address of an inbound connection.
    pub remote_addr: Option<SocketAddr>,
    /// Remote node id, known after its handshake.
    pub node_id: Option<String>,
    pub handshaken: bool,
    /// Unix milliseconds.
    pub connected_at: u64,
}

#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<PeerId, Peer>,
    /// Outbound dials that have not completed yet.
    pending: HashSet<String>,
    next_id: PeerId,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connected peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Connected peers plus dials in flight. Capacity checks use this.
    pub fn occupancy(&self) -> usize {
        self.peers.len() + self.pending.len()
    }

    pub fn insert(
        &mut self,
        direction: Direction,
        address: Option<String>,
        remote_addr: Option<SocketAddr>,
    ) -> PeerId {
        self.next_id += 1;
        let id = self.next_id;
        self.peers.insert(
            id,
            Peer {
                id,
                direction,
                address,
                remote_addr,
                node_id: None,
                handshaken: false,
                connected_at: now_millis(),
            },
        );
        id
    }

    pub fn remove(&mut self, id: PeerId) -> Option<Peer> {
        self.peers.remove(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    /// `true` once the peer's handshake was accepted.
    pub fn is_handshaken(&self, id: PeerId) -> bool {
        self.peers.get(&id).is_some_and(|p| p.handshaken)
    }

    /// Peers sorted by id.
    pub fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.values().cloned().collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    /// Marks an outbound dial as in flight. Returns `false` if it already was.
    pub fn mark_pending(&mut self, address: &str) -> bool {
        self.pending.insert(address.to_string())
    }

    pub fn clear_pending(&mut self, address: &str) -> bool {
        self.pending.remove(address)
    }

    /// Returns `true` if `address` is connected or being dialed.
    pub fn is_known(&self, address: &str) -> bool {
        self.pending.contains(address)
            || self
                .peers
                .values()
                .any(|p| p.address.as_deref() == Some(address))
    }

    /// Dialable addresses of connected peers, excluding `except`.
    pub fn addresses(&self, except: Option<PeerId>) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .peers
            .values()
            .filter(|p| Some(p.id) != except)
            .filter_map(|p| p.address.clone())
            .collect();
        addresses.sort();
        addresses.dedup();
        addresses
    }
}
